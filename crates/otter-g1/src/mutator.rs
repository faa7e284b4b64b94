//! Mutator thread contexts.
//!
//! The runtime registers every thread that touches the heap. A context owns
//! the thread-local barrier buffers and the current TLAB; the collector
//! enumerates contexts to drain the buffers and retire TLABs during pauses.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::address::Address;
use crate::card_table::CardIndex;
use crate::region::Tlab;

/// Per-thread state of a mutator.
pub struct MutatorContext {
    id: usize,
    satb: Mutex<Vec<Address>>,
    post_cards: Mutex<Vec<CardIndex>>,
    post_capacity: usize,
    tlab: Mutex<Option<Arc<Tlab>>>,
}

impl MutatorContext {
    fn new(id: usize, post_capacity: usize) -> Self {
        Self {
            id,
            satb: Mutex::new(Vec::new()),
            post_cards: Mutex::new(Vec::with_capacity(post_capacity)),
            post_capacity,
            tlab: Mutex::new(None),
        }
    }

    /// Registry-assigned id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Append a pre-barrier entry, returning the buffer length.
    pub(crate) fn push_satb(&self, obj: Address) -> usize {
        let mut satb = self.satb.lock();
        satb.push(obj);
        satb.len()
    }

    /// Take the SATB buffer.
    pub(crate) fn take_satb(&self) -> Vec<Address> {
        std::mem::take(&mut *self.satb.lock())
    }

    /// Discard the SATB buffer.
    pub(crate) fn clear_satb(&self) {
        self.satb.lock().clear();
    }

    /// Append a dirty card to the ring; returns the full batch on overflow.
    pub(crate) fn push_card(&self, card: CardIndex) -> Option<Vec<CardIndex>> {
        let mut cards = self.post_cards.lock();
        cards.push(card);
        if cards.len() >= self.post_capacity {
            Some(std::mem::replace(
                &mut *cards,
                Vec::with_capacity(self.post_capacity),
            ))
        } else {
            None
        }
    }

    /// Take the buffered dirty cards.
    pub(crate) fn take_cards(&self) -> Vec<CardIndex> {
        std::mem::take(&mut *self.post_cards.lock())
    }

    /// Number of buffered dirty cards.
    pub fn buffered_cards(&self) -> usize {
        self.post_cards.lock().len()
    }

    /// Number of buffered SATB entries.
    pub fn buffered_satb(&self) -> usize {
        self.satb.lock().len()
    }

    /// Current TLAB.
    pub(crate) fn tlab(&self) -> Option<Arc<Tlab>> {
        self.tlab.lock().clone()
    }

    /// Install a new TLAB.
    pub(crate) fn set_tlab(&self, tlab: Option<Arc<Tlab>>) {
        *self.tlab.lock() = tlab;
    }
}

impl std::fmt::Debug for MutatorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorContext")
            .field("id", &self.id)
            .field("satb", &self.buffered_satb())
            .field("cards", &self.buffered_cards())
            .finish()
    }
}

/// Buffers left behind by threads that have exited.
#[derive(Default)]
pub struct OrphanBuffers {
    /// SATB entries
    pub satb: Vec<Address>,
    /// Dirty cards
    pub cards: Vec<CardIndex>,
}

/// Registry of live mutator threads.
pub struct MutatorRegistry {
    threads: RwLock<Vec<Arc<MutatorContext>>>,
    orphans: Mutex<OrphanBuffers>,
    next_id: AtomicUsize,
    post_capacity: usize,
}

impl MutatorRegistry {
    /// Empty registry.
    pub fn new(post_capacity: usize) -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
            orphans: Mutex::new(OrphanBuffers::default()),
            next_id: AtomicUsize::new(0),
            post_capacity,
        }
    }

    /// Register the calling thread.
    pub fn register(&self) -> Arc<MutatorContext> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(MutatorContext::new(id, self.post_capacity));
        self.threads.write().push(ctx.clone());
        ctx
    }

    /// Unregister a thread, keeping its pending barrier work.
    pub fn unregister(&self, ctx: &MutatorContext) {
        self.threads.write().retain(|t| t.id != ctx.id);
        let mut orphans = self.orphans.lock();
        orphans.satb.extend(ctx.take_satb());
        orphans.cards.extend(ctx.take_cards());
        ctx.set_tlab(None);
    }

    /// Snapshot of the registered threads.
    pub fn threads(&self) -> Vec<Arc<MutatorContext>> {
        self.threads.read().clone()
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// Whether no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    /// Take the buffers of exited threads.
    pub fn take_orphans(&self) -> OrphanBuffers {
        std::mem::take(&mut *self.orphans.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::HEAP_BASE;

    #[test]
    fn post_ring_overflows_in_batches() {
        let registry = MutatorRegistry::new(3);
        let ctx = registry.register();
        assert!(ctx.push_card(1).is_none());
        assert!(ctx.push_card(2).is_none());
        assert_eq!(ctx.push_card(3), Some(vec![1, 2, 3]));
        assert_eq!(ctx.buffered_cards(), 0);
    }

    #[test]
    fn unregister_keeps_pending_work() {
        let registry = MutatorRegistry::new(8);
        let ctx = registry.register();
        ctx.push_satb(Address::new(HEAP_BASE + 64));
        ctx.push_card(7);
        assert_eq!(registry.len(), 1);
        registry.unregister(&ctx);
        assert!(registry.is_empty());
        let orphans = registry.take_orphans();
        assert_eq!(orphans.satb, vec![Address::new(HEAP_BASE + 64)]);
        assert_eq!(orphans.cards, vec![7]);
    }
}
