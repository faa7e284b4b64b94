//! Write barriers.
//!
//! Every reference store into the heap goes through [`BarrierSet::write_ref`]:
//! - Pre-barrier (SATB): while concurrent marking runs, the overwritten value
//!   is logged so the snapshot taken at initial mark stays reachable.
//! - Post-barrier: a store that creates a cross-region reference marks the
//!   slot's card and queues it for remembered-set processing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::address::Address;
use crate::heap::Heap;
use crate::mutator::{MutatorContext, MutatorRegistry};
use crate::update_remset::CardQueue;

/// SATB entries a thread buffers before handing them to the shared list.
pub const SATB_BUFFER_SIZE: usize = 1024;

/// Barrier state shared by all mutators.
pub struct BarrierSet {
    concurrent_marking: AtomicBool,
    satb_buffers: Mutex<Vec<Vec<Address>>>,
    queue: Arc<CardQueue>,
}

impl BarrierSet {
    /// Create the barrier set feeding `queue`.
    pub fn new(queue: Arc<CardQueue>) -> Self {
        Self {
            concurrent_marking: AtomicBool::new(false),
            satb_buffers: Mutex::new(Vec::new()),
            queue,
        }
    }

    /// Shared dirty-card queue.
    pub fn queue(&self) -> &Arc<CardQueue> {
        &self.queue
    }

    /// Turn the pre-barrier on or off.
    pub fn set_concurrent_marking(&self, active: bool) {
        self.concurrent_marking.store(active, Ordering::SeqCst);
    }

    /// Whether the pre-barrier is active.
    #[inline]
    pub fn is_concurrent_marking(&self) -> bool {
        self.concurrent_marking.load(Ordering::Acquire)
    }

    /// Log the value about to be overwritten.
    #[inline]
    pub fn pre_barrier(&self, ctx: &MutatorContext, old_value: Address) {
        if !self.is_concurrent_marking() || old_value.is_null() {
            return;
        }
        if ctx.push_satb(old_value) >= SATB_BUFFER_SIZE {
            self.satb_buffers.lock().push(ctx.take_satb());
        }
    }

    /// Record a possible cross-region reference created by a store.
    #[inline]
    pub fn post_barrier(&self, heap: &Heap, ctx: &MutatorContext, slot: Address, value: Address) {
        if value.is_null() || heap.pool().same_region(slot, value) {
            return;
        }
        let cards = heap.cards();
        let card = cards.index_of(slot);
        if cards.is_young(card) || cards.is_marked(card) {
            return;
        }
        cards.mark(card);
        if let Some(batch) = ctx.push_card(card) {
            self.queue.push(batch);
        }
    }

    /// Store `value` into the reference field at `obj + offset`.
    pub fn write_ref(
        &self,
        heap: &Heap,
        ctx: &MutatorContext,
        obj: Address,
        offset: usize,
        value: Address,
    ) {
        let slot = obj.offset(offset);
        if self.is_concurrent_marking() {
            self.pre_barrier(ctx, heap.load_ref(slot));
        }
        heap.store_ref(slot, value);
        self.post_barrier(heap, ctx, slot, value);
    }

    /// Take every SATB entry buffered anywhere.
    pub fn take_satb_entries(&self, registry: &MutatorRegistry) -> Vec<Address> {
        let mut entries: Vec<Address> = self.satb_buffers.lock().drain(..).flatten().collect();
        for thread in registry.threads() {
            entries.extend(thread.take_satb());
        }
        let orphans = registry.take_orphans();
        entries.extend(orphans.satb);
        self.queue.push(orphans.cards);
        entries
    }

    /// Drop every SATB entry.
    pub fn discard_satb(&self, registry: &MutatorRegistry) {
        self.satb_buffers.lock().clear();
        for thread in registry.threads() {
            thread.clear_satb();
        }
        let orphans = registry.take_orphans();
        self.queue.push(orphans.cards);
    }

    /// Move every thread's buffered dirty cards to the shared queue.
    pub fn flush_post_buffers(&self, registry: &MutatorRegistry) {
        for thread in registry.threads() {
            self.queue.push(thread.take_cards());
        }
        let mut orphans = registry.take_orphans();
        self.queue.push(std::mem::take(&mut orphans.cards));
        if !orphans.satb.is_empty() {
            self.satb_buffers.lock().push(orphans.satb);
        }
    }
}
