//! Remembered-set maintenance.
//!
//! Dirty cards produced by the post-write barrier travel through a bounded
//! [`CardQueue`]. The [`UpdateRemsetWorker`] drains it on a background thread:
//! each card is cleared, then rescanned, and every cross-region reference in
//! it is added to the target region's remembered set.
//!
//! GC pauses stop the worker with a `Pause` control message. The worker
//! acknowledges once its current batch is done (remaining cards of the batch
//! are parked as deferred cards), and the pause then processes whatever is
//! left inline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::address::Address;
use crate::card_table::CardIndex;
use crate::error::GcResult;
use crate::heap::Heap;
use crate::region::Region;

/// Shared queue of dirty-card batches.
pub struct CardQueue {
    tx: Sender<Vec<CardIndex>>,
    rx: Receiver<Vec<CardIndex>>,
    overflow: Mutex<Vec<CardIndex>>,
}

impl CardQueue {
    /// Queue holding at most `capacity` batches before spilling over.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            overflow: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a batch of cards.
    pub fn push(&self, batch: Vec<CardIndex>) {
        if batch.is_empty() {
            return;
        }
        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) | Err(TrySendError::Disconnected(batch)) => {
                self.overflow.lock().extend(batch);
            }
        }
    }

    /// Take every queued card.
    pub fn drain(&self) -> Vec<CardIndex> {
        let mut cards: Vec<CardIndex> = self.rx.try_iter().flatten().collect();
        cards.append(&mut self.overflow.lock());
        cards
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty() && self.overflow.lock().is_empty()
    }

    fn receiver(&self) -> Receiver<Vec<CardIndex>> {
        self.rx.clone()
    }
}

/// Control messages for the background worker.
pub enum RemsetMessage {
    /// Stop after the current batch and acknowledge
    Pause {
        /// Acknowledgement channel
        ack: Sender<()>,
    },
    /// Continue processing
    Resume,
    /// Exit the thread
    Shutdown,
}

/// Record `slot -> value` in the target region's remembered set if the
/// reference leaves `source`.
pub fn add_cross_region_ref(heap: &Heap, source: &Region, slot: Address, value: Address) {
    if source.contains(value) {
        return;
    }
    let target = heap.pool().with_region(value, |target| {
        target.remset().add_ref(slot);
        target.id()
    });
    if let Some(id) = target {
        source.remset().add_ref_region(id);
    }
}

/// Clear a marked card and fold its references into remembered sets.
///
/// Returns `false` when the card was not marked or needs no scan.
pub fn update_remset_for_card(heap: &Heap, card: CardIndex) -> bool {
    let cards = heap.cards();
    if !cards.is_marked(card) {
        return false;
    }
    let start = cards.card_start(card);
    let Some(region) = heap.pool().region_of(start) else {
        cards.clear(card);
        return false;
    };
    cards.clear(card);
    if region.is_young() {
        return false;
    }
    // A store racing with the scan re-marks the card after the clear.
    fence(Ordering::SeqCst);
    heap.refs_in_range(&region, start, cards.card_end(card), &mut |slot, value| {
        add_cross_region_ref(heap, &region, slot, value);
    });
    true
}

/// Drop every remembered-set entry contributed by `region`.
pub fn invalidate_refs_from(heap: &Heap, region: &Region) {
    for id in region.remset().take_ref_regions() {
        if let Some(target) = heap.pool().region_by_id(id) {
            target.remset().invalidate_range(region.begin(), region.end());
        }
    }
}

/// Background remembered-set updater.
pub struct UpdateRemsetWorker {
    heap: Arc<Heap>,
    queue: Arc<CardQueue>,
    control: Mutex<Option<Sender<RemsetMessage>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    defer_cards: AtomicBool,
    deferred: Mutex<FxHashSet<CardIndex>>,
    min_cards: usize,
}

impl UpdateRemsetWorker {
    /// Create the worker; call [`UpdateRemsetWorker::start`] to run it concurrently.
    pub fn new(heap: Arc<Heap>, queue: Arc<CardQueue>, min_cards: usize) -> Arc<Self> {
        Arc::new(Self {
            heap,
            queue,
            control: Mutex::new(None),
            handle: Mutex::new(None),
            defer_cards: AtomicBool::new(false),
            deferred: Mutex::new(FxHashSet::default()),
            min_cards: min_cards.max(1),
        })
    }

    /// Spawn the background thread.
    pub fn start(self: &Arc<Self>) -> GcResult<()> {
        let (tx, rx) = bounded(4);
        let worker = self.clone();
        let handle = std::thread::Builder::new()
            .name("otter-g1-remset".into())
            .spawn(move || worker.run(rx))?;
        *self.control.lock() = Some(tx);
        *self.handle.lock() = Some(handle);
        tracing::debug!(target: "otter::gc", "update remset worker started");
        Ok(())
    }

    /// Whether the background thread is running.
    pub fn is_concurrent(&self) -> bool {
        self.control.lock().is_some()
    }

    /// Stop and join the background thread.
    pub fn stop(&self) {
        if let Some(tx) = self.control.lock().take() {
            let _ = tx.send(RemsetMessage::Shutdown);
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>, control: Receiver<RemsetMessage>) {
        let cards = self.queue.receiver();
        loop {
            // Control messages win over pending cards.
            if let Ok(msg) = control.try_recv() {
                if !self.handle_control(msg, &control) {
                    break;
                }
                continue;
            }
            select! {
                recv(control) -> msg => match msg {
                    Ok(msg) => {
                        if !self.handle_control(msg, &control) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(cards) -> batch => match batch {
                    Ok(batch) => self.process_batch(batch),
                    Err(_) => break,
                },
            }
        }
        tracing::debug!(target: "otter::gc", "update remset worker stopped");
    }

    fn handle_control(&self, msg: RemsetMessage, control: &Receiver<RemsetMessage>) -> bool {
        match msg {
            RemsetMessage::Pause { ack } => {
                let _ = ack.send(());
                loop {
                    match control.recv() {
                        Ok(RemsetMessage::Resume) => return true,
                        Ok(RemsetMessage::Pause { ack }) => {
                            let _ = ack.send(());
                        }
                        Ok(RemsetMessage::Shutdown) | Err(_) => return false,
                    }
                }
            }
            RemsetMessage::Resume => true,
            RemsetMessage::Shutdown => false,
        }
    }

    fn process_batch(&self, batch: Vec<CardIndex>) {
        let cards: Vec<CardIndex> = {
            let mut pending = self.deferred.lock();
            pending.extend(batch);
            if pending.len() < self.min_cards || self.defer_cards.load(Ordering::Acquire) {
                return;
            }
            pending.drain().collect()
        };
        for (i, &card) in cards.iter().enumerate() {
            if self.defer_cards.load(Ordering::Acquire) {
                self.deferred.lock().extend(&cards[i..]);
                return;
            }
            update_remset_for_card(&self.heap, card);
        }
    }

    /// Stop concurrent processing for a pause.
    ///
    /// Returns once the worker has finished its current batch.
    pub fn suspend_for_gc_pause(&self) {
        self.defer_cards.store(true, Ordering::Release);
        let control = self.control.lock().clone();
        if let Some(tx) = control {
            let (ack_tx, ack_rx) = bounded(1);
            if tx.send(RemsetMessage::Pause { ack: ack_tx }).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    /// Let the worker continue after a pause.
    pub fn resume_after_gc_pause(&self) {
        self.defer_cards.store(false, Ordering::Release);
        let control = self.control.lock().clone();
        if let Some(tx) = control {
            let _ = tx.send(RemsetMessage::Resume);
        }
    }

    /// Take every card that is queued or deferred.
    pub fn drain_all_cards(&self) -> Vec<CardIndex> {
        let mut cards = self.queue.drain();
        cards.extend(self.deferred.lock().drain());
        cards.sort_unstable();
        cards.dedup();
        cards
    }

    /// Process cards on the calling thread during a pause.
    pub fn gc_process_cards(&self, cards: &[CardIndex]) -> usize {
        let mut processed = 0;
        for &card in cards {
            if update_remset_for_card(&self.heap, card) {
                processed += 1;
            }
        }
        processed
    }

    /// Drop remembered-set entries of `regions` during a pause.
    pub fn gc_invalidate_regions(&self, regions: &[Arc<Region>]) {
        for region in regions {
            invalidate_refs_from(&self.heap, region);
        }
    }

}

impl Drop for UpdateRemsetWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::object::{ClassShape, StaticLayout};
    use crate::region::RegionFlags;

    fn setup() -> (Arc<Heap>, Arc<StaticLayout>) {
        let layout = Arc::new(StaticLayout::new());
        let config = GcConfig {
            heap_size: 1024 * 1024,
            region_size: 64 * 1024,
            tlab_size: 1024,
            ..GcConfig::default()
        };
        (Arc::new(Heap::new(&config, layout.clone())), layout)
    }

    fn old_object_pointing_to(heap: &Heap, layout: &StaticLayout) -> (Address, Address) {
        let class = layout.register(ClassShape::Instance {
            size: 32,
            ref_offsets: vec![16],
        });
        let shape = layout.shape(class, 0);
        let src_region = heap.pool().alloc_region(RegionFlags::OLD).unwrap();
        let dst_region = heap.pool().alloc_region(RegionFlags::OLD).unwrap();
        let src = src_region.alloc(shape.size).unwrap();
        let dst = dst_region.alloc(shape.size).unwrap();
        heap.initialize_object(src, shape);
        heap.initialize_object(dst, shape);
        src_region.live_bitmap().set(src);
        dst_region.live_bitmap().set(dst);
        heap.store_ref(src.offset(16), dst);
        heap.cards().mark(heap.cards().index_of(src.offset(16)));
        (src, dst)
    }

    #[test]
    fn card_processing_fills_target_remset() {
        let (heap, layout) = setup();
        let (src, dst) = old_object_pointing_to(&heap, &layout);
        let card = heap.cards().index_of(src.offset(16));
        assert!(update_remset_for_card(&heap, card));
        assert!(!heap.cards().is_marked(card));
        let target = heap.pool().region_of(dst).unwrap();
        assert!(target.remset().contains_ref(src.offset(16)));
        // second pass is a no-op
        assert!(!update_remset_for_card(&heap, card));

        let source = heap.pool().region_of(src).unwrap();
        invalidate_refs_from(&heap, &source);
        assert!(target.remset().is_empty());
    }

    #[test]
    fn queue_spills_into_overflow() {
        let queue = CardQueue::new(1);
        queue.push(vec![1, 2]);
        queue.push(vec![3]);
        queue.push(Vec::new());
        let mut drained = queue.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn background_worker_processes_and_pauses() {
        let (heap, layout) = setup();
        let (src, dst) = old_object_pointing_to(&heap, &layout);
        let queue = Arc::new(CardQueue::new(16));
        let worker = UpdateRemsetWorker::new(heap.clone(), queue.clone(), 1);
        worker.start().unwrap();
        queue.push(vec![heap.cards().index_of(src.offset(16))]);

        let target = heap.pool().region_of(dst).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !target.remset().contains_ref(src.offset(16)) {
            assert!(std::time::Instant::now() < deadline, "worker never processed the card");
            std::thread::yield_now();
        }

        worker.suspend_for_gc_pause();
        let card = heap.cards().index_of(src.offset(16));
        heap.cards().mark(card);
        queue.push(vec![card]);
        // Paused: the card stays queued until the pause drains it.
        let pending = worker.drain_all_cards();
        assert_eq!(pending, vec![card]);
        assert_eq!(worker.gc_process_cards(&pending), 1);
        worker.resume_after_gc_pause();
        worker.stop();
        assert!(!worker.is_concurrent());
    }
}
