//! The G1 collector.
//!
//! [`G1Gc`] owns the heap, the allocator, the barrier set and the background
//! remembered-set worker, and runs the collection cycles:
//!
//! - young: every eden region is evacuated or promoted in place
//! - mixed: young regions plus old regions chosen by garbage
//! - full: whole-heap marking, then old regions compacted in chunks
//! - concurrent marking: initial mark and remark pauses around a trace that
//!   runs alongside the mutators; its results drive mixed collections
//!
//! Pauses are serialized by one lock. A pause requested while concurrent
//! marking runs cancels the marking, which restarts from initial mark in a
//! later cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::address::Address;
use crate::allocator::ObjectAllocatorG1;
use crate::analytics::G1Analytics;
use crate::barrier::BarrierSet;
use crate::collection_set::{
    CollectionSet, FullCollectionChunks, add_old_regions_according_pause_time_goal,
    add_old_regions_max_allowed, have_garbage_regions,
};
use crate::concurrent::{
    CancellationToken, GcPhase, MutatorControl, NoopMutatorControl, PauseGuard, PhaseCell,
};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::evacuation::{EvacuationResult, Evacuator};
use crate::gc_thread::GcThreadMessage;
use crate::heap::Heap;
use crate::marker::{LiveBytesPolicy, MarkMode, Marker, MarkingOutcome};
use crate::mutator::{MutatorContext, MutatorRegistry};
use crate::object::{MARK_WORD_OFFSET, ObjectModel, ObjectShape};
use crate::pause_tracker::G1PauseTracker;
use crate::ref_update::{
    RefCache, RemsetUpdatePolicy, UpdateWork, update_heap_references, update_roots,
};
use crate::region::{Region, RegionFlags};
use crate::roots::RootProvider;
use crate::stats::{CycleRecord, GcListener, GcStats};
use crate::task::{GcCollectionType, GcTask, GcTaskCause};
use crate::update_remset::{CardQueue, UpdateRemsetWorker, add_cross_region_ref};
use crate::verifier::HeapVerifier;
use crate::workers::WorkerPool;

/// Generational region-based collector.
pub struct G1Gc {
    config: GcConfig,
    heap: Arc<Heap>,
    allocator: ObjectAllocatorG1,
    barriers: BarrierSet,
    remset_worker: Arc<UpdateRemsetWorker>,
    mutators: MutatorRegistry,
    roots: RwLock<Vec<Arc<dyn RootProvider>>>,
    listeners: RwLock<Vec<Arc<dyn GcListener>>>,
    mutator_control: Arc<dyn MutatorControl>,
    workers: WorkerPool,
    phase: PhaseCell,
    token: CancellationToken,
    gc_lock: Mutex<()>,
    mixed_required: AtomicBool,
    concurrent_marking: AtomicBool,
    postponed: AtomicBool,
    garbage_threshold: AtomicU32,
    promotion_rate: AtomicU32,
    analytics: G1Analytics,
    pause_tracker: G1PauseTracker,
    stats: GcStats,
    task_tx: Mutex<Option<Sender<GcThreadMessage>>>,
    pending_tasks: Mutex<usize>,
    idle: Condvar,
}

impl G1Gc {
    /// Collector for a runtime that only calls it from safe points.
    pub fn new(config: GcConfig, model: Arc<dyn ObjectModel>) -> GcResult<Arc<Self>> {
        Self::with_mutator_control(config, model, Arc::new(NoopMutatorControl))
    }

    /// Collector that stops mutators through `control` for every pause.
    pub fn with_mutator_control(
        config: GcConfig,
        model: Arc<dyn ObjectModel>,
        control: Arc<dyn MutatorControl>,
    ) -> GcResult<Arc<Self>> {
        config.validate()?;
        let heap = Arc::new(Heap::new(&config, model));
        let allocator = ObjectAllocatorG1::new(&config, heap.clone());
        let queue = Arc::new(CardQueue::new(config.card_queue_capacity));
        let remset_worker = UpdateRemsetWorker::new(
            heap.clone(),
            queue.clone(),
            config.min_concurrent_cards_to_process,
        );
        if config.enable_concurrent_update_remset {
            remset_worker.start()?;
        }
        tracing::info!(
            target: "otter::gc",
            heap_size = config.heap_size,
            region_size = config.region_size,
            regions = config.region_count(),
            workers = config.gc_workers_count,
            "G1 collector initialized"
        );
        Ok(Arc::new(Self {
            heap,
            allocator,
            barriers: BarrierSet::new(queue),
            remset_worker,
            mutators: MutatorRegistry::new(config.post_barrier_buffer_size),
            roots: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            mutator_control: control,
            workers: WorkerPool::new(config.gc_workers_count),
            phase: PhaseCell::new(),
            token: CancellationToken::new(),
            gc_lock: Mutex::new(()),
            mixed_required: AtomicBool::new(false),
            concurrent_marking: AtomicBool::new(false),
            postponed: AtomicBool::new(false),
            garbage_threshold: AtomicU32::new(config.region_garbage_rate_threshold),
            promotion_rate: AtomicU32::new(config.promotion_region_alive_rate),
            analytics: G1Analytics::new(config.predictor_confidence_factor, Instant::now()),
            pause_tracker: G1PauseTracker::new(config.gc_pause_interval_ms, config.max_gc_pause_ms),
            stats: GcStats::new(),
            task_tx: Mutex::new(None),
            pending_tasks: Mutex::new(0),
            idle: Condvar::new(),
            config,
        }))
    }

    /// Active configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Managed heap.
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Object allocator.
    pub fn allocator(&self) -> &ObjectAllocatorG1 {
        &self.allocator
    }

    /// Write barriers.
    pub fn barriers(&self) -> &BarrierSet {
        &self.barriers
    }

    /// Cycle statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Phase the collector is in.
    pub fn phase(&self) -> GcPhase {
        self.phase.get()
    }

    /// Pause predictions.
    pub fn analytics(&self) -> &G1Analytics {
        &self.analytics
    }

    /// Background remembered-set worker.
    pub fn remset_worker(&self) -> &Arc<UpdateRemsetWorker> {
        &self.remset_worker
    }

    // ---- registration ----

    /// Register a mutator thread.
    pub fn register_mutator(&self) -> Arc<MutatorContext> {
        self.mutators.register()
    }

    /// Unregister a terminating thread; its pending barrier work is kept.
    pub fn unregister_mutator(&self, ctx: &MutatorContext) {
        self.mutators.unregister(ctx);
    }

    /// Registered mutators.
    pub fn mutators(&self) -> &MutatorRegistry {
        &self.mutators
    }

    /// Add a source of non-heap roots.
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.roots.write().push(provider);
    }

    /// Add an observer of collector activity.
    pub fn add_listener(&self, listener: Arc<dyn GcListener>) {
        self.listeners.write().push(listener);
    }

    // ---- mutator interface ----

    /// Allocate and initialize a movable object; `None` means a collection is needed.
    pub fn allocate(&self, ctx: Option<&MutatorContext>, shape: ObjectShape) -> Option<Address> {
        let obj = self.allocator.allocate(ctx, shape.size)?;
        self.heap.initialize_object(obj, shape);
        Some(obj)
    }

    /// Allocate and initialize an object that never moves.
    pub fn allocate_non_movable(&self, shape: ObjectShape) -> Option<Address> {
        let obj = self.allocator.allocate_non_movable(shape.size)?;
        self.heap.initialize_object(obj, shape);
        Some(obj)
    }

    /// Allocate, running a young and then a full collection if needed.
    pub fn allocate_or_collect(
        &self,
        ctx: Option<&MutatorContext>,
        shape: ObjectShape,
    ) -> GcResult<Address> {
        if let Some(obj) = self.allocate(ctx, shape) {
            return Ok(obj);
        }
        for cause in [GcTaskCause::Young, GcTaskCause::Oom] {
            self.run_gc(GcTask::new(cause));
            if let Some(obj) = self.allocate(ctx, shape) {
                return Ok(obj);
            }
        }
        tracing::warn!(target: "otter::gc", size = shape.size, "allocation failed after full collection");
        Err(GcError::OutOfMemory(shape.size))
    }

    /// Store `value` into the reference field at `obj + offset` through the barriers.
    pub fn write_ref(&self, ctx: &MutatorContext, obj: Address, offset: usize, value: Address) {
        self.barriers
            .write_ref(&self.heap, ctx, obj, offset, value);
    }

    /// Load the reference field at `obj + offset`.
    pub fn read_ref(&self, obj: Address, offset: usize) -> Address {
        self.heap.load_ref(obj.offset(offset))
    }

    /// Keep `obj` in place until it is unpinned.
    pub fn pin_object(&self, obj: Address) {
        self.allocator.pin_object(obj);
    }

    /// Release a pin.
    pub fn unpin_object(&self, obj: Address) {
        self.allocator.unpin_object(obj);
    }

    // ---- tasks ----

    /// Hand `task` to the GC thread.
    ///
    /// Refused when no GC thread runs, or when the pause time goal is on and
    /// the pause budget is exhausted.
    pub fn trigger(&self, task: GcTask) -> bool {
        if self.config.enable_pause_time_goal
            && !self
                .pause_tracker
                .min_delay_before_max_pause(Instant::now())
                .is_zero()
        {
            tracing::debug!(target: "otter::gc", cause = %task.cause, "task refused, pause budget exhausted");
            return false;
        }
        let tx = self.task_tx.lock();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        *self.pending_tasks.lock() += 1;
        if tx.send(GcThreadMessage::Run(task)).is_err() {
            self.task_done();
            return false;
        }
        true
    }

    /// Wait until every triggered task has run.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending_tasks.lock();
        while *pending > 0 {
            if self.idle.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    pub(crate) fn task_done(&self) {
        let mut pending = self.pending_tasks.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn attach_task_queue(&self, tx: Sender<GcThreadMessage>) {
        *self.task_tx.lock() = Some(tx);
    }

    pub(crate) fn detach_task_queue(&self) -> Option<Sender<GcThreadMessage>> {
        self.task_tx.lock().take()
    }

    /// Whether the last concurrent marking asked for mixed collections.
    pub fn is_mixed_gc_required(&self) -> bool {
        self.mixed_required.load(Ordering::Acquire)
    }

    /// Whether concurrent marking is in progress.
    pub fn is_concurrent_marking(&self) -> bool {
        self.concurrent_marking.load(Ordering::Acquire)
    }

    /// Ask a running concurrent marking to stop.
    pub fn interrupt_concurrent_marking(&self) {
        if self.is_concurrent_marking() {
            self.token.cancel();
        }
    }

    /// Promote everything and collect no old region until
    /// [`G1Gc::postpone_gc_end`].
    pub fn postpone_gc_start(&self) {
        self.postponed.store(true, Ordering::Release);
        self.garbage_threshold.store(0, Ordering::Release);
        self.promotion_rate.store(0, Ordering::Release);
    }

    /// Restore the configured thresholds.
    pub fn postpone_gc_end(&self) {
        self.postponed.store(false, Ordering::Release);
        self.garbage_threshold
            .store(self.config.region_garbage_rate_threshold, Ordering::Release);
        self.promotion_rate
            .store(self.config.promotion_region_alive_rate, Ordering::Release);
    }

    /// Whether postpone mode is active.
    pub fn is_postponed(&self) -> bool {
        self.postponed.load(Ordering::Acquire)
    }

    fn garbage_threshold(&self) -> f64 {
        f64::from(self.garbage_threshold.load(Ordering::Acquire)) / 100.0
    }

    /// Check that live objects only reference allocated objects.
    pub fn verify_heap(&self) -> GcResult<()> {
        match HeapVerifier::new(&self.heap, &self.allocator).verify() {
            0 => Ok(()),
            failures => Err(GcError::HeapVerification(failures)),
        }
    }

    /// Stop background work.
    pub fn shutdown(&self) {
        self.token.cancel();
        if let Some(tx) = self.detach_task_queue() {
            let _ = tx.send(GcThreadMessage::Shutdown);
        }
        self.remset_worker.stop();
    }

    // ---- cycles ----

    /// Run a collection for `task` on the calling thread.
    ///
    /// Returns what the cycle collected; concurrent marking scheduled by the
    /// task runs before this returns.
    pub fn run_gc(&self, mut task: GcTask) -> GcCollectionType {
        let _gc = match self.gc_lock.try_lock() {
            Some(guard) => guard,
            None => {
                // A running concurrent mark gives way to this pause.
                self.token.cancel();
                self.gc_lock.lock()
            }
        };
        self.token.reset();
        self.remset_worker.suspend_for_gc_pause();
        self.run_phases(&mut task);
        self.remset_worker.resume_after_gc_pause();
        if task.cause == GcTaskCause::Young {
            self.request_marking_if_needed();
        }
        task.collection_type
    }

    fn run_phases(&self, task: &mut GcTask) {
        {
            let _pause = PauseGuard::new(self.mutator_control.as_ref());
            let start = Instant::now();
            self.prepare_pause();
            let record = if self.need_full_gc(task) {
                task.collection_type = GcCollectionType::Full;
                Some(self.run_full_gc(task))
            } else {
                let forced = task.cause == GcTaskCause::Mixed;
                let mixed = forced || self.is_mixed_gc_required();
                task.collection_type = if mixed {
                    GcCollectionType::Mixed
                } else {
                    GcCollectionType::Young
                };
                self.run_young_or_mixed(task, mixed, forced)
            };
            match record {
                Some(mut record) => {
                    let end = Instant::now();
                    record.pause = end - start;
                    self.pause_tracker.add_pause(start, end);
                    self.allocator.reset_allocation_counter();
                    self.compute_new_size();
                    if self.config.verify_after_gc {
                        self.verify_after_pause();
                    }
                    self.finish_cycle(record);
                }
                None => task.collection_type = GcCollectionType::None,
            }
        }
        if self.schedule_concurrent_mark(task) {
            self.run_concurrent_mark(task);
        }
    }

    fn need_full_gc(&self, task: &GcTask) -> bool {
        task.cause == GcTaskCause::Oom
            || (task.cause == GcTaskCause::Explicit && !self.config.explicit_concurrent_gc_enabled)
    }

    fn prepare_pause(&self) {
        self.allocator.retire_tlabs(&self.mutators.threads());
        self.process_dirty_cards();
    }

    fn process_dirty_cards(&self) -> usize {
        self.barriers.flush_post_buffers(&self.mutators);
        let cards = self.remset_worker.drain_all_cards();
        self.remset_worker.gc_process_cards(&cards)
    }

    fn have_enough_regions_to_move(&self, count: usize) -> bool {
        self.allocator.have_tenured_size(count) && self.allocator.have_free_regions(count)
    }

    fn root_values(&self, concurrent_only: bool) -> Vec<Address> {
        let mut values = Vec::new();
        for provider in self.roots.read().iter() {
            provider.visit_roots(&mut |kind, slot| {
                if slot.is_null() || (concurrent_only && !kind.is_concurrent()) {
                    return;
                }
                if self.heap.pool().region_id_of(*slot).is_some() {
                    values.push(*slot);
                }
            });
        }
        values
    }

    fn enter_phase(&self, phase: GcPhase) {
        self.phase.set(phase);
        tracing::debug!(target: "otter::gc", ?phase, "phase started");
        for listener in self.listeners.read().iter() {
            listener.gc_phase_started(phase);
        }
    }

    fn leave_phase(&self, phase: GcPhase) {
        for listener in self.listeners.read().iter() {
            listener.gc_phase_finished(phase);
        }
        self.phase.set(GcPhase::Idle);
    }

    fn finish_cycle(&self, record: CycleRecord) {
        tracing::info!(
            target: "otter::gc",
            pause_us = record.pause.as_micros() as u64,
            freed_bytes = record.freed_bytes,
            moved_bytes = record.moved_bytes,
            promoted = record.promoted_regions,
            regions = record.collected_regions,
            "{} collection finished",
            record.phase_line
        );
        for listener in self.listeners.read().iter() {
            listener.gc_finished(&record);
        }
        self.stats.record(record);
    }

    fn verify_after_pause(&self) {
        if let Err(err) = self.verify_heap() {
            if self.config.fail_on_heap_verification {
                tracing::error!(target: "otter::gc", %err, "heap corrupted");
                panic!("{err}");
            }
            tracing::warn!(target: "otter::gc", %err, "heap verification reported failures");
        }
    }

    // ---- young and mixed ----

    fn collectible_regions(&self, mixed: bool, threshold: f64) -> CollectionSet {
        let mut set = CollectionSet::with_young(self.allocator.young_regions());
        if !mixed {
            return set;
        }
        let candidates = self.allocator.top_garbage_regions(false);
        if self.config.enable_pause_time_goal {
            let budget_us = self.config.max_gc_pause_ms as f64 * 1000.0;
            add_old_regions_according_pause_time_goal(
                &mut set,
                candidates,
                threshold,
                budget_us,
                &self.analytics,
            );
        } else {
            add_old_regions_max_allowed(
                &mut set,
                candidates,
                self.config.number_of_tenured_regions_at_mixed_collection,
                threshold,
            );
        }
        set
    }

    fn run_young_or_mixed(&self, task: &GcTask, mixed: bool, forced: bool) -> Option<CycleRecord> {
        let threshold = if forced { 0.0 } else { self.garbage_threshold() };
        let set = self.collectible_regions(mixed, threshold);
        if set.is_empty() {
            tracing::debug!(target: "otter::gc", cause = %task.cause, "nothing to collect");
            return None;
        }
        if !self.have_enough_regions_to_move(set.movable_len()) {
            tracing::warn!(
                target: "otter::gc",
                needed = set.movable_len(),
                free = self.heap.pool().free_region_count(),
                "not enough free regions to evacuate the collection set"
            );
            return None;
        }
        tracing::debug!(target: "otter::gc", ?set, "collection set");
        Some(self.collect_and_move(task, set))
    }

    fn collect_and_move(&self, task: &GcTask, set: CollectionSet) -> CycleRecord {
        let kind = task.collection_type;
        let mut record = CycleRecord::new(kind, task.cause, task.phase_line(kind));
        record.collected_regions = set.len();
        self.analytics
            .report_collection_start(Instant::now(), set.young().len());
        set.tag();
        for region in set.iter() {
            region.mark_bitmap().clear_all();
            region.set_live_bytes(0);
        }

        self.enter_phase(GcPhase::MarkYoung);
        self.analytics.report_scan_remset_start(Instant::now());
        let cache = RefCache::collect(&self.heap, &set);
        self.analytics
            .report_scan_remset_end(Instant::now(), cache.scanned_cards());
        let mut seeds = self.root_values(false);
        seeds.extend(cache.referents(&self.heap));
        self.analytics.report_marking_start(Instant::now());
        let marker = Marker::new(&self.heap, MarkMode::CollectionSet, self.pause_live_bytes_policy())
            .with_split_threshold(self.config.marking_stack_split_threshold);
        marker.mark_parallel(seeds.iter().copied(), &self.workers);
        self.analytics.report_marking_end(Instant::now());
        self.analytics.report_live_objects(marker.marked_objects());
        self.leave_phase(GcPhase::MarkYoung);

        self.enter_phase(GcPhase::CollectYoungAndMove);
        self.analytics.report_promotion_start(Instant::now());
        let (promoted, mut to_move) = self.split_promoted(&set, false);
        self.analytics.report_promotion_end(Instant::now());
        record.promoted_regions = promoted.len();
        for region in &promoted {
            region.live_bitmap().iterate_marked(&mut |obj| {
                self.heap.for_each_ref(obj, &mut |_, value| seeds.push(value));
                true
            });
        }
        to_move.extend(set.tenured().iter().cloned());

        self.analytics.report_evacuation_start(Instant::now());
        let result =
            Evacuator::new(&self.heap, &self.allocator).evacuate_reachable(seeds, &self.workers);
        self.analytics.report_evacuation_end(Instant::now());
        self.analytics.report_evacuated_bytes(result.moved_bytes);
        self.finish_evacuation(
            &mut record,
            &result,
            to_move,
            promoted,
            &cache,
            RemsetUpdatePolicy::EnqueueCards,
        );
        set.untag();
        self.leave_phase(GcPhase::CollectYoungAndMove);
        self.analytics.report_collection_end(Instant::now(), &set);
        record
    }

    /// Live-byte accounting for marking inside a pause.
    ///
    /// Mutators are stopped, so a single worker owns every region counter.
    fn pause_live_bytes_policy(&self) -> LiveBytesPolicy {
        if self.workers.count() == 1 {
            LiveBytesPolicy::NonAtomic
        } else {
            LiveBytesPolicy::Atomic
        }
    }

    /// Promote young regions that stay in place; return them and the rest.
    fn split_promoted(
        &self,
        set: &CollectionSet,
        full: bool,
    ) -> (Vec<Arc<Region>>, Vec<Arc<Region>>) {
        let rate = self.promotion_rate.load(Ordering::Acquire);
        let mut promoted = Vec::new();
        let mut to_move = Vec::new();
        for region in set.young() {
            let alive = region.live_bytes() as f64 * 100.0 / region.size() as f64;
            let promote =
                region.is_pinned() || (!full && rate < 100 && alive >= f64::from(rate));
            if promote {
                tracing::debug!(target: "otter::gc", region = region.id(), alive, "promote young region");
                self.allocator.promote_young_region(region);
                self.analytics.report_promoted_region();
                promoted.push(region.clone());
            } else {
                to_move.push(region.clone());
            }
        }
        (promoted, to_move)
    }

    /// Keep failed regions, fix references and free evacuated regions.
    fn finish_evacuation(
        &self,
        record: &mut CycleRecord,
        result: &EvacuationResult,
        evacuated: Vec<Arc<Region>>,
        mut kept: Vec<Arc<Region>>,
        cache: &RefCache,
        policy: RemsetUpdatePolicy,
    ) {
        let failed = self.keep_failed_regions(result);
        let failed_ids: FxHashSet<usize> = failed.iter().map(|r| r.id()).collect();
        kept.extend(failed);
        let freed: Vec<Arc<Region>> = evacuated
            .into_iter()
            .filter(|r| !failed_ids.contains(&r.id()))
            .collect();

        self.analytics.report_update_refs_start(Instant::now());
        let work = UpdateWork {
            moved: &result.moved,
            kept_regions: &kept,
            cache,
        };
        let (cards, updated) = update_heap_references(&self.heap, &self.workers, policy, &work);
        let roots = update_roots(&self.heap, &self.roots.read());
        self.barriers.queue().push(cards);
        self.analytics.report_update_refs_end(Instant::now());
        tracing::debug!(target: "otter::gc", updated, roots, "references updated");

        let allocated: usize = freed.iter().map(|r| r.allocated_bytes()).sum();
        record.freed_bytes += allocated.saturating_sub(result.moved_bytes);
        if self.config.track_freed_objects {
            let objects: usize = freed.iter().map(|r| r.allocated_objects()).sum();
            record.freed_objects += objects.saturating_sub(result.moved_objects);
        }
        record.moved_bytes += result.moved_bytes;
        record.moved_objects += result.moved_objects;
        record.freed_regions += freed.len();

        self.remset_worker.gc_invalidate_regions(&freed);
        let (young, tenured): (Vec<_>, Vec<_>) = freed.into_iter().partition(|r| r.is_young());
        self.allocator.reset_young_regions(&young);
        self.allocator.free_tenured_regions(&tenured);
    }

    /// Turn regions with self-forwarded objects into old regions.
    fn keep_failed_regions(&self, result: &EvacuationResult) -> Vec<Arc<Region>> {
        if !result.has_failures() {
            return Vec::new();
        }
        let mut regions: FxHashMap<usize, Arc<Region>> = FxHashMap::default();
        for &(obj, mark) in &result.self_forwarded {
            self.heap
                .pool()
                .store(obj.offset(MARK_WORD_OFFSET), mark.raw());
            if let Some(region) = self.heap.pool().region_of(obj) {
                regions.entry(region.id()).or_insert(region);
            }
        }
        let mut kept: Vec<Arc<Region>> = regions.into_values().collect();
        kept.sort_by_key(|r| r.id());
        for region in &kept {
            // Objects copied before the failure are garbage here now.
            let mut live = 0;
            let mut moved = Vec::new();
            region.mark_bitmap().iterate_marked(&mut |obj| {
                match self.heap.forwardee(obj) {
                    Some(to) if to != obj => moved.push(obj),
                    _ => live += self.heap.object_size(obj),
                }
                true
            });
            for obj in moved {
                region.mark_bitmap().clear(obj);
            }
            region.set_live_bytes(live);
            if region.is_young() {
                self.allocator.promote_young_region(region);
            } else {
                region.publish_marks();
                region.remove_flag(RegionFlags::COLLECTION_SET);
            }
            tracing::warn!(target: "otter::gc", region = region.id(), live, "evacuation failed, region kept in place");
        }
        kept
    }

    // ---- full ----

    fn run_full_gc(&self, task: &GcTask) -> CycleRecord {
        let kind = GcCollectionType::Full;
        let mut record = CycleRecord::new(kind, task.cause, task.phase_line(kind));
        self.heap.pool().release_retained();

        self.enter_phase(GcPhase::FullMark);
        for region in self.allocator.all_regions() {
            region.mark_bitmap().clear_all();
            region.set_live_bytes(0);
        }
        let marker = Marker::new(&self.heap, MarkMode::All, self.pause_live_bytes_policy())
            .with_split_threshold(self.config.marking_stack_split_threshold);
        marker.mark_parallel(self.root_values(false), &self.workers);
        self.leave_phase(GcPhase::FullMark);
        self.sweep_non_regular(&mut record);
        self.publish_tenured_marks();
        self.process_dirty_cards();
        self.collect_empty_tenured_regions(&mut record);

        self.enter_phase(GcPhase::FullCompact);
        if !self.have_enough_regions_to_move(1) && self.allocator.release_reserved_region() {
            tracing::debug!(target: "otter::gc", "released the reserved region");
        }
        self.allocator.clear_old_queue();
        let young = self.allocator.young_regions();
        self.build_cross_young_remsets(&young);
        let mut chunks = FullCollectionChunks::new(
            self.allocator.top_garbage_regions(true),
            self.config.full_gc_region_fragmentation_rate,
        );
        while let Some(chunk) = chunks.next_chunk(&|n| self.have_enough_regions_to_move(n)) {
            if !chunk.is_empty() {
                self.compact(&mut record, chunk);
            }
        }
        self.allocator.reserve_region_if_needed();
        if !young.is_empty() {
            let set = CollectionSet::with_young(young);
            if self.have_enough_regions_to_move(set.movable_len()) {
                self.compact(&mut record, set);
            } else {
                tracing::warn!(target: "otter::gc", regions = set.len(), "no room to compact young regions");
                self.remset_worker.gc_invalidate_regions(set.young());
            }
        }
        self.leave_phase(GcPhase::FullCompact);
        record
    }

    /// Record references from surviving young objects into old regions.
    fn build_cross_young_remsets(&self, young: &[Arc<Region>]) {
        for region in young {
            let mut refs = Vec::new();
            region.mark_bitmap().iterate_marked(&mut |obj| {
                self.heap
                    .for_each_ref(obj, &mut |slot, value| refs.push((slot, value)));
                true
            });
            for (slot, value) in refs {
                let into_young = self
                    .heap
                    .pool()
                    .with_region(value, |r| r.is_young())
                    .unwrap_or(true);
                if !into_young {
                    add_cross_region_ref(&self.heap, region, slot, value);
                }
            }
        }
    }

    /// Compact one chunk of a full collection by walking mark bitmaps.
    fn compact(&self, record: &mut CycleRecord, set: CollectionSet) {
        set.tag();
        record.collected_regions += set.len();
        let cache = RefCache::collect(&self.heap, &set);
        let (promoted, mut to_move) = self.split_promoted(&set, true);
        record.promoted_regions += promoted.len();
        to_move.extend(set.tenured().iter().cloned());
        let result =
            Evacuator::new(&self.heap, &self.allocator).evacuate_marked(&to_move, &self.workers);
        self.finish_evacuation(
            record,
            &result,
            to_move,
            promoted,
            &cache,
            RemsetUpdatePolicy::UpdateDirectly,
        );
        set.untag();
    }

    // ---- shared by full collections and remark ----

    fn publish_tenured_marks(&self) {
        for region in self.allocator.all_regions() {
            if !region.is_young() {
                region.publish_marks();
            }
        }
    }

    /// Reclaim unmarked humongous and non-movable objects.
    ///
    /// Runs after marking and before the marks are published, so the live
    /// bitmap still lists every allocated non-regular object.
    fn sweep_non_regular(&self, record: &mut CycleRecord) {
        self.enter_phase(GcPhase::Sweep);
        for region in self.allocator.humongous_regions() {
            let obj = region.object_start();
            if region.is_pinned() || region.mark_bitmap().test(obj) {
                continue;
            }
            tracing::debug!(target: "otter::gc", region = region.id(), %obj, "free humongous object");
            record.freed_bytes += region.allocated_bytes();
            record.freed_regions += 1;
            if self.config.track_freed_objects {
                record.freed_objects += 1;
            }
            self.remset_worker
                .gc_invalidate_regions(std::slice::from_ref(&region));
            self.allocator.free_humongous_region(&region);
        }
        for region in self.allocator.nonmovable_regions() {
            let mut dead = Vec::new();
            region.live_bitmap().iterate_marked(&mut |obj| {
                if !region.mark_bitmap().test(obj) {
                    dead.push(obj);
                }
                true
            });
            for &obj in &dead {
                let size = self.heap.object_size(obj);
                record.freed_bytes += size;
                self.allocator.free_non_movable_object(&region, obj, size);
            }
            if self.config.track_freed_objects {
                record.freed_objects += dead.len();
            }
            if region.live_bitmap().is_empty() && region.mark_bitmap().is_empty() {
                record.freed_regions += 1;
                self.remset_worker
                    .gc_invalidate_regions(std::slice::from_ref(&region));
                self.allocator.free_nonmovable_region(&region);
            }
        }
        self.leave_phase(GcPhase::Sweep);
    }

    fn collect_empty_tenured_regions(&self, record: &mut CycleRecord) {
        let empty: Vec<Arc<Region>> = self
            .allocator
            .top_garbage_regions(true)
            .into_iter()
            .map(|candidate| candidate.into_region())
            .filter(|r| r.live_bytes() == 0 && r.allocated_bytes() > 0)
            .collect();
        if empty.is_empty() {
            return;
        }
        record.freed_bytes += empty.iter().map(|r| r.allocated_bytes()).sum::<usize>();
        record.freed_regions += empty.len();
        tracing::debug!(target: "otter::gc", count = empty.len(), "free empty tenured regions");
        self.remset_worker.gc_invalidate_regions(&empty);
        self.allocator.free_tenured_regions(&empty);
    }

    // ---- concurrent marking ----

    fn schedule_concurrent_mark(&self, task: &GcTask) -> bool {
        if self.is_mixed_gc_required() {
            let candidates = self.allocator.top_garbage_regions(false);
            if !have_garbage_regions(&candidates, self.garbage_threshold()) {
                self.mixed_required.store(false, Ordering::Release);
            }
            return false;
        }
        !self.token.is_cancelled() && task.starts_concurrent_mark()
    }

    fn request_marking_if_needed(&self) {
        if self.is_concurrent_marking() || self.is_mixed_gc_required() {
            return;
        }
        let capacity = (self.config.region_count() - self.config.max_young_regions()).max(1);
        let occupancy = self.allocator.tenured_slots_used() * 100 / capacity;
        if occupancy >= self.config.initiating_occupancy_percent as usize {
            tracing::debug!(target: "otter::gc", occupancy, "tenured occupancy requests concurrent marking");
            let _ = self.trigger(GcTask::new(GcTaskCause::HeapUsageThreshold));
        }
    }

    fn pause_time_goal_delay(&self) {
        if !self.config.enable_pause_time_goal {
            return;
        }
        let delay = self
            .pause_tracker
            .min_delay_before_max_pause(Instant::now());
        if !delay.is_zero() {
            self.token.wait_for(delay);
        }
    }

    fn run_concurrent_mark(&self, task: &GcTask) {
        let kind = GcCollectionType::ConcurrentMark;
        let mut record = CycleRecord::new(kind, task.cause, task.phase_line(kind));
        self.concurrent_marking.store(true, Ordering::Release);
        self.pause_time_goal_delay();

        let marker = Marker::new(&self.heap, MarkMode::All, LiveBytesPolicy::Atomic)
            .with_cancellation(&self.token)
            .with_split_threshold(self.config.marking_stack_split_threshold);
        let mut grey = {
            let _pause = PauseGuard::new(self.mutator_control.as_ref());
            let start = Instant::now();
            self.enter_phase(GcPhase::InitialMark);
            for region in self.allocator.all_regions() {
                region.mark_bitmap().clear_all();
                region.set_live_bytes(0);
            }
            self.allocator.set_allocate_black(true);
            self.barriers.set_concurrent_marking(true);
            let grey: Vec<Address> = self
                .root_values(false)
                .into_iter()
                .filter(|&root| marker.mark_object(root))
                .collect();
            self.leave_phase(GcPhase::InitialMark);
            let end = Instant::now();
            self.pause_tracker.add_pause(start, end);
            record.pause += end - start;
            grey
        };

        self.enter_phase(GcPhase::ConcurrentMark);
        self.remset_worker.resume_after_gc_pause();
        grey.extend(
            self.root_values(true)
                .into_iter()
                .filter(|&root| marker.mark_object(root)),
        );
        let mut outcome = marker.trace_parallel(grey, &self.workers);
        if outcome == MarkingOutcome::Completed {
            self.pause_time_goal_delay();
        }
        if self.token.is_cancelled() {
            outcome = MarkingOutcome::Aborted;
        }
        self.remset_worker.suspend_for_gc_pause();
        self.leave_phase(GcPhase::ConcurrentMark);

        if outcome == MarkingOutcome::Aborted {
            self.abort_concurrent_mark(&record);
            return;
        }

        {
            let _pause = PauseGuard::new(self.mutator_control.as_ref());
            let start = Instant::now();
            self.enter_phase(GcPhase::Remark);
            self.barriers.set_concurrent_marking(false);
            let mut pending = self.barriers.take_satb_entries(&self.mutators);
            pending.extend(self.root_values(false));
            Marker::new(&self.heap, MarkMode::All, self.pause_live_bytes_policy())
                .with_split_threshold(self.config.marking_stack_split_threshold)
                .mark_parallel(pending, &self.workers);
            self.leave_phase(GcPhase::Remark);
            self.sweep_non_regular(&mut record);
            self.publish_tenured_marks();
            self.allocator.set_allocate_black(false);
            self.process_dirty_cards();
            let end = Instant::now();
            self.pause_tracker.add_pause(start, end);
            record.pause += end - start;
        }

        let candidates = self.allocator.top_garbage_regions(false);
        if have_garbage_regions(&candidates, self.garbage_threshold()) {
            tracing::debug!(target: "otter::gc", "mixed collection required");
            self.mixed_required.store(true, Ordering::Release);
        }
        self.collect_empty_tenured_regions(&mut record);
        self.concurrent_marking.store(false, Ordering::Release);
        self.finish_cycle(record);
    }

    fn abort_concurrent_mark(&self, record: &CycleRecord) {
        self.barriers.set_concurrent_marking(false);
        self.barriers.discard_satb(&self.mutators);
        self.allocator.set_allocate_black(false);
        // Live bytes were cleared at initial mark; rebuild them from the live bitmaps.
        for region in self.allocator.all_regions() {
            if region.is_young() {
                continue;
            }
            let mut live = 0;
            region.live_bitmap().iterate_marked(&mut |obj| {
                live += self.heap.object_size(obj);
                true
            });
            region.set_live_bytes(live);
        }
        self.concurrent_marking.store(false, Ordering::Release);
        tracing::info!(target: "otter::gc", "{} interrupted", record.phase_line);
    }

    // ---- sizing ----

    fn compute_new_size(&self) {
        if !self.config.enable_pause_time_goal {
            return;
        }
        let by_duration = self.desired_eden_length_by_pause_duration();
        let by_delay = self.desired_eden_length_by_pause_delay();
        let length = by_duration.max(by_delay);
        tracing::debug!(target: "otter::gc", by_duration, by_delay, length, "desired eden length");
        self.allocator.set_desired_eden_length(length);
    }

    fn desired_eden_length_by_pause_duration(&self) -> usize {
        if self.is_mixed_gc_required() {
            return 1;
        }
        let max_pause_us = self.config.max_gc_pause_ms as f64 * 1000.0;
        let error = self.analytics.estimate_prediction_error_us();
        let fits = |length: usize| {
            self.allocator.have_tenured_size(length)
                && error + self.analytics.predict_young_collection_time_us(length) <= max_pause_us
        };
        let (mut low, mut high) = (1, self.allocator.max_young_regions());
        if !fits(low) {
            return 1;
        }
        while low < high {
            let mid = low + (high - low).div_ceil(2);
            if fits(mid) {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        low
    }

    fn desired_eden_length_by_pause_delay(&self) -> usize {
        let delay = self
            .pause_tracker
            .min_delay_before_max_pause(Instant::now());
        (self.analytics.predict_allocation_rate() * delay.as_micros() as f64).ceil() as usize
    }
}

impl Drop for G1Gc {
    fn drop(&mut self) {
        self.remset_worker.stop();
    }
}

impl std::fmt::Debug for G1Gc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("G1Gc")
            .field("phase", &self.phase())
            .field("young_regions", &self.allocator.young_region_count())
            .field("tenured_slots", &self.allocator.tenured_slots_used())
            .field("mixed_required", &self.is_mixed_gc_required())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::object::DynamicLayout;
    use crate::roots::{HandleTable, RootType};

    fn model() -> Arc<dyn ObjectModel> {
        Arc::new(DynamicLayout)
    }

    fn small_config() -> GcConfig {
        GcConfig {
            region_size: 64 * 1024,
            heap_size: 4 * 1024 * 1024,
            enable_concurrent_update_remset: false,
            ..GcConfig::default()
        }
    }

    #[test]
    fn single_worker_pauses_count_live_bytes_without_atomics() {
        let single = GcConfig {
            gc_workers_count: 1,
            ..small_config()
        };
        let gc = G1Gc::new(single, model()).unwrap();
        assert_eq!(gc.pause_live_bytes_policy(), LiveBytesPolicy::NonAtomic);
        let handles = Arc::new(HandleTable::new(RootType::Handle));
        gc.add_root_provider(handles.clone());
        let kept = gc.allocate_non_movable(DynamicLayout::shape(3)).unwrap();
        gc.allocate_non_movable(DynamicLayout::shape(3)).unwrap();
        handles.create(kept);
        let region = gc.heap().pool().region_of(kept).unwrap();
        assert_eq!(
            gc.run_gc(GcTask::new(GcTaskCause::Oom)),
            GcCollectionType::Full
        );
        assert_eq!(region.live_bytes(), 40);

        let parallel = GcConfig {
            gc_workers_count: 4,
            ..small_config()
        };
        let gc = G1Gc::new(parallel, model()).unwrap();
        assert_eq!(gc.pause_live_bytes_policy(), LiveBytesPolicy::Atomic);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = GcConfig {
            region_size: 1000,
            ..GcConfig::default()
        };
        let err = G1Gc::new(config, model()).unwrap_err();
        assert!(matches!(
            err,
            GcError::InvalidConfig(ConfigError::RegionSize(1000))
        ));
    }

    #[test]
    fn pause_goal_keeps_eden_within_bounds() {
        let config = GcConfig {
            enable_pause_time_goal: true,
            ..small_config()
        };
        let gc = G1Gc::new(config, model()).unwrap();
        gc.allocate(None, DynamicLayout::shape(1)).unwrap();
        assert_eq!(
            gc.run_gc(GcTask::new(GcTaskCause::Young)),
            GcCollectionType::Young
        );
        let eden = gc.allocator().desired_eden_length();
        assert!((1..=gc.allocator().max_young_regions()).contains(&eden));
    }

    #[test]
    fn empty_heap_collects_nothing() {
        let gc = G1Gc::new(small_config(), model()).unwrap();
        assert_eq!(
            gc.run_gc(GcTask::new(GcTaskCause::Young)),
            GcCollectionType::None
        );
        assert_eq!(gc.stats().cycles(), 0);
        assert_eq!(gc.phase(), GcPhase::Idle);
    }

    #[test]
    fn postpone_restores_thresholds() {
        let gc = G1Gc::new(small_config(), model()).unwrap();
        gc.postpone_gc_start();
        assert!(gc.is_postponed());
        assert_eq!(gc.garbage_threshold(), 0.0);
        gc.postpone_gc_end();
        assert_eq!(gc.garbage_threshold(), 0.95);
        assert_eq!(gc.promotion_rate.load(Ordering::Acquire), 50);
    }
}
