//! Tri-color bitmap marking.
//!
//! White objects have no bit in their region's mark bitmap, grey objects are
//! marked and sit on a marking stack, black objects are marked and scanned.
//! A bit, once set, stays set until the next trace clears the bitmap.
//!
//! ## Design
//!
//! - [`GcAdaptiveStack`] spills half of an overfull local stack into a shared
//!   [`MarkingTasks`] queue so idle workers can pick it up
//! - Termination: a worker that finds no task waits; the last worker to go
//!   idle ends the phase
//! - [`MarkMode::CollectionSet`] restricts the trace to collection-set regions
//!   (young and mixed pauses); [`MarkMode::All`] traces the whole heap

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::address::Address;
use crate::concurrent::CancellationToken;
use crate::heap::Heap;
use crate::workers::WorkerPool;

/// Result of a marking run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingOutcome {
    /// Every reachable object is marked
    Completed,
    /// The cancellation token fired; marks are incomplete
    Aborted,
}

/// Which objects a trace follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMode {
    /// Every object in the heap
    All,
    /// Only objects in collection-set regions
    CollectionSet,
}

/// How live bytes are accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveBytesPolicy {
    /// Several threads may account into the same region
    Atomic,
    /// A single thread owns the accounting
    NonAtomic,
}

#[derive(Default)]
struct TaskState {
    tasks: Vec<Vec<Address>>,
    idle: usize,
    done: bool,
}

/// Shared queue of marking tasks with termination detection.
pub struct MarkingTasks {
    state: Mutex<TaskState>,
    condvar: Condvar,
    workers: usize,
}

impl MarkingTasks {
    /// Queue shared by `workers` threads.
    pub fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(TaskState::default()),
            condvar: Condvar::new(),
            workers: workers.max(1),
        }
    }

    /// Publish a task.
    pub fn push(&self, task: Vec<Address>) {
        if task.is_empty() {
            return;
        }
        self.state.lock().tasks.push(task);
        self.condvar.notify_one();
    }

    /// Take a task, waiting while other workers may still produce one.
    ///
    /// Returns `None` once every worker is idle or the queue was aborted.
    pub fn take(&self) -> Option<Vec<Address>> {
        let mut state = self.state.lock();
        loop {
            if state.done {
                return None;
            }
            if let Some(task) = state.tasks.pop() {
                return Some(task);
            }
            state.idle += 1;
            if state.idle == self.workers {
                state.done = true;
                self.condvar.notify_all();
                return None;
            }
            self.condvar.wait(&mut state);
            state.idle -= 1;
        }
    }

    /// Stop every worker.
    pub fn abort(&self) {
        self.state.lock().done = true;
        self.condvar.notify_all();
    }
}

/// Worker-local marking stack that shares surplus work.
pub struct GcAdaptiveStack<'a> {
    local: Vec<Address>,
    split_threshold: usize,
    shared: Option<&'a MarkingTasks>,
}

impl<'a> GcAdaptiveStack<'a> {
    /// Stack that offloads to `shared` when it grows past `split_threshold`.
    pub fn new(split_threshold: usize, shared: Option<&'a MarkingTasks>) -> Self {
        Self {
            local: Vec::new(),
            split_threshold: split_threshold.max(2),
            shared,
        }
    }

    /// Push a grey object.
    pub fn push(&mut self, obj: Address) {
        self.local.push(obj);
        if let Some(shared) = self.shared
            && self.local.len() > self.split_threshold
        {
            let half = self.local.len() / 2;
            shared.push(self.local.split_off(half));
        }
    }

    /// Pop the next grey object.
    pub fn pop(&mut self) -> Option<Address> {
        self.local.pop()
    }

    /// Push a whole task.
    pub fn extend(&mut self, task: Vec<Address>) {
        for obj in task {
            self.push(obj);
        }
    }

    /// Drop every pending object.
    pub fn clear(&mut self) {
        self.local.clear();
    }

    /// Number of pending objects.
    pub fn len(&self) -> usize {
        self.local.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

/// Marks objects into their regions' mark bitmaps.
pub struct Marker<'a> {
    heap: &'a Heap,
    mode: MarkMode,
    live_bytes: LiveBytesPolicy,
    token: Option<&'a CancellationToken>,
    split_threshold: usize,
    marked: AtomicUsize,
}

impl<'a> Marker<'a> {
    /// Marker over `heap`.
    pub fn new(heap: &'a Heap, mode: MarkMode, live_bytes: LiveBytesPolicy) -> Self {
        Self {
            heap,
            mode,
            live_bytes,
            token: None,
            split_threshold: 256,
            marked: AtomicUsize::new(0),
        }
    }

    /// Check `token` before every object.
    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Entries per stack before work is shared.
    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    /// Objects newly marked by this marker.
    pub fn marked_objects(&self) -> usize {
        self.marked.load(Ordering::Relaxed)
    }

    /// Set the mark bit of `obj` and account its size.
    ///
    /// Returns `true` if the object was white and must be scanned.
    pub fn mark_object(&self, obj: Address) -> bool {
        let size = self.heap.object_size(obj);
        let mode = self.mode;
        let live = self.live_bytes;
        let newly = self.heap.pool().with_region(obj, |region| {
            if mode == MarkMode::CollectionSet && !region.in_collection_set() {
                return false;
            }
            if region.mark_bitmap().atomic_test_and_set(obj) {
                return false;
            }
            region.add_live_bytes(size, live == LiveBytesPolicy::Atomic);
            true
        });
        let newly = newly.unwrap_or(false);
        if newly {
            self.marked.fetch_add(1, Ordering::Relaxed);
        }
        newly
    }

    /// Whether the trace should treat `obj` as already handled.
    pub fn is_marked(&self, obj: Address) -> bool {
        self.heap
            .pool()
            .with_region(obj, |r| r.mark_bitmap().test(obj))
            .unwrap_or(false)
    }

    /// Mark `obj` and push it if it was white.
    pub fn mark_and_push(&self, obj: Address, stack: &mut GcAdaptiveStack<'_>) {
        if self.mark_object(obj) {
            stack.push(obj);
        }
    }

    fn scan(&self, obj: Address, stack: &mut GcAdaptiveStack<'_>) {
        self.heap.for_each_ref(obj, &mut |_, value| {
            self.mark_and_push(value, stack);
        });
    }

    fn cancelled(&self) -> bool {
        self.token.is_some_and(|t| t.is_cancelled())
    }

    /// Trace from already-marked grey objects on `stack` on this thread.
    pub fn drain(&self, stack: &mut GcAdaptiveStack<'_>) -> MarkingOutcome {
        while let Some(obj) = stack.pop() {
            if self.cancelled() {
                stack.clear();
                return MarkingOutcome::Aborted;
            }
            self.scan(obj, stack);
        }
        MarkingOutcome::Completed
    }

    /// Mark `roots` and trace everything reachable from them on this thread.
    pub fn mark_from(&self, roots: impl IntoIterator<Item = Address>) -> MarkingOutcome {
        let mut stack = GcAdaptiveStack::new(self.split_threshold, None);
        for root in roots {
            self.mark_and_push(root, &mut stack);
        }
        self.drain(&mut stack)
    }

    /// Trace from grey objects with every worker of `pool`.
    ///
    /// `grey` must already be marked.
    pub fn trace_parallel(&self, grey: Vec<Address>, pool: &WorkerPool) -> MarkingOutcome {
        if grey.is_empty() {
            return MarkingOutcome::Completed;
        }
        if pool.count() == 1 {
            let mut stack = GcAdaptiveStack::new(self.split_threshold, None);
            stack.extend(grey);
            return self.drain(&mut stack);
        }
        let tasks = MarkingTasks::new(pool.count());
        let chunk = grey.len().div_ceil(pool.count()).max(1);
        for part in grey.chunks(chunk) {
            tasks.push(part.to_vec());
        }
        let outcomes = pool.run(|_| {
            let mut stack = GcAdaptiveStack::new(self.split_threshold, Some(&tasks));
            while let Some(task) = tasks.take() {
                stack.extend(task);
                if self.drain(&mut stack) == MarkingOutcome::Aborted {
                    tasks.abort();
                    return MarkingOutcome::Aborted;
                }
            }
            MarkingOutcome::Completed
        });
        if outcomes.contains(&MarkingOutcome::Aborted) || self.cancelled() {
            MarkingOutcome::Aborted
        } else {
            MarkingOutcome::Completed
        }
    }

    /// Mark `roots` and trace in parallel.
    pub fn mark_parallel(
        &self,
        roots: impl IntoIterator<Item = Address>,
        pool: &WorkerPool,
    ) -> MarkingOutcome {
        let grey: Vec<Address> = roots.into_iter().filter(|r| self.mark_object(*r)).collect();
        self.trace_parallel(grey, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::object::{ClassShape, StaticLayout};
    use crate::region::RegionFlags;
    use std::sync::Arc;

    struct Graph {
        heap: Heap,
        nodes: Vec<Address>,
    }

    /// Linked list of `n` nodes spread over two regions, plus one garbage node.
    fn graph(n: usize) -> Graph {
        let layout = Arc::new(StaticLayout::new());
        let config = GcConfig {
            heap_size: 1024 * 1024,
            region_size: 64 * 1024,
            tlab_size: 1024,
            ..GcConfig::default()
        };
        let heap = Heap::new(&config, layout.clone());
        let class = layout.register(ClassShape::Instance {
            size: 32,
            ref_offsets: vec![16, 24],
        });
        let shape = layout.shape(class, 0);
        let a = heap.pool().alloc_region(RegionFlags::OLD).unwrap();
        let b = heap.pool().alloc_region(RegionFlags::EDEN).unwrap();
        let mut nodes = Vec::new();
        for i in 0..=n {
            let region = if i % 2 == 0 { &a } else { &b };
            let obj = region.alloc(shape.size).unwrap();
            heap.initialize_object(obj, shape);
            nodes.push(obj);
        }
        for pair in nodes[..n].windows(2) {
            heap.store_ref(pair[0].offset(16), pair[1]);
        }
        Graph { heap, nodes }
    }

    fn live_total(heap: &Heap) -> usize {
        heap.pool().regions().iter().map(|r| r.live_bytes()).sum()
    }

    #[test]
    fn marks_reachable_objects_only() {
        let g = graph(10);
        let marker = Marker::new(&g.heap, MarkMode::All, LiveBytesPolicy::NonAtomic);
        assert_eq!(marker.mark_from([g.nodes[0]]), MarkingOutcome::Completed);
        assert_eq!(marker.marked_objects(), 10);
        assert!(!marker.is_marked(g.nodes[10]));
        assert_eq!(live_total(&g.heap), 10 * 32);
    }

    #[test]
    fn collection_set_mode_skips_other_regions() {
        let g = graph(6);
        let young = g.heap.pool().region_of(g.nodes[1]).unwrap();
        young.add_flag(RegionFlags::COLLECTION_SET);
        let marker = Marker::new(&g.heap, MarkMode::CollectionSet, LiveBytesPolicy::Atomic);
        // Old node 0 is outside the set: nothing is traced through it.
        marker.mark_from([g.nodes[0]]);
        assert_eq!(marker.marked_objects(), 0);
        marker.mark_from([g.nodes[1]]);
        assert_eq!(marker.marked_objects(), 1);
        assert!(marker.is_marked(g.nodes[1]));
    }

    #[test]
    fn parallel_marking_matches_serial() {
        let g = graph(2000);
        let marker = Marker::new(&g.heap, MarkMode::All, LiveBytesPolicy::Atomic)
            .with_split_threshold(4);
        let outcome = marker.mark_parallel([g.nodes[0]], &WorkerPool::new(4));
        assert_eq!(outcome, MarkingOutcome::Completed);
        assert_eq!(marker.marked_objects(), 2000);
        assert_eq!(live_total(&g.heap), 2000 * 32);
    }

    #[test]
    fn cancellation_aborts_marking() {
        let g = graph(100);
        let token = CancellationToken::new();
        token.cancel();
        let marker = Marker::new(&g.heap, MarkMode::All, LiveBytesPolicy::NonAtomic)
            .with_cancellation(&token);
        assert_eq!(marker.mark_from([g.nodes[0]]), MarkingOutcome::Aborted);
        assert_eq!(marker.marked_objects(), 1);
    }

    #[test]
    fn adaptive_stack_shares_surplus() {
        let tasks = MarkingTasks::new(1);
        let mut stack = GcAdaptiveStack::new(4, Some(&tasks));
        for i in 0..5 {
            stack.push(Address::new(0x1000_0000 + i * 8));
        }
        assert_eq!(stack.len(), 2);
        let shared = tasks.take().unwrap();
        assert_eq!(shared.len(), 3);
        // The only worker goes idle: marking terminates.
        assert!(tasks.take().is_none());
    }
}
