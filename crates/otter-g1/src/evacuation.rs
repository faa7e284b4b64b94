//! Copying live objects out of the collection set.
//!
//! Every worker owns one target region at a time, taken from the allocator's
//! queue of old regions, and a LIFO stack of objects still to be copied.
//! Ownership of an object is decided by one CAS on its mark word: the winner's
//! copy becomes the forwardee, a loser rolls its copy back and uses the
//! winner's address.
//!
//! When no target region is left the object is forwarded to itself. Such an
//! evacuation failure keeps the object where it is; the collector later turns
//! its region into an old region instead of freeing it.

use std::sync::Arc;

use crate::address::Address;
use crate::allocator::ObjectAllocatorG1;
use crate::heap::Heap;
use crate::object::{MARK_WORD_OFFSET, MarkWord};
use crate::region::Region;
use crate::workers::WorkerPool;

/// Another worker forwarded the object first; carries the winner's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyForwarded(pub Address);

/// Shared state of one evacuation.
pub struct Evacuator<'a> {
    heap: &'a Heap,
    allocator: &'a ObjectAllocatorG1,
}

impl<'a> Evacuator<'a> {
    /// Evacuator copying into old regions of `allocator`.
    pub fn new(heap: &'a Heap, allocator: &'a ObjectAllocatorG1) -> Self {
        Self { heap, allocator }
    }

    /// Whether `obj` lives in a region being evacuated.
    #[inline]
    pub fn needs_evacuation(&self, obj: Address) -> bool {
        self.heap
            .pool()
            .with_region(obj, |r| r.in_collection_set())
            .unwrap_or(false)
    }

    /// Evacuate everything reachable from `seeds` with every worker of `pool`.
    ///
    /// Seeds outside the collection set are ignored; seeds in it are copied
    /// and their collection-set referents followed transitively.
    pub fn evacuate_reachable(&self, seeds: Vec<Address>, pool: &WorkerPool) -> EvacuationResult {
        let parts = partition(seeds, pool.count());
        let results = pool.run(|id| {
            let mut worker = EvacuationWorker::new(self);
            if let Some(part) = parts.get(id) {
                for &seed in part {
                    worker.push(seed);
                }
            }
            worker.drain();
            worker.finish()
        });
        EvacuationResult::merge(results)
    }

    /// Evacuate every object marked in the mark bitmaps of `regions`.
    ///
    /// Used by full collections, where marking is already complete and the
    /// regions can be compacted without tracing.
    pub fn evacuate_marked(&self, regions: &[Arc<Region>], pool: &WorkerPool) -> EvacuationResult {
        let results = pool.run(|id| {
            let mut worker = EvacuationWorker::new(self);
            for region in regions.iter().skip(id).step_by(pool.count()) {
                let mut marked = Vec::new();
                region.mark_bitmap().iterate_marked(&mut |obj| {
                    marked.push(obj);
                    true
                });
                for obj in marked {
                    // Only this worker walks the region, so no one else forwards.
                    let _ = worker.evacuate(obj);
                }
            }
            worker.finish()
        });
        EvacuationResult::merge(results)
    }
}

fn partition(items: Vec<Address>, parts: usize) -> Vec<Vec<Address>> {
    let mut out: Vec<Vec<Address>> = (0..parts.max(1)).map(|_| Vec::new()).collect();
    let count = out.len();
    for (i, item) in items.into_iter().enumerate() {
        out[i % count].push(item);
    }
    out
}

/// What one or more workers did.
#[derive(Debug, Default)]
pub struct EvacuationResult {
    /// New locations of copied objects
    pub moved: Vec<Address>,
    /// Objects forwarded to themselves, with their original mark words
    pub self_forwarded: Vec<(Address, MarkWord)>,
    /// Bytes copied
    pub moved_bytes: usize,
    /// Objects copied
    pub moved_objects: usize,
}

impl EvacuationResult {
    fn merge(parts: Vec<EvacuationResult>) -> Self {
        let mut total = EvacuationResult::default();
        for mut part in parts {
            total.moved.append(&mut part.moved);
            total.self_forwarded.append(&mut part.self_forwarded);
            total.moved_bytes += part.moved_bytes;
            total.moved_objects += part.moved_objects;
        }
        total
    }

    /// Whether any object could not be copied.
    pub fn has_failures(&self) -> bool {
        !self.self_forwarded.is_empty()
    }
}

/// Per-thread evacuation state.
pub struct EvacuationWorker<'e, 'a> {
    evacuator: &'e Evacuator<'a>,
    target: Option<Arc<Region>>,
    pending_live: usize,
    stack: Vec<Address>,
    result: EvacuationResult,
}

impl<'e, 'a> EvacuationWorker<'e, 'a> {
    /// Worker without a target region yet.
    pub fn new(evacuator: &'e Evacuator<'a>) -> Self {
        Self {
            evacuator,
            target: None,
            pending_live: 0,
            stack: Vec::new(),
            result: EvacuationResult::default(),
        }
    }

    /// Queue `obj` if it still has to be evacuated.
    pub fn push(&mut self, obj: Address) {
        if obj.is_null() || !self.evacuator.needs_evacuation(obj) {
            return;
        }
        if self.evacuator.heap.mark_word(obj).is_forwarded() {
            return;
        }
        self.stack.push(obj);
    }

    /// Copy and scan queued objects until the stack is empty.
    pub fn drain(&mut self) {
        while let Some(obj) = self.stack.pop() {
            if let Ok(new) = self.evacuate(obj) {
                self.scan(new);
            }
        }
    }

    fn scan(&mut self, obj: Address) {
        let heap = self.evacuator.heap;
        let mut referents = Vec::new();
        heap.for_each_ref(obj, &mut |_, value| referents.push(value));
        for value in referents {
            self.push(value);
        }
    }

    /// Copy `obj` to the worker's target region and install the forwardee.
    ///
    /// Falls back to forwarding `obj` to itself when no target region can be
    /// obtained.
    pub fn evacuate(&mut self, obj: Address) -> Result<Address, AlreadyForwarded> {
        let heap = self.evacuator.heap;
        let mark = heap.mark_word(obj);
        if let Some(to) = mark.forward_address() {
            return Err(AlreadyForwarded(to));
        }
        let size = heap.object_size(obj);
        let Some(dst) = self.allocate(size) else {
            return self.self_forward(obj, mark);
        };
        heap.pool().copy(obj, dst, size);
        // The copy may have picked up a forwarding word installed meanwhile.
        heap.pool().store(dst.offset(MARK_WORD_OFFSET), mark.raw());
        match heap.try_forward(obj, mark, dst) {
            Ok(()) => {
                if let Some(target) = &self.target {
                    target.live_bitmap().set(dst);
                    target.add_allocated_object();
                }
                self.pending_live += size;
                self.result.moved.push(dst);
                self.result.moved_bytes += size;
                self.result.moved_objects += 1;
                Ok(dst)
            }
            Err(winner) => {
                if let Some(target) = &self.target {
                    target.undo_alloc(dst, size);
                }
                Err(AlreadyForwarded(winner))
            }
        }
    }

    fn self_forward(&mut self, obj: Address, mark: MarkWord) -> Result<Address, AlreadyForwarded> {
        match self.evacuator.heap.try_forward(obj, mark, obj) {
            Ok(()) => {
                tracing::debug!(target: "otter::gc", %obj, "evacuation failed, object stays in place");
                self.result.self_forwarded.push((obj, mark));
                Ok(obj)
            }
            Err(winner) => Err(AlreadyForwarded(winner)),
        }
    }

    fn allocate(&mut self, size: usize) -> Option<Address> {
        if let Some(target) = &self.target
            && let Some(addr) = target.alloc(size)
        {
            return Some(addr);
        }
        self.retire_target();
        let allocator = self.evacuator.allocator;
        // Regions too full for this object go back for smaller ones.
        let mut skipped = Vec::new();
        let found = loop {
            let Some(target) = allocator.pop_old_region() else {
                break None;
            };
            if let Some(addr) = target.alloc(size) {
                self.target = Some(target);
                break Some(addr);
            }
            skipped.push(target);
        };
        for region in skipped.into_iter().rev() {
            allocator.push_old_region(region);
        }
        found
    }

    fn retire_target(&mut self) {
        if let Some(target) = self.target.take() {
            target.add_live_bytes(std::mem::take(&mut self.pending_live), true);
            self.evacuator.allocator.push_old_region(target);
        }
    }

    /// Publish live bytes, return the target region and hand back the result.
    pub fn finish(mut self) -> EvacuationResult {
        self.retire_target();
        self.result
    }
}
