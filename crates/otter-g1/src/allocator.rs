//! G1 object allocator.
//!
//! Requests are routed by size and movability:
//!
//! - regular movable objects: bump allocation in eden, optionally through a TLAB
//! - regular non-movable objects: free list, then bump allocation in non-movable regions
//! - anything above the regular limit: a dedicated humongous region group
//!
//! Evacuation and compaction allocate in old regions taken from a
//! lock-protected queue of partially filled regions.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::address::{Address, aligned_object_size};
use crate::config::GcConfig;
use crate::heap::Heap;
use crate::mutator::MutatorContext;
use crate::object::OBJECT_HEADER_SIZE;
use crate::region::{REGION_HEADER_SIZE, Region, RegionFlags};
use crate::region_space::{RegionSpace, SpaceType};

/// Region ordered by garbage bytes, for use in a max-heap.
pub struct ByGarbage {
    garbage: usize,
    region: Arc<Region>,
}

impl ByGarbage {
    /// Snapshot the garbage of `region`.
    pub fn new(region: Arc<Region>) -> Self {
        Self {
            garbage: region.garbage_bytes(),
            region,
        }
    }

    /// Garbage bytes at the time of the snapshot.
    pub fn garbage(&self) -> usize {
        self.garbage
    }

    /// The region.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Unwrap the region.
    pub fn into_region(self) -> Arc<Region> {
        self.region
    }
}

impl PartialEq for ByGarbage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for ByGarbage {}

impl PartialOrd for ByGarbage {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByGarbage {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Lower id first among equals so the order is deterministic.
        self.garbage
            .cmp(&other.garbage)
            .then_with(|| other.region.id().cmp(&self.region.id()))
    }
}

/// Max-heap of regions keyed by garbage bytes.
pub type GarbageHeap = BinaryHeap<ByGarbage>;

/// Allocator for the G1 heap.
pub struct ObjectAllocatorG1 {
    heap: Arc<Heap>,
    region_size: usize,
    regular_limit: usize,
    tlab_size: usize,
    max_young_regions: usize,
    tenured_capacity: usize,
    young: RegionSpace,
    tenured: RegionSpace,
    nonmovable: RegionSpace,
    humongous: RegionSpace,
    eden_current: Mutex<Option<Arc<Region>>>,
    tlab_current: Mutex<Option<Arc<Region>>>,
    nonmovable_current: Mutex<Option<Arc<Region>>>,
    nonmovable_free: Mutex<Vec<(Address, usize)>>,
    old_queue: Mutex<Vec<Arc<Region>>>,
    reserved: Mutex<Option<Arc<Region>>>,
    desired_eden_length: AtomicUsize,
    allocate_black: AtomicBool,
    allocated_since_gc: AtomicUsize,
}

impl ObjectAllocatorG1 {
    /// Create the allocator over `heap`.
    pub fn new(config: &GcConfig, heap: Arc<Heap>) -> Self {
        let max_young_regions = config.max_young_regions();
        Self {
            heap,
            region_size: config.region_size,
            regular_limit: config.region_size - REGION_HEADER_SIZE,
            tlab_size: config.tlab_size,
            max_young_regions,
            tenured_capacity: config.region_count() - max_young_regions,
            young: RegionSpace::new(SpaceType::Young),
            tenured: RegionSpace::new(SpaceType::Tenured),
            nonmovable: RegionSpace::new(SpaceType::NonMovable),
            humongous: RegionSpace::new(SpaceType::Humongous),
            eden_current: Mutex::new(None),
            tlab_current: Mutex::new(None),
            nonmovable_current: Mutex::new(None),
            nonmovable_free: Mutex::new(Vec::new()),
            old_queue: Mutex::new(Vec::new()),
            reserved: Mutex::new(None),
            desired_eden_length: AtomicUsize::new(max_young_regions),
            allocate_black: AtomicBool::new(false),
            allocated_since_gc: AtomicUsize::new(0),
        }
    }

    /// Region size.
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    // ---- mutator allocation ----

    /// Allocate a movable object; `None` means a collection is needed.
    pub fn allocate(&self, ctx: Option<&MutatorContext>, size: usize) -> Option<Address> {
        let size = aligned_object_size(size.max(OBJECT_HEADER_SIZE));
        if size > self.regular_limit {
            return self.allocate_humongous(size);
        }
        let obj = match ctx {
            Some(ctx) if self.tlab_size > 0 && size <= self.tlab_size / 2 => {
                self.allocate_in_tlab(ctx, size)
            }
            _ => self.allocate_young(size),
        }?;
        self.allocated_since_gc.fetch_add(size, Ordering::Relaxed);
        Some(obj)
    }

    /// Allocate an object that will never move.
    pub fn allocate_non_movable(&self, size: usize) -> Option<Address> {
        let size = aligned_object_size(size.max(OBJECT_HEADER_SIZE));
        if size > self.regular_limit {
            return self.allocate_humongous(size);
        }
        let obj = self
            .allocate_from_free_list(size)
            .or_else(|| self.allocate_nonmovable_bump(size))?;
        self.publish_non_regular(obj);
        self.allocated_since_gc.fetch_add(size, Ordering::Relaxed);
        Some(obj)
    }

    fn allocate_young(&self, size: usize) -> Option<Address> {
        if let Some(region) = self.eden_current.lock().clone()
            && let Some(obj) = region.alloc(size)
        {
            region.add_allocated_object();
            return Some(obj);
        }
        let mut current = self.eden_current.lock();
        // Another thread may have installed a fresh region meanwhile.
        if let Some(region) = current.as_ref()
            && let Some(obj) = region.alloc(size)
        {
            region.add_allocated_object();
            return Some(obj);
        }
        let region = self.new_young_region(RegionFlags::EDEN)?;
        let obj = region.alloc(size)?;
        region.add_allocated_object();
        *current = Some(region);
        Some(obj)
    }

    fn allocate_in_tlab(&self, ctx: &MutatorContext, size: usize) -> Option<Address> {
        if let Some(tlab) = ctx.tlab()
            && let Some(obj) = tlab.alloc(size)
        {
            return Some(obj);
        }
        let mut current = self.tlab_current.lock();
        let tlab = match current.as_ref().and_then(|r| r.create_tlab(self.tlab_size)) {
            Some(tlab) => tlab,
            None => {
                let region = self.new_young_region(RegionFlags::EDEN | RegionFlags::TLAB)?;
                let tlab = region.create_tlab(self.tlab_size)?;
                *current = Some(region);
                tlab
            }
        };
        drop(current);
        let obj = tlab.alloc(size)?;
        ctx.set_tlab(Some(tlab));
        Some(obj)
    }

    fn new_young_region(&self, flags: RegionFlags) -> Option<Arc<Region>> {
        if self.young.len() >= self.desired_eden_length() {
            return None;
        }
        let region = self.heap.pool().alloc_region(flags)?;
        self.heap.cards().mark_young(region.begin(), region.end());
        self.young.add(region.clone());
        tracing::trace!(target: "otter::gc", region = region.id(), "new eden region");
        Some(region)
    }

    fn allocate_from_free_list(&self, size: usize) -> Option<Address> {
        let mut free = self.nonmovable_free.lock();
        let index = free.iter().position(|(_, cell)| *cell >= size)?;
        let (addr, cell) = free.swap_remove(index);
        if cell - size >= OBJECT_HEADER_SIZE {
            free.push((addr.offset(size), cell - size));
        }
        drop(free);
        self.heap.pool().with_region(addr, |r| r.zero(addr, size));
        Some(addr)
    }

    fn allocate_nonmovable_bump(&self, size: usize) -> Option<Address> {
        let mut current = self.nonmovable_current.lock();
        if let Some(region) = current.as_ref()
            && let Some(obj) = region.alloc(size)
        {
            region.add_allocated_object();
            return Some(obj);
        }
        if !self.have_tenured_size(1) {
            return None;
        }
        let region = self.heap.pool().alloc_region(RegionFlags::NONMOVABLE)?;
        self.nonmovable.add(region.clone());
        let obj = region.alloc(size)?;
        region.add_allocated_object();
        *current = Some(region);
        Some(obj)
    }

    fn allocate_humongous(&self, size: usize) -> Option<Address> {
        let slots = (REGION_HEADER_SIZE + size).div_ceil(self.region_size);
        if !self.have_tenured_size(slots) {
            return None;
        }
        let region = self
            .heap
            .pool()
            .alloc_humongous(slots, RegionFlags::LARGE_OBJECT)?;
        let obj = region.alloc(size)?;
        region.add_allocated_object();
        self.humongous.add(region);
        self.publish_non_regular(obj);
        self.allocated_since_gc.fetch_add(size, Ordering::Relaxed);
        tracing::debug!(target: "otter::gc", size, slots, %obj, "humongous allocation");
        Some(obj)
    }

    fn publish_non_regular(&self, obj: Address) {
        let black = self.allocate_black.load(Ordering::Acquire);
        self.heap.pool().with_region(obj, |region| {
            region.live_bitmap().set(obj);
            if black {
                region.mark_bitmap().set(obj);
            }
        });
    }

    /// Mark non-movable and humongous allocations live while marking runs.
    pub fn set_allocate_black(&self, enabled: bool) {
        self.allocate_black.store(enabled, Ordering::Release);
    }

    /// Return a dead non-movable object's memory to the free list.
    pub fn free_non_movable_object(&self, region: &Region, obj: Address, size: usize) {
        region.live_bitmap().clear(obj);
        region.mark_bitmap().clear(obj);
        region.zero(obj, size);
        self.nonmovable_free.lock().push((obj, size));
    }

    // ---- spaces ----

    /// Eden regions.
    pub fn young_regions(&self) -> Vec<Arc<Region>> {
        self.young.regions()
    }

    /// Old regions.
    pub fn tenured_regions(&self) -> Vec<Arc<Region>> {
        self.tenured.regions()
    }

    /// Non-movable regions.
    pub fn nonmovable_regions(&self) -> Vec<Arc<Region>> {
        self.nonmovable.regions()
    }

    /// Humongous regions.
    pub fn humongous_regions(&self) -> Vec<Arc<Region>> {
        self.humongous.regions()
    }

    /// Non-movable and humongous regions.
    pub fn non_regular_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = self.nonmovable.regions();
        regions.extend(self.humongous.regions());
        regions
    }

    /// Every region that holds objects.
    pub fn all_regions(&self) -> Vec<Arc<Region>> {
        let mut regions = self.young.regions();
        regions.extend(self.tenured.regions());
        regions.extend(self.non_regular_regions());
        regions
    }

    /// Number of eden regions.
    pub fn young_region_count(&self) -> usize {
        self.young.len()
    }

    /// Eden regions allowed before a young collection is required.
    pub fn desired_eden_length(&self) -> usize {
        self.desired_eden_length.load(Ordering::Acquire)
    }

    /// Upper bound on eden regions.
    pub fn max_young_regions(&self) -> usize {
        self.max_young_regions
    }

    /// Set the eden length chosen by the pause predictor.
    pub fn set_desired_eden_length(&self, length: usize) {
        let length = length.clamp(1, self.max_young_regions);
        self.desired_eden_length.store(length, Ordering::Release);
    }

    /// Slots used by tenured, non-movable, humongous and reserved regions.
    pub fn tenured_slots_used(&self) -> usize {
        let reserved = usize::from(self.reserved.lock().is_some());
        self.tenured.len()
            + self.nonmovable.len()
            + self.humongous.slot_count(self.region_size)
            + reserved
    }

    /// Whether `count` more tenured regions fit within the tenured budget.
    pub fn have_tenured_size(&self, count: usize) -> bool {
        self.tenured_slots_used() + count <= self.tenured_capacity
            && self.have_free_regions(count)
    }

    /// Whether the pool has `count` free slots.
    pub fn have_free_regions(&self, count: usize) -> bool {
        self.heap.pool().free_region_count() >= count
    }

    /// Bytes allocated since the last collection.
    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc.load(Ordering::Relaxed)
    }

    /// Restart the allocation counter.
    pub fn reset_allocation_counter(&self) {
        self.allocated_since_gc.store(0, Ordering::Relaxed);
    }

    // ---- old region queue ----

    /// Take a partially filled old region, or a new one, as evacuation target.
    pub fn pop_old_region(&self) -> Option<Arc<Region>> {
        if let Some(region) = self.old_queue.lock().pop() {
            return Some(region);
        }
        self.new_old_region()
    }

    /// Create a fresh old region.
    pub fn new_old_region(&self) -> Option<Arc<Region>> {
        let region = self.heap.pool().alloc_region(RegionFlags::OLD)?;
        self.tenured.add(region.clone());
        Some(region)
    }

    /// Give an evacuation target back to the queue.
    pub fn push_old_region(&self, region: Arc<Region>) {
        if region.free_bytes() >= OBJECT_HEADER_SIZE {
            self.old_queue.lock().push(region);
        }
    }

    /// Drop every queued evacuation target.
    pub fn clear_old_queue(&self) {
        self.old_queue.lock().clear();
    }

    fn in_old_queue(&self, region: &Region) -> bool {
        self.old_queue.lock().iter().any(|r| r.id() == region.id())
    }

    // ---- reserved region ----

    /// Keep one free region back for full collections.
    pub fn reserve_region_if_needed(&self) {
        let mut reserved = self.reserved.lock();
        if reserved.is_none() {
            *reserved = self
                .heap
                .pool()
                .alloc_region(RegionFlags::OLD | RegionFlags::RESERVED);
        }
    }

    /// Give the reserved region back to the pool.
    pub fn release_reserved_region(&self) -> bool {
        match self.reserved.lock().take() {
            Some(region) => {
                self.heap.pool().free_region(&region);
                true
            }
            None => false,
        }
    }

    /// Whether a region is currently reserved.
    pub fn has_reserved_region(&self) -> bool {
        self.reserved.lock().is_some()
    }

    // ---- collection support ----

    /// Old regions by descending garbage.
    ///
    /// Reserved, pinned and (unless `include_current`) queued evacuation
    /// targets are left out.
    pub fn top_garbage_regions(&self, include_current: bool) -> GarbageHeap {
        self.tenured
            .regions()
            .into_iter()
            .filter(|r| {
                !r.has_flag(RegionFlags::RESERVED)
                    && !r.is_eden()
                    && !r.is_pinned()
                    && (include_current || !self.in_old_queue(r))
            })
            .map(ByGarbage::new)
            .collect()
    }

    /// Promote a young region in place.
    pub fn promote_young_region(&self, region: &Arc<Region>) {
        self.young.remove(region);
        self.forget_young_region(region);
        region.publish_marks();
        region.set_space(RegionFlags::OLD);
        region.remove_flag(RegionFlags::COLLECTION_SET);
        region.add_flag(RegionFlags::PROMOTED);
        self.heap.cards().clear_range(region.begin(), region.end());
        self.tenured.add(region.clone());
    }

    fn forget_young_region(&self, region: &Region) {
        let mut eden = self.eden_current.lock();
        if eden.as_ref().is_some_and(|r| r.id() == region.id()) {
            *eden = None;
        }
        drop(eden);
        let mut tlab = self.tlab_current.lock();
        if tlab.as_ref().is_some_and(|r| r.id() == region.id()) {
            *tlab = None;
        }
    }

    /// Free collected young regions.
    pub fn reset_young_regions(&self, regions: &[Arc<Region>]) {
        for region in regions {
            self.young.remove(region);
            self.forget_young_region(region);
            self.heap.cards().clear_range(region.begin(), region.end());
            self.heap.pool().free_region(region);
        }
    }

    /// Free evacuated or empty tenured regions.
    pub fn free_tenured_regions(&self, regions: &[Arc<Region>]) {
        if regions.is_empty() {
            return;
        }
        let ids: Vec<usize> = regions.iter().map(|r| r.id()).collect();
        self.old_queue.lock().retain(|r| !ids.contains(&r.id()));
        for region in regions {
            self.tenured.remove(region);
            self.heap.cards().clear_range(region.begin(), region.end());
            self.heap.pool().free_region(region);
        }
    }

    /// Free a humongous region group.
    pub fn free_humongous_region(&self, region: &Arc<Region>) {
        self.humongous.remove(region);
        self.heap.cards().clear_range(region.begin(), region.end());
        self.heap.pool().free_region(region);
    }

    /// Free an empty non-movable region.
    pub fn free_nonmovable_region(&self, region: &Arc<Region>) {
        self.nonmovable.remove(region);
        let mut current = self.nonmovable_current.lock();
        if current.as_ref().is_some_and(|r| r.id() == region.id()) {
            *current = None;
        }
        drop(current);
        self.nonmovable_free
            .lock()
            .retain(|(addr, _)| !region.contains(*addr));
        self.heap.cards().clear_range(region.begin(), region.end());
        self.heap.pool().free_region(region);
    }

    /// Retire every TLAB so that young regions are no longer extended.
    pub fn retire_tlabs(&self, threads: &[Arc<MutatorContext>]) {
        for thread in threads {
            thread.set_tlab(None);
        }
        *self.tlab_current.lock() = None;
        *self.eden_current.lock() = None;
    }

    /// Pin the object at `obj`, keeping its region in place.
    pub fn pin_object(&self, obj: Address) {
        self.heap.pool().with_region(obj, |r| r.pin());
    }

    /// Release a pin taken with [`ObjectAllocatorG1::pin_object`].
    pub fn unpin_object(&self, obj: Address) {
        self.heap.pool().with_region(obj, |r| r.unpin());
    }

    /// Visit every object the allocator considers allocated.
    ///
    /// Young regions are walked linearly, other regions through their live
    /// bitmaps.
    pub fn iterate_objects(&self, visitor: &mut dyn FnMut(Address)) {
        for region in self.all_regions() {
            if region.is_young() {
                self.heap.iterate_objects(&region, &mut |obj| {
                    visitor(obj);
                    true
                });
            } else {
                region.live_bitmap().iterate_marked(&mut |obj| {
                    visitor(obj);
                    true
                });
            }
        }
    }
}
