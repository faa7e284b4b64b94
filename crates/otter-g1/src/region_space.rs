//! Region pool and region spaces.
//!
//! [`RegionPool`] is an arena of region-sized slots covering the virtual heap
//! range. Slot `i` covers `[HEAP_BASE + i * region_size, ...)`, so resolving
//! an address is a subtraction and a shift. A humongous region is stored in
//! every slot it spans.
//!
//! Freed regions either drop their storage or stay in their slot, flagged
//! `FREE`, on a bounded retained list.
//!
//! [`RegionSpace`] is the set of live regions of one space type.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::address::{Address, HEAP_BASE, WORD_SIZE};
use crate::config::RegionReleasePolicy;
use crate::region::{Region, RegionFlags};

/// Space a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceType {
    /// Eden and survivor regions
    Young,
    /// Old regions
    Tenured,
    /// Regions of non-movable objects
    NonMovable,
    /// Humongous region groups
    Humongous,
}

struct FreeSlots {
    /// Every slot without a live region
    all: BTreeSet<usize>,
    /// Slots whose storage is kept for reuse (subset of `all`)
    retained: Vec<usize>,
}

/// Arena of heap regions.
pub struct RegionPool {
    region_size: usize,
    region_bits: u32,
    slots: Box<[RwLock<Option<Arc<Region>>>]>,
    free: Mutex<FreeSlots>,
    release_policy: RegionReleasePolicy,
    retain_max: usize,
}

#[cold]
fn invalid_address(addr: Address) -> ! {
    tracing::error!(target: "otter::gc", %addr, "access to unallocated heap memory");
    panic!("access to unallocated heap memory at {addr}");
}

impl RegionPool {
    /// Create a pool of `count` slots of `region_size` bytes.
    pub fn new(
        region_size: usize,
        count: usize,
        release_policy: RegionReleasePolicy,
        retain_max: usize,
    ) -> Self {
        Self {
            region_size,
            region_bits: region_size.trailing_zeros(),
            slots: (0..count).map(|_| RwLock::new(None)).collect(),
            free: Mutex::new(FreeSlots {
                all: (0..count).collect(),
                retained: Vec::new(),
            }),
            release_policy,
            retain_max,
        }
    }

    /// Size of one region slot.
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// First address of the heap range.
    pub fn base(&self) -> Address {
        Address::new(HEAP_BASE)
    }

    /// One past the last address of the heap range.
    pub fn end(&self) -> Address {
        self.base().offset(self.slots.len() * self.region_size)
    }

    /// Number of slots without a live region.
    pub fn free_region_count(&self) -> usize {
        self.free.lock().all.len()
    }

    fn slot_begin(&self, slot: usize) -> Address {
        self.base().offset(slot << self.region_bits)
    }

    /// Slot covering `addr`, if inside the heap range.
    #[inline]
    pub fn slot_of(&self, addr: Address) -> Option<usize> {
        if addr.raw() < HEAP_BASE {
            return None;
        }
        let slot = (addr.raw() - HEAP_BASE) >> self.region_bits;
        (slot < self.slots.len()).then_some(slot)
    }

    /// Whether `addr` lies in the heap range.
    pub fn contains(&self, addr: Address) -> bool {
        self.slot_of(addr).is_some()
    }

    /// Live region containing `addr`.
    pub fn region_of(&self, addr: Address) -> Option<Arc<Region>> {
        let slot = self.slot_of(addr)?;
        self.slots[slot]
            .read()
            .as_ref()
            .filter(|r| !r.has_flag(RegionFlags::FREE))
            .cloned()
    }

    /// Live region whose first slot is `id`.
    pub fn region_by_id(&self, id: usize) -> Option<Arc<Region>> {
        self.slots
            .get(id)?
            .read()
            .as_ref()
            .filter(|r| r.id() == id && !r.has_flag(RegionFlags::FREE))
            .cloned()
    }

    /// Run `f` on the live region containing `addr` without cloning it.
    #[inline]
    pub fn with_region<R>(&self, addr: Address, f: impl FnOnce(&Region) -> R) -> Option<R> {
        let slot = self.slot_of(addr)?;
        let guard = self.slots[slot].read();
        match guard.as_ref() {
            Some(region) if !region.has_flag(RegionFlags::FREE) => Some(f(region)),
            _ => None,
        }
    }

    /// Id of the live region containing `addr`.
    #[inline]
    pub fn region_id_of(&self, addr: Address) -> Option<usize> {
        self.with_region(addr, |r| r.id())
    }

    /// Whether two addresses lie in the same region.
    pub fn same_region(&self, a: Address, b: Address) -> bool {
        match (self.slot_of(a), self.slot_of(b)) {
            (Some(x), Some(y)) if x == y => true,
            (Some(_), Some(_)) => {
                let id = self.region_id_of(a);
                id.is_some() && id == self.region_id_of(b)
            }
            _ => false,
        }
    }

    /// All live regions, ordered by id.
    pub fn regions(&self) -> Vec<Arc<Region>> {
        let mut out = Vec::new();
        for (slot, cell) in self.slots.iter().enumerate() {
            if let Some(region) = cell.read().as_ref()
                && region.id() == slot
                && !region.has_flag(RegionFlags::FREE)
            {
                out.push(region.clone());
            }
        }
        out
    }

    /// Take a regular region from the pool.
    pub fn alloc_region(&self, flags: RegionFlags) -> Option<Arc<Region>> {
        let mut free = self.free.lock();
        if let Some(slot) = free.retained.pop() {
            free.all.remove(&slot);
            drop(free);
            let region = self.slots[slot].read().clone()?;
            region.reset(flags);
            return Some(region);
        }
        let slot = free.all.pop_first()?;
        drop(free);
        let region = Arc::new(Region::new(
            slot,
            self.slot_begin(slot),
            self.region_size,
            flags,
        ));
        // Publication: the slot write lock orders the fully built region
        // before any reader that resolves an address into it.
        *self.slots[slot].write() = Some(region.clone());
        Some(region)
    }

    /// Take `count` contiguous slots as one humongous region.
    pub fn alloc_humongous(&self, count: usize, flags: RegionFlags) -> Option<Arc<Region>> {
        let mut free = self.free.lock();
        let first = find_run(&free.all, count)?;
        for slot in first..first + count {
            free.all.remove(&slot);
        }
        free.retained.retain(|s| *s < first || *s >= first + count);
        drop(free);
        let region = Arc::new(Region::new(
            first,
            self.slot_begin(first),
            count * self.region_size,
            flags,
        ));
        for slot in first..first + count {
            *self.slots[slot].write() = Some(region.clone());
        }
        Some(region)
    }

    /// Return a region to the pool.
    pub fn free_region(&self, region: &Arc<Region>) {
        if region.has_flag(RegionFlags::FREE) {
            tracing::error!(target: "otter::gc", region = region.id(), "double free");
            panic!("region {} freed twice", region.id());
        }
        let slots = region.size() / self.region_size;
        let mut free = self.free.lock();
        let retain = slots == 1
            && self.release_policy == RegionReleasePolicy::Retain
            && free.retained.len() < self.retain_max;
        if retain {
            region.reset(RegionFlags::FREE);
            free.retained.push(region.id());
        } else {
            region.add_flag(RegionFlags::FREE);
            for slot in region.id()..region.id() + slots {
                *self.slots[slot].write() = None;
            }
        }
        for slot in region.id()..region.id() + slots {
            free.all.insert(slot);
        }
    }

    /// Drop the storage of every retained region.
    pub fn release_retained(&self) {
        let mut free = self.free.lock();
        for slot in free.retained.drain(..) {
            *self.slots[slot].write() = None;
        }
    }

    /// Number of retained free regions.
    pub fn retained_count(&self) -> usize {
        self.free.lock().retained.len()
    }

    // ---- memory access ----

    /// Read the word at `addr`.
    #[inline]
    pub fn load(&self, addr: Address) -> usize {
        self.with_region(addr, |r| r.load(addr))
            .unwrap_or_else(|| invalid_address(addr))
    }

    /// Read the word at `addr`, `None` outside live regions.
    #[inline]
    pub fn try_load(&self, addr: Address) -> Option<usize> {
        self.with_region(addr, |r| r.load(addr))
    }

    /// Write the word at `addr`.
    #[inline]
    pub fn store(&self, addr: Address, value: usize) {
        self.with_region(addr, |r| r.store(addr, value))
            .unwrap_or_else(|| invalid_address(addr))
    }

    /// Compare-and-swap the word at `addr`.
    #[inline]
    pub fn compare_exchange(&self, addr: Address, current: usize, new: usize) -> Result<usize, usize> {
        self.with_region(addr, |r| r.compare_exchange(addr, current, new))
            .unwrap_or_else(|| invalid_address(addr))
    }

    /// Copy `size` bytes from `src` to `dst`.
    pub fn copy(&self, src: Address, dst: Address, size: usize) {
        let from = self.region_of(src).unwrap_or_else(|| invalid_address(src));
        let to = self.region_of(dst).unwrap_or_else(|| invalid_address(dst));
        for i in 0..size / WORD_SIZE {
            let offset = i * WORD_SIZE;
            to.store(dst.offset(offset), from.load(src.offset(offset)));
        }
    }
}

fn find_run(free: &BTreeSet<usize>, count: usize) -> Option<usize> {
    let mut start = None;
    let mut len = 0;
    let mut prev = None;
    for &slot in free {
        if prev.is_some_and(|p: usize| p + 1 == slot) {
            len += 1;
        } else {
            start = Some(slot);
            len = 1;
        }
        if len == count {
            return start;
        }
        prev = Some(slot);
    }
    None
}

/// Live regions of one space type.
pub struct RegionSpace {
    space: SpaceType,
    regions: Mutex<FxHashMap<usize, Arc<Region>>>,
}

impl RegionSpace {
    /// Empty space.
    pub fn new(space: SpaceType) -> Self {
        Self {
            space,
            regions: Mutex::new(FxHashMap::default()),
        }
    }

    /// Space type.
    pub fn space_type(&self) -> SpaceType {
        self.space
    }

    /// Add a region to the space.
    pub fn add(&self, region: Arc<Region>) {
        self.regions.lock().insert(region.id(), region);
    }

    /// Remove a region from the space.
    pub fn remove(&self, region: &Region) -> Option<Arc<Region>> {
        self.regions.lock().remove(&region.id())
    }

    /// Whether the space holds `region`.
    pub fn contains(&self, region: &Region) -> bool {
        self.regions.lock().contains_key(&region.id())
    }

    /// Snapshot of the regions, ordered by id.
    pub fn regions(&self) -> Vec<Arc<Region>> {
        let mut regions: Vec<_> = self.regions.lock().values().cloned().collect();
        regions.sort_unstable_by_key(|r| r.id());
        regions
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    /// Whether the space has no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }

    /// Number of pool slots occupied by the space.
    pub fn slot_count(&self, region_size: usize) -> usize {
        self.regions
            .lock()
            .values()
            .map(|r| r.size() / region_size)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: usize = 64 * 1024;

    fn pool(policy: RegionReleasePolicy) -> RegionPool {
        RegionPool::new(REGION, 8, policy, 2)
    }

    #[test]
    fn regions_resolve_addresses() {
        let p = pool(RegionReleasePolicy::Release);
        let r = p.alloc_region(RegionFlags::EDEN).unwrap();
        let a = r.alloc(32).unwrap();
        p.store(a, 99);
        assert_eq!(p.load(a), 99);
        assert_eq!(p.region_of(a).unwrap().id(), r.id());
        assert!(p.try_load(p.base().offset(5 * REGION)).is_none());
        assert_eq!(p.free_region_count(), 7);
    }

    #[test]
    fn humongous_occupies_contiguous_slots() {
        let p = pool(RegionReleasePolicy::Release);
        let _a = p.alloc_region(RegionFlags::OLD).unwrap();
        let h = p.alloc_humongous(3, RegionFlags::LARGE_OBJECT).unwrap();
        assert_eq!(h.size(), 3 * REGION);
        let inner = h.begin().offset(2 * REGION + 8);
        assert_eq!(p.region_of(inner).unwrap().id(), h.id());
        assert!(p.same_region(h.begin(), inner));
        p.free_region(&h);
        assert!(p.region_of(inner).is_none());
        assert_eq!(p.free_region_count(), 7);
    }

    #[test]
    fn retain_policy_keeps_bounded_storage() {
        let p = pool(RegionReleasePolicy::Retain);
        let regions: Vec<_> = (0..3)
            .map(|_| p.alloc_region(RegionFlags::OLD).unwrap())
            .collect();
        for r in &regions {
            p.free_region(r);
        }
        assert_eq!(p.retained_count(), 2);
        let reused = p.alloc_region(RegionFlags::EDEN).unwrap();
        assert!(reused.is_eden());
        assert_eq!(p.retained_count(), 1);
        p.release_retained();
        assert_eq!(p.retained_count(), 0);
        assert_eq!(p.free_region_count(), 7);
    }

    #[test]
    #[should_panic]
    fn double_free_is_fatal() {
        let p = pool(RegionReleasePolicy::Release);
        let r = p.alloc_region(RegionFlags::OLD).unwrap();
        p.free_region(&r);
        p.free_region(&r);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let p = pool(RegionReleasePolicy::Release);
        for _ in 0..8 {
            assert!(p.alloc_region(RegionFlags::OLD).is_some());
        }
        assert!(p.alloc_region(RegionFlags::OLD).is_none());
        assert!(p.alloc_humongous(1, RegionFlags::LARGE_OBJECT).is_none());
    }

    #[test]
    fn space_tracks_membership() {
        let p = pool(RegionReleasePolicy::Release);
        let space = RegionSpace::new(SpaceType::Tenured);
        let r = p.alloc_region(RegionFlags::OLD).unwrap();
        space.add(r.clone());
        assert!(space.contains(&r));
        assert_eq!(space.slot_count(REGION), 1);
        space.remove(&r);
        assert!(space.is_empty());
    }
}
