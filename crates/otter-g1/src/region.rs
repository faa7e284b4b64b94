//! Heap regions.
//!
//! A region is a size-aligned span `[begin, end)` of the virtual heap with
//! its own word storage, a bump pointer, liveness bookkeeping and a
//! remembered set. Humongous regions span several region-sized slots but are
//! still a single [`Region`].
//!
//! ```text
//! Region:
//! ┌─────────────┬───────────────────────────────┬───────────────┐
//! │ header (64) │ objects (bump allocated)      │ free          │
//! └─────────────┴───────────────────────────────┴───────────────┘
//! begin                                         top             end
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::address::{Address, WORD_SIZE, aligned_object_size};
use crate::bitmap::MarkBitmap;
use crate::remset::RemSet;

/// Bytes reserved at the start of every region.
pub const REGION_HEADER_SIZE: usize = 64;

/// Region attribute bits.
///
/// Exactly one of the space bits (`EDEN`, `SURVIVOR`, `OLD`, `NONMOVABLE`,
/// `LARGE_OBJECT`) is set on a live region; the rest are orthogonal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegionFlags(u32);

impl RegionFlags {
    /// Freshly allocated young objects
    pub const EDEN: Self = Self(1);
    /// Young objects that survived a collection
    pub const SURVIVOR: Self = Self(1 << 1);
    /// Tenured objects
    pub const OLD: Self = Self(1 << 2);
    /// One humongous object
    pub const LARGE_OBJECT: Self = Self(1 << 3);
    /// Objects that never move
    pub const NONMOVABLE: Self = Self(1 << 4);
    /// Memory is handed out as thread-local allocation buffers
    pub const TLAB: Self = Self(1 << 5);
    /// Part of the current collection set
    pub const COLLECTION_SET: Self = Self(1 << 6);
    /// Region sits in the pool without a space
    pub const FREE: Self = Self(1 << 7);
    /// Young region promoted in place during the current pause
    pub const PROMOTED: Self = Self(1 << 8);
    /// Kept back so a full collection can always make progress
    pub const RESERVED: Self = Self(1 << 9);

    const SPACE_MASK: u32 = 0b1_1111;

    /// No bits set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit in `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Union of two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for RegionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for RegionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 10] = [
            "EDEN",
            "SURVIVOR",
            "OLD",
            "LARGE_OBJECT",
            "NONMOVABLE",
            "TLAB",
            "COLLECTION_SET",
            "FREE",
            "PROMOTED",
            "RESERVED",
        ];
        let mut list = f.debug_set();
        for (bit, name) in NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                list.entry(name);
            }
        }
        list.finish()
    }
}

/// Thread-local allocation buffer carved out of an eden region.
pub struct Tlab {
    start: Address,
    end: Address,
    top: AtomicUsize,
    objects: AtomicUsize,
}

impl Tlab {
    fn new(start: Address, size: usize) -> Self {
        Self {
            start,
            end: start.offset(size),
            top: AtomicUsize::new(start.raw()),
            objects: AtomicUsize::new(0),
        }
    }

    /// Bump-allocate `size` bytes.
    pub fn alloc(&self, size: usize) -> Option<Address> {
        let size = aligned_object_size(size);
        let top = self.top.load(Ordering::Relaxed);
        if top + size > self.end.raw() {
            return None;
        }
        self.top.store(top + size, Ordering::Release);
        self.objects.fetch_add(1, Ordering::Relaxed);
        Some(Address::new(top))
    }

    /// Objects allocated from the buffer.
    pub fn objects(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    /// First address of the buffer.
    pub fn start(&self) -> Address {
        self.start
    }

    /// Current allocation pointer.
    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }

    /// Bytes handed out so far.
    pub fn occupied(&self) -> usize {
        self.top().distance_from(self.start)
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.end.distance_from(self.top())
    }
}

/// A region of the G1 heap.
pub struct Region {
    id: usize,
    begin: Address,
    end: Address,
    storage: Box<[AtomicUsize]>,
    top: AtomicUsize,
    flags: AtomicU32,
    live_bytes: AtomicUsize,
    allocated_objects: AtomicUsize,
    pinned: AtomicUsize,
    mark_bitmap: MarkBitmap,
    live_bitmap: MarkBitmap,
    remset: RemSet,
    tlabs: Mutex<Vec<Arc<Tlab>>>,
}

impl Region {
    /// Create a region covering `[begin, begin + span)` with zeroed storage.
    pub fn new(id: usize, begin: Address, span: usize, flags: RegionFlags) -> Self {
        let storage = (0..span / WORD_SIZE).map(|_| AtomicUsize::new(0)).collect();
        Self {
            id,
            begin,
            end: begin.offset(span),
            storage,
            top: AtomicUsize::new(begin.raw() + REGION_HEADER_SIZE),
            flags: AtomicU32::new(flags.bits()),
            live_bytes: AtomicUsize::new(0),
            allocated_objects: AtomicUsize::new(0),
            pinned: AtomicUsize::new(0),
            mark_bitmap: MarkBitmap::new(begin, span),
            live_bitmap: MarkBitmap::new(begin, span),
            remset: RemSet::new(),
            tlabs: Mutex::new(Vec::new()),
        }
    }

    /// Index of the first pool slot the region occupies.
    pub fn id(&self) -> usize {
        self.id
    }

    /// First address of the region.
    pub fn begin(&self) -> Address {
        self.begin
    }

    /// One past the last address of the region.
    pub fn end(&self) -> Address {
        self.end
    }

    /// Total span in bytes.
    pub fn size(&self) -> usize {
        self.end.distance_from(self.begin)
    }

    /// First address usable for objects.
    pub fn object_start(&self) -> Address {
        self.begin.offset(REGION_HEADER_SIZE)
    }

    /// Current bump pointer.
    pub fn top(&self) -> Address {
        Address::new(self.top.load(Ordering::Acquire))
    }

    /// Whether `addr` lies inside the region.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.begin && addr < self.end
    }

    // ---- flags ----

    /// Current flags.
    pub fn flags(&self) -> RegionFlags {
        RegionFlags(self.flags.load(Ordering::Acquire))
    }

    /// Whether every bit of `flag` is set.
    pub fn has_flag(&self, flag: RegionFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Set the bits of `flag`.
    pub fn add_flag(&self, flag: RegionFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Clear the bits of `flag`.
    pub fn remove_flag(&self, flag: RegionFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Replace the space bit, keeping orthogonal bits.
    pub fn set_space(&self, space: RegionFlags) {
        let _ = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((bits & !RegionFlags::SPACE_MASK) | space.bits())
            });
    }

    /// Eden or survivor region.
    pub fn is_young(&self) -> bool {
        self.flags()
            .intersects(RegionFlags::EDEN | RegionFlags::SURVIVOR)
    }

    /// Eden region.
    pub fn is_eden(&self) -> bool {
        self.has_flag(RegionFlags::EDEN)
    }

    /// Humongous region.
    pub fn is_humongous(&self) -> bool {
        self.has_flag(RegionFlags::LARGE_OBJECT)
    }

    /// Non-movable region.
    pub fn is_nonmovable(&self) -> bool {
        self.has_flag(RegionFlags::NONMOVABLE)
    }

    /// Region whose objects are never moved.
    pub fn is_non_regular(&self) -> bool {
        self.flags()
            .intersects(RegionFlags::LARGE_OBJECT | RegionFlags::NONMOVABLE)
    }

    /// Part of the current collection set.
    pub fn in_collection_set(&self) -> bool {
        self.has_flag(RegionFlags::COLLECTION_SET)
    }

    /// Region carved into TLABs.
    pub fn is_tlab(&self) -> bool {
        self.has_flag(RegionFlags::TLAB)
    }

    // ---- allocation ----

    /// Lock-free bump allocation, `None` when the region is full.
    pub fn alloc(&self, size: usize) -> Option<Address> {
        let size = aligned_object_size(size);
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            let new_top = top.checked_add(size)?;
            if new_top > self.end.raw() {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                new_top,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Address::new(top)),
                Err(current) => top = current,
            }
        }
    }

    /// Roll back the most recent allocation of `size` bytes at `addr`.
    ///
    /// Only the owner of the region may call this; the memory is zeroed so the
    /// region stays walkable.
    pub fn undo_alloc(&self, addr: Address, size: usize) {
        let size = aligned_object_size(size);
        self.zero(addr, size);
        let _ = self.top.compare_exchange(
            addr.raw() + size,
            addr.raw(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Carve a TLAB of `size` bytes out of the region.
    pub fn create_tlab(&self, size: usize) -> Option<Arc<Tlab>> {
        let start = self.alloc(size)?;
        let tlab = Arc::new(Tlab::new(start, aligned_object_size(size)));
        self.tlabs.lock().push(tlab.clone());
        Some(tlab)
    }

    /// Ranges of the region that may contain objects.
    ///
    /// TLAB regions report one range per TLAB.
    pub fn object_ranges(&self) -> Vec<(Address, Address)> {
        if self.is_tlab() {
            let tlabs = self.tlabs.lock();
            let mut ranges: Vec<_> = tlabs.iter().map(|t| (t.start(), t.top())).collect();
            let tlab_end = tlabs
                .iter()
                .map(|t| t.end)
                .max()
                .unwrap_or(self.object_start());
            drop(tlabs);
            // Shared allocations made after the TLABs ran out follow the last one.
            if self.top() > tlab_end {
                ranges.push((tlab_end, self.top()));
            }
            ranges
        } else {
            vec![(self.object_start(), self.top())]
        }
    }

    /// Bytes occupied by allocated objects (TLAB slack excluded).
    pub fn allocated_bytes(&self) -> usize {
        self.object_ranges()
            .iter()
            .map(|(from, to)| to.distance_from(*from))
            .sum()
    }

    /// Bytes still available for bump allocation.
    pub fn free_bytes(&self) -> usize {
        self.end.distance_from(self.top())
    }

    /// Count one more object as allocated.
    pub fn add_allocated_object(&self) {
        self.allocated_objects.fetch_add(1, Ordering::Relaxed);
    }

    /// Objects allocated in the region, including those handed out by its TLABs.
    pub fn allocated_objects(&self) -> usize {
        let shared = self.allocated_objects.load(Ordering::Relaxed);
        if !self.is_tlab() {
            return shared;
        }
        shared + self.tlabs.lock().iter().map(|t| t.objects()).sum::<usize>()
    }

    // ---- liveness ----

    /// Bytes found live by the last completed trace.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Add `bytes` to the live counter.
    ///
    /// `atomic` is false only when a single thread owns the region.
    pub fn add_live_bytes(&self, bytes: usize, atomic: bool) {
        if atomic {
            self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        } else {
            let current = self.live_bytes.load(Ordering::Relaxed);
            self.live_bytes.store(current + bytes, Ordering::Release);
        }
    }

    /// Overwrite the live counter.
    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Release);
    }

    /// `allocated - live`.
    pub fn garbage_bytes(&self) -> usize {
        self.allocated_bytes().saturating_sub(self.live_bytes())
    }

    /// Share of the region that is not allocated, in `[0, 1]`.
    pub fn fragmentation(&self) -> f64 {
        let usable = self.end.distance_from(self.object_start());
        (usable - self.allocated_bytes().min(usable)) as f64 / usable as f64
    }

    /// Bitmap of the trace in progress.
    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.mark_bitmap
    }

    /// Bitmap of objects known to be live (or freshly allocated).
    pub fn live_bitmap(&self) -> &MarkBitmap {
        &self.live_bitmap
    }

    /// Publish the mark bitmap as the live bitmap.
    pub fn publish_marks(&self) {
        self.live_bitmap.copy_from(&self.mark_bitmap);
    }

    /// Remembered set of references into this region.
    pub fn remset(&self) -> &RemSet {
        &self.remset
    }

    // ---- pinning ----

    /// Pin one object in the region.
    pub fn pin(&self) {
        self.pinned.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one pin.
    pub fn unpin(&self) {
        let previous = self.pinned.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            tracing::error!(target: "otter::gc", region = self.id, "unbalanced unpin");
            panic!("region {} unpinned more often than pinned", self.id);
        }
    }

    /// Whether any object of the region is pinned.
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire) > 0
    }

    // ---- memory ----

    #[inline]
    fn word(&self, addr: Address) -> &AtomicUsize {
        debug_assert!(addr.is_aligned(WORD_SIZE), "unaligned access at {addr}");
        &self.storage[addr.distance_from(self.begin) / WORD_SIZE]
    }

    /// Read the word at `addr`.
    #[inline]
    pub fn load(&self, addr: Address) -> usize {
        self.word(addr).load(Ordering::Acquire)
    }

    /// Write the word at `addr`.
    #[inline]
    pub fn store(&self, addr: Address, value: usize) {
        self.word(addr).store(value, Ordering::Release);
    }

    /// Compare-and-swap the word at `addr`.
    #[inline]
    pub fn compare_exchange(
        &self,
        addr: Address,
        current: usize,
        new: usize,
    ) -> Result<usize, usize> {
        self.word(addr)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Zero `size` bytes starting at `addr`.
    pub fn zero(&self, addr: Address, size: usize) {
        for i in 0..size / WORD_SIZE {
            self.store(addr.offset(i * WORD_SIZE), 0);
        }
    }

    /// Return the region to its pristine state with the given space flags.
    pub fn reset(&self, flags: RegionFlags) {
        let used = self.top().distance_from(self.begin);
        self.zero(self.begin, used);
        self.top
            .store(self.object_start().raw(), Ordering::Release);
        self.live_bytes.store(0, Ordering::Release);
        self.allocated_objects.store(0, Ordering::Relaxed);
        self.pinned.store(0, Ordering::Release);
        self.mark_bitmap.clear_all();
        self.live_bitmap.clear_all();
        self.remset.clear();
        self.tlabs.lock().clear();
        self.flags.store(flags.bits(), Ordering::Release);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("top", &self.top())
            .field("flags", &self.flags())
            .field("live_bytes", &self.live_bytes())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::HEAP_BASE;

    const SIZE: usize = 64 * 1024;

    fn region() -> Region {
        Region::new(0, Address::new(HEAP_BASE), SIZE, RegionFlags::EDEN)
    }

    #[test]
    fn bump_allocation_until_full() {
        let r = region();
        let first = r.alloc(24).expect("fits");
        assert_eq!(first, r.object_start());
        let second = r.alloc(10).expect("fits");
        assert_eq!(second, first.offset(24));
        assert_eq!(r.allocated_bytes(), 40);
        assert!(r.alloc(SIZE).is_none());
    }

    #[test]
    fn undo_alloc_restores_top() {
        let r = region();
        let a = r.alloc(32).unwrap();
        r.store(a, 7);
        r.undo_alloc(a, 32);
        assert_eq!(r.top(), a);
        assert_eq!(r.load(a), 0);
    }

    #[test]
    fn tlab_objects_count_towards_the_region() {
        let r = Region::new(
            0,
            Address::new(HEAP_BASE),
            SIZE,
            RegionFlags::EDEN | RegionFlags::TLAB,
        );
        let tlab = r.create_tlab(1024).unwrap();
        for _ in 0..10 {
            tlab.alloc(32).unwrap();
        }
        assert_eq!(tlab.objects(), 10);
        assert_eq!(r.allocated_objects(), 10);
        r.alloc(32).unwrap();
        r.add_allocated_object();
        assert_eq!(r.allocated_objects(), 11);
        r.reset(RegionFlags::EDEN);
        assert_eq!(r.allocated_objects(), 0);
    }

    #[test]
    fn flags_space_replacement_keeps_orthogonal_bits() {
        let r = region();
        r.add_flag(RegionFlags::COLLECTION_SET);
        r.set_space(RegionFlags::OLD);
        assert!(r.has_flag(RegionFlags::OLD));
        assert!(!r.is_young());
        assert!(r.in_collection_set());
    }

    #[test]
    fn tlab_regions_report_per_tlab_ranges() {
        let r = region();
        r.add_flag(RegionFlags::TLAB);
        let t1 = r.create_tlab(1024).unwrap();
        let t2 = r.create_tlab(1024).unwrap();
        t1.alloc(16).unwrap();
        t2.alloc(48).unwrap();
        assert_eq!(r.allocated_bytes(), 64);
        assert_eq!(r.object_ranges().len(), 2);
        assert_eq!(t1.remaining(), 1024 - 16);
    }

    #[test]
    fn garbage_is_allocated_minus_live() {
        let r = region();
        r.alloc(100).unwrap();
        r.add_live_bytes(40, true);
        r.add_live_bytes(8, false);
        assert_eq!(r.garbage_bytes(), 104 - 48);
    }

    #[test]
    fn reset_clears_everything() {
        let r = region();
        let a = r.alloc(16).unwrap();
        r.store(a, 42);
        r.mark_bitmap().set(a);
        r.pin();
        r.reset(RegionFlags::OLD);
        assert_eq!(r.top(), r.object_start());
        assert_eq!(r.load(a), 0);
        assert!(r.mark_bitmap().is_empty());
        assert!(!r.is_pinned());
        assert_eq!(r.flags(), RegionFlags::OLD);
    }

    #[test]
    #[should_panic]
    fn unbalanced_unpin_is_fatal() {
        region().unpin();
    }
}
