//! Collection sets and the policies that fill them.
//!
//! A collection set partitions the regions of one cycle into young, tenured
//! and humongous parts. While a set is active its regions carry
//! [`RegionFlags::COLLECTION_SET`]; [`CollectionSet::untag`] clears the tag
//! again at the end of the cycle.

use std::sync::Arc;

use crate::allocator::GarbageHeap;
use crate::analytics::G1Analytics;
use crate::region::{Region, RegionFlags};

/// Regions collected by one cycle.
#[derive(Default, Clone)]
pub struct CollectionSet {
    young: Vec<Arc<Region>>,
    tenured: Vec<Arc<Region>>,
    humongous: Vec<Arc<Region>>,
}

impl CollectionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding `young`.
    pub fn with_young(young: Vec<Arc<Region>>) -> Self {
        Self {
            young,
            ..Self::default()
        }
    }

    /// Add a region to the part matching its space.
    pub fn add_region(&mut self, region: Arc<Region>) {
        if region.is_young() {
            self.young.push(region);
        } else if region.is_humongous() {
            self.humongous.push(region);
        } else {
            self.tenured.push(region);
        }
    }

    /// Young part.
    pub fn young(&self) -> &[Arc<Region>] {
        &self.young
    }

    /// Tenured part.
    pub fn tenured(&self) -> &[Arc<Region>] {
        &self.tenured
    }

    /// Humongous part.
    pub fn humongous(&self) -> &[Arc<Region>] {
        &self.humongous
    }

    /// Young and tenured regions, whose objects may move.
    pub fn movable(&self) -> impl Iterator<Item = &Arc<Region>> {
        self.young.iter().chain(self.tenured.iter())
    }

    /// Every region of the set.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Region>> {
        self.movable().chain(self.humongous.iter())
    }

    /// Number of movable regions.
    pub fn movable_len(&self) -> usize {
        self.young.len() + self.tenured.len()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.movable_len() + self.humongous.len()
    }

    /// Whether the set holds no region.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the region with `id` belongs to the set.
    pub fn contains(&self, id: usize) -> bool {
        self.iter().any(|r| r.id() == id)
    }

    /// Flag every region as part of the active collection set.
    pub fn tag(&self) {
        for region in self.iter() {
            region.add_flag(RegionFlags::COLLECTION_SET);
        }
    }

    /// Clear the collection-set flag.
    pub fn untag(&self) {
        for region in self.iter() {
            region.remove_flag(RegionFlags::COLLECTION_SET);
        }
    }
}

impl std::fmt::Debug for CollectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = |regions: &[Arc<Region>]| regions.iter().map(|r| r.id()).collect::<Vec<_>>();
        f.debug_struct("CollectionSet")
            .field("young", &ids(&self.young))
            .field("tenured", &ids(&self.tenured))
            .field("humongous", &ids(&self.humongous))
            .finish()
    }
}

fn garbage_rate(region: &Region) -> f64 {
    let allocated = region.allocated_bytes();
    if allocated == 0 {
        return 0.0;
    }
    region.garbage_bytes() as f64 / allocated as f64
}

/// Whether the best candidate is worth a mixed collection.
///
/// `threshold` is a fraction of the region size.
pub fn have_garbage_regions(candidates: &GarbageHeap, threshold: f64) -> bool {
    candidates
        .peek()
        .is_some_and(|top| top.garbage() as f64 / top.region().size() as f64 >= threshold)
}

/// Add up to `count` old regions whose garbage rate reaches `threshold`.
///
/// Candidates are taken by descending garbage; the first one below the
/// threshold ends the selection.
pub fn add_old_regions_max_allowed(
    set: &mut CollectionSet,
    mut candidates: GarbageHeap,
    count: usize,
    threshold: f64,
) {
    for _ in 0..count {
        let Some(candidate) = candidates.pop() else {
            break;
        };
        let region = candidate.into_region();
        let rate = garbage_rate(&region);
        if rate < threshold {
            tracing::debug!(target: "otter::gc", region = region.id(), rate, "garbage rate below threshold");
            break;
        }
        tracing::debug!(target: "otter::gc", region = region.id(), rate, "add old region");
        set.add_region(region);
    }
}

/// Add old regions while their predicted cost fits the pause budget.
///
/// The top candidate is always taken so that mixed collections make
/// progress.
pub fn add_old_regions_according_pause_time_goal(
    set: &mut CollectionSet,
    mut candidates: GarbageHeap,
    threshold: f64,
    budget_us: f64,
    analytics: &G1Analytics,
) {
    let Some(top) = candidates.pop() else {
        return;
    };
    let top = top.into_region();
    let mut budget = budget_us;
    let top_cost = analytics.predict_old_collection_time_us(&top);
    set.add_region(top);
    if budget < top_cost {
        tracing::debug!(target: "otter::gc", "no budget for more than one old region");
        return;
    }
    budget -= top_cost;
    let error = analytics.estimate_prediction_error_us();
    if budget < error {
        return;
    }
    budget -= error;
    let young_cost = analytics.predict_young_collection_time_us(set.young().len());
    if budget < young_cost {
        return;
    }
    budget -= young_cost;

    while let Some(candidate) = candidates.pop() {
        let region = candidate.into_region();
        let rate = garbage_rate(&region);
        if rate < threshold {
            break;
        }
        let cost = analytics.predict_old_collection_time_us(&region);
        if budget < cost {
            tracing::debug!(target: "otter::gc", remaining_us = budget, "pause budget exhausted");
            break;
        }
        budget -= cost;
        set.add_region(region);
    }
}

/// Tenured regions of a full collection, handed out in chunks.
pub struct FullCollectionChunks {
    candidates: std::vec::IntoIter<Arc<Region>>,
    fragmentation_rate: f64,
}

impl FullCollectionChunks {
    /// Chunks over `candidates` (by descending garbage).
    ///
    /// Eden and pinned regions are dropped; a region without garbage is only
    /// compacted when its fragmentation, in percent, reaches
    /// `fragmentation_rate`.
    pub fn new(candidates: GarbageHeap, fragmentation_rate: u32) -> Self {
        let regions: Vec<Arc<Region>> = candidates
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|c| c.into_region())
            .filter(|r| !r.is_eden() && !r.is_pinned())
            .collect();
        Self {
            candidates: regions.into_iter(),
            fragmentation_rate: f64::from(fragmentation_rate),
        }
    }

    /// Next chunk, as large as `have_room(len + 1)` allows.
    ///
    /// Returns `None` once every candidate was handed out.
    pub fn next_chunk(&mut self, have_room: &dyn Fn(usize) -> bool) -> Option<CollectionSet> {
        let mut chunk = CollectionSet::new();
        let mut seen = false;
        while have_room(chunk.movable_len() + 1) {
            let Some(region) = self.candidates.next() else {
                break;
            };
            seen = true;
            if region.garbage_bytes() == 0 {
                let fragmentation = region.fragmentation() * 100.0;
                if fragmentation < self.fragmentation_rate {
                    tracing::trace!(target: "otter::gc", region = region.id(), "skip region without garbage");
                    continue;
                }
            }
            chunk.add_region(region);
        }
        seen.then_some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, HEAP_BASE};
    use crate::allocator::ByGarbage;
    use std::time::Instant;

    fn old_region(id: usize, allocated: usize, live: usize) -> Arc<Region> {
        let region = Arc::new(Region::new(
            id,
            Address::new(HEAP_BASE + id * 64 * 1024),
            64 * 1024,
            RegionFlags::OLD,
        ));
        region.alloc(allocated).unwrap();
        region.set_live_bytes(live);
        region
    }

    fn heap_of(regions: &[Arc<Region>]) -> GarbageHeap {
        regions.iter().cloned().map(ByGarbage::new).collect()
    }

    #[test]
    fn tag_and_untag() {
        let a = old_region(0, 1024, 0);
        let mut set = CollectionSet::new();
        set.add_region(a.clone());
        set.tag();
        assert!(a.in_collection_set());
        assert!(set.contains(0));
        set.untag();
        assert!(!a.in_collection_set());
        assert_eq!(set.tenured().len(), 1);
    }

    #[test]
    fn max_allowed_stops_at_threshold() {
        let regions = [
            old_region(0, 4096, 0),
            old_region(1, 4096, 3000),
            old_region(2, 8192, 0),
        ];
        let mut set = CollectionSet::new();
        add_old_regions_max_allowed(&mut set, heap_of(&regions), 3, 0.9);
        let ids: Vec<usize> = set.tenured().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![2, 0]);

        let mut limited = CollectionSet::new();
        add_old_regions_max_allowed(&mut limited, heap_of(&regions), 1, 0.0);
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn garbage_regions_measured_against_region_size() {
        let regions = [old_region(0, 32 * 1024, 0)];
        assert!(have_garbage_regions(&heap_of(&regions), 0.4));
        assert!(!have_garbage_regions(&heap_of(&regions), 0.6));
        assert!(!have_garbage_regions(&GarbageHeap::new(), 0.0));
    }

    #[test]
    fn pause_goal_always_takes_top_region() {
        let analytics = G1Analytics::new(0.5, Instant::now());
        let dense = [old_region(0, 4096, 4000)];
        let mut set = CollectionSet::new();
        add_old_regions_according_pause_time_goal(&mut set, heap_of(&dense), 0.9, 0.0, &analytics);
        assert_eq!(set.len(), 1);

        let regions = [old_region(0, 4096, 0), old_region(1, 4096, 3000)];
        let mut strict = CollectionSet::new();
        add_old_regions_according_pause_time_goal(&mut strict, heap_of(&regions), 0.5, 1e6, &analytics);
        assert_eq!(strict.len(), 1);

        let mut roomy = CollectionSet::new();
        add_old_regions_according_pause_time_goal(&mut roomy, heap_of(&regions), 0.0, 1e6, &analytics);
        assert_eq!(roomy.len(), 2);
    }

    #[test]
    fn full_chunks_skip_dense_regions() {
        let usable = 64 * 1024 - crate::region::REGION_HEADER_SIZE;
        let dense = old_region(0, usable, usable);
        let sparse = old_region(1, 1024, 512);
        let pinned = old_region(2, 1024, 0);
        pinned.pin();
        let regions = [dense, sparse, pinned];
        let mut chunks = FullCollectionChunks::new(heap_of(&regions), 1);
        let first = chunks.next_chunk(&|n| n <= 1).unwrap();
        assert_eq!(first.tenured().len(), 1);
        assert_eq!(first.tenured()[0].id(), 1);
        let second = chunks.next_chunk(&|n| n <= 1).unwrap();
        assert!(second.is_empty());
        assert!(chunks.next_chunk(&|_| true).is_none());
    }
}
