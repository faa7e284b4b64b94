//! Reference fix-up after evacuation.
//!
//! Once every live collection-set object has a forwardee, the slots that may
//! still point at old copies are rewritten:
//!
//! - fields of the copies themselves and of objects kept in place (promoted
//!   regions, evacuation failures)
//! - remembered-set slots cached while marking the collection set
//! - non-heap roots
//!
//! Rewritten slots that now cross regions are recorded again, either straight
//! into the target's remembered set or by dirtying the slot's card for the
//! remembered-set worker.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::address::Address;
use crate::card_table::CardIndex;
use crate::collection_set::CollectionSet;
use crate::heap::Heap;
use crate::region::Region;
use crate::roots::{RootProvider, RootType};
use crate::update_remset::add_cross_region_ref;
use crate::workers::WorkerPool;

/// How rewritten cross-region references reach remembered sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemsetUpdatePolicy {
    /// Dirty the card and let the remembered-set worker rescan it
    EnqueueCards,
    /// Add the slot to the target's remembered set immediately
    UpdateDirectly,
}

/// Remembered-set slots that point into the collection set.
#[derive(Debug, Default)]
pub struct RefCache {
    slots: Vec<Address>,
    scanned_cards: usize,
}

impl RefCache {
    /// Collect the slots recorded in the remembered sets of `set`.
    ///
    /// A slot is kept when its region is outside the set, the object holding
    /// it is live, and it still points into the set.
    pub fn collect(heap: &Heap, set: &CollectionSet) -> Self {
        let mut cache = RefCache::default();
        let mut seen = FxHashSet::default();
        for region in set.iter() {
            cache.scanned_cards += region.remset().card_count();
            region.remset().for_each_slot(&mut |slot| {
                if !seen.insert(slot) {
                    return;
                }
                let Some(source) = heap.pool().region_of(slot) else {
                    return;
                };
                if source.in_collection_set() || !slot_in_live_object(heap, &source, slot) {
                    return;
                }
                let value = heap.load_ref(slot);
                if value.is_null() {
                    return;
                }
                let targets_set = heap
                    .pool()
                    .with_region(value, |r| r.in_collection_set())
                    .unwrap_or(false);
                if targets_set {
                    cache.slots.push(slot);
                }
            });
        }
        cache
    }

    /// Cached slots.
    pub fn slots(&self) -> &[Address] {
        &self.slots
    }

    /// Current referents of the cached slots.
    pub fn referents(&self, heap: &Heap) -> Vec<Address> {
        self.slots
            .iter()
            .map(|&slot| heap.load_ref(slot))
            .filter(|v| !v.is_null())
            .collect()
    }

    /// Remembered-set cards scanned to build the cache.
    pub fn scanned_cards(&self) -> usize {
        self.scanned_cards
    }

    /// Number of cached slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing was cached.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Whether `slot` lies inside an object of `source` known to be live.
///
/// Young regions are judged by their mark bitmap, other regions by their
/// live bitmap.
fn slot_in_live_object(heap: &Heap, source: &Region, slot: Address) -> bool {
    let bitmap = if source.is_young() {
        source.mark_bitmap()
    } else {
        source.live_bitmap()
    };
    bitmap
        .find_marked_at_or_before(slot)
        .is_some_and(|obj| obj.offset(heap.object_size(obj)) > slot)
}

/// Rewrites slots on one thread.
pub struct RefUpdater<'a> {
    heap: &'a Heap,
    policy: RemsetUpdatePolicy,
    cards: Vec<CardIndex>,
    updated: usize,
}

impl<'a> RefUpdater<'a> {
    /// Updater recording cross-region references per `policy`.
    pub fn new(heap: &'a Heap, policy: RemsetUpdatePolicy) -> Self {
        Self {
            heap,
            policy,
            cards: Vec::new(),
            updated: 0,
        }
    }

    fn update_slot(&mut self, source: &Region, slot: Address, value: Address) {
        let value = match self.heap.forwardee(value) {
            Some(to) => {
                if to != value {
                    self.heap.store_ref(slot, to);
                    self.updated += 1;
                }
                to
            }
            None => value,
        };
        if source.contains(value) {
            return;
        }
        match self.policy {
            RemsetUpdatePolicy::UpdateDirectly => {
                add_cross_region_ref(self.heap, source, slot, value);
            }
            RemsetUpdatePolicy::EnqueueCards => {
                let cards = self.heap.cards();
                let card = cards.index_of(slot);
                if !cards.is_young(card) && !cards.is_marked(card) {
                    cards.mark(card);
                    self.cards.push(card);
                }
            }
        }
    }

    /// Rewrite every reference field of `obj`.
    pub fn update_object_fields(&mut self, obj: Address) {
        let Some(source) = self.heap.pool().region_of(obj) else {
            return;
        };
        let mut fields = Vec::new();
        self.heap
            .for_each_ref(obj, &mut |slot, value| fields.push((slot, value)));
        for (slot, value) in fields {
            self.update_slot(&source, slot, value);
        }
    }

    /// Rewrite a cached remembered-set slot.
    pub fn update_cached_slot(&mut self, slot: Address) {
        let value = self.heap.load_ref(slot);
        if value.is_null() {
            return;
        }
        if let Some(source) = self.heap.pool().region_of(slot) {
            self.update_slot(&source, slot, value);
        }
    }

    /// Slots rewritten so far.
    pub fn updated(&self) -> usize {
        self.updated
    }

    /// Cards dirtied for the remembered-set worker.
    pub fn finish(self) -> Vec<CardIndex> {
        self.cards
    }
}

/// Everything a reference update pass walks.
pub struct UpdateWork<'a> {
    /// Copies made by evacuation
    pub moved: &'a [Address],
    /// Regions whose live objects stayed in place
    pub kept_regions: &'a [Arc<Region>],
    /// Remembered-set slots cached during marking
    pub cache: &'a RefCache,
}

/// Rewrite heap references in parallel.
///
/// Returns the dirtied cards (always empty with
/// [`RemsetUpdatePolicy::UpdateDirectly`]) and the number of rewritten slots.
pub fn update_heap_references(
    heap: &Heap,
    pool: &WorkerPool,
    policy: RemsetUpdatePolicy,
    work: &UpdateWork<'_>,
) -> (Vec<CardIndex>, usize) {
    let workers = pool.count();
    let results = pool.run(|id| {
        let mut updater = RefUpdater::new(heap, policy);
        for &obj in work.moved.iter().skip(id).step_by(workers) {
            updater.update_object_fields(obj);
        }
        for region in work.kept_regions.iter().skip(id).step_by(workers) {
            let mut objects = Vec::new();
            region.live_bitmap().iterate_marked(&mut |obj| {
                objects.push(obj);
                true
            });
            for obj in objects {
                updater.update_object_fields(obj);
            }
        }
        for &slot in work.cache.slots().iter().skip(id).step_by(workers) {
            updater.update_cached_slot(slot);
        }
        let updated = updater.updated();
        (updater.finish(), updated)
    });
    let mut cards = Vec::new();
    let mut updated = 0;
    for (mut part, count) in results {
        cards.append(&mut part);
        updated += count;
    }
    (cards, updated)
}

/// Point root slots at the forwardees of evacuated objects.
pub fn update_roots(heap: &Heap, roots: &[Arc<dyn RootProvider>]) -> usize {
    let mut updated = 0;
    for provider in roots {
        provider.visit_roots(&mut |_: RootType, slot: &mut Address| {
            if slot.is_null() || heap.pool().region_id_of(*slot).is_none() {
                return;
            }
            if let Some(to) = heap.forwardee(*slot)
                && to != *slot
            {
                *slot = to;
                updated += 1;
            }
        });
    }
    updated
}
