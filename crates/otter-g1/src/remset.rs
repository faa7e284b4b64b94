//! Remembered sets.
//!
//! Every region owns a [`RemSet`] listing the locations *outside* the region
//! that may hold a reference *into* it. Locations are grouped by card: the key
//! is the card-aligned base address of the source memory and the value is a
//! bitmap with one bit per word of that card.
//!
//! A region also remembers which regions it has contributed entries to, so
//! that its entries can be dropped everywhere when the region is freed or
//! collected.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::address::{Address, WORD_SIZE};
use crate::card_table::CARD_SIZE;

const _: () = assert!(CARD_SIZE / WORD_SIZE == u64::BITS as usize);

/// Remembered set of a single region.
#[derive(Default)]
pub struct RemSet {
    cards: Mutex<FxHashMap<usize, u64>>,
    ref_regions: Mutex<FxHashSet<usize>>,
}

impl RemSet {
    /// Create an empty remembered set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `slot` (outside this region) references into this region.
    pub fn add_ref(&self, slot: Address) {
        let card = slot.align_down(CARD_SIZE);
        let bit = slot.distance_from(card) / WORD_SIZE;
        *self.cards.lock().entry(card.raw()).or_insert(0) |= 1u64 << bit;
    }

    /// Whether `slot` is recorded.
    pub fn contains_ref(&self, slot: Address) -> bool {
        let card = slot.align_down(CARD_SIZE);
        let bit = slot.distance_from(card) / WORD_SIZE;
        self.cards
            .lock()
            .get(&card.raw())
            .is_some_and(|bits| bits & (1u64 << bit) != 0)
    }

    /// Remember that this region's objects have entries in region `target`.
    pub fn add_ref_region(&self, target: usize) {
        self.ref_regions.lock().insert(target);
    }

    /// Take the set of regions this region has entries in.
    pub fn take_ref_regions(&self) -> Vec<usize> {
        self.ref_regions.lock().drain().collect()
    }

    /// Drop every entry whose source lies in `[begin, end)`.
    pub fn invalidate_range(&self, begin: Address, end: Address) {
        self.cards
            .lock()
            .retain(|card, _| *card < begin.raw() || *card >= end.raw());
    }

    /// Snapshot of `(card base, slot bits)` entries, sorted by address.
    pub fn cards(&self) -> Vec<(Address, u64)> {
        let mut cards: Vec<_> = self
            .cards
            .lock()
            .iter()
            .map(|(card, bits)| (Address::new(*card), *bits))
            .collect();
        cards.sort_unstable_by_key(|(card, _)| *card);
        cards
    }

    /// Visit every recorded slot address.
    pub fn for_each_slot(&self, visitor: &mut dyn FnMut(Address)) {
        for (card, mut bits) in self.cards() {
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                visitor(card.offset(bit * WORD_SIZE));
                bits &= bits - 1;
            }
        }
    }

    /// Number of recorded cards.
    pub fn card_count(&self) -> usize {
        self.cards.lock().len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.cards.lock().is_empty()
    }

    /// Drop all entries and back references.
    pub fn clear(&self) {
        self.cards.lock().clear();
        self.ref_regions.lock().clear();
    }
}

impl std::fmt::Debug for RemSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemSet")
            .field("cards", &self.card_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::HEAP_BASE;

    #[test]
    fn slots_share_a_card_entry() {
        let rs = RemSet::new();
        let card = Address::new(HEAP_BASE + 4 * CARD_SIZE);
        rs.add_ref(card.offset(8));
        rs.add_ref(card.offset(CARD_SIZE - 8));
        rs.add_ref(card.offset(8));
        assert_eq!(rs.card_count(), 1);
        assert!(rs.contains_ref(card.offset(8)));
        assert!(!rs.contains_ref(card.offset(16)));

        let mut slots = Vec::new();
        rs.for_each_slot(&mut |s| slots.push(s));
        assert_eq!(slots, vec![card.offset(8), card.offset(CARD_SIZE - 8)]);
    }

    #[test]
    fn invalidate_range_drops_only_sources_inside() {
        let rs = RemSet::new();
        let base = Address::new(HEAP_BASE);
        rs.add_ref(base.offset(0x100));
        rs.add_ref(base.offset(0x10_0000));
        rs.invalidate_range(base, base.offset(0x1000));
        assert!(!rs.contains_ref(base.offset(0x100)));
        assert!(rs.contains_ref(base.offset(0x10_0000)));
    }

    #[test]
    fn ref_regions_are_drained_once() {
        let rs = RemSet::new();
        rs.add_ref_region(3);
        rs.add_ref_region(3);
        rs.add_ref_region(5);
        let mut taken = rs.take_ref_regions();
        taken.sort_unstable();
        assert_eq!(taken, vec![3, 5]);
        assert!(rs.take_ref_regions().is_empty());
    }
}
