//! Card table covering the whole heap range.
//!
//! One byte per [`CARD_SIZE`] bytes of heap. The post-write barrier marks the
//! card of a slot that received a cross-region reference; the remembered set
//! machinery later clears the card and rescans it.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::address::Address;

/// Size of a card in bytes.
pub const CARD_SIZE: usize = 512;

/// Card state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// No pending cross-region store
    Clear = 0,
    /// A store may have created a cross-region reference
    Marked = 1,
    /// Card of a young region; young objects are always scanned
    Young = 2,
}

impl From<u8> for CardState {
    fn from(v: u8) -> Self {
        match v {
            1 => CardState::Marked,
            2 => CardState::Young,
            _ => CardState::Clear,
        }
    }
}

/// Index of a card in the table.
pub type CardIndex = usize;

/// Card table for the heap range `[base, base + size)`.
pub struct CardTable {
    base: Address,
    size: usize,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Create a table with every card clear.
    pub fn new(base: Address, size: usize) -> Self {
        let cards = (0..size.div_ceil(CARD_SIZE))
            .map(|_| AtomicU8::new(CardState::Clear as u8))
            .collect();
        Self { base, size, cards }
    }

    /// Card covering `addr`.
    #[inline]
    pub fn index_of(&self, addr: Address) -> CardIndex {
        debug_assert!(addr >= self.base && addr.distance_from(self.base) < self.size);
        addr.distance_from(self.base) / CARD_SIZE
    }

    /// First address covered by `card`.
    #[inline]
    pub fn card_start(&self, card: CardIndex) -> Address {
        self.base.offset(card * CARD_SIZE)
    }

    /// One past the last address covered by `card`.
    #[inline]
    pub fn card_end(&self, card: CardIndex) -> Address {
        self.card_start(card).offset(CARD_SIZE)
    }

    /// Current state of `card`.
    #[inline]
    pub fn state(&self, card: CardIndex) -> CardState {
        CardState::from(self.cards[card].load(Ordering::Acquire))
    }

    /// Whether `card` is marked.
    #[inline]
    pub fn is_marked(&self, card: CardIndex) -> bool {
        self.state(card) == CardState::Marked
    }

    /// Whether `card` belongs to a young region.
    #[inline]
    pub fn is_young(&self, card: CardIndex) -> bool {
        self.state(card) == CardState::Young
    }

    /// Mark `card`.
    #[inline]
    pub fn mark(&self, card: CardIndex) {
        self.cards[card].store(CardState::Marked as u8, Ordering::Release);
    }

    /// Clear `card`.
    #[inline]
    pub fn clear(&self, card: CardIndex) {
        self.cards[card].store(CardState::Clear as u8, Ordering::Release);
    }

    /// Set every card of `[from, to)` to `state`.
    pub fn set_range(&self, from: Address, to: Address, state: CardState) {
        if from >= to {
            return;
        }
        let first = self.index_of(from);
        let last = self.index_of(Address::new(to.raw() - 1));
        for card in &self.cards[first..=last] {
            card.store(state as u8, Ordering::Release);
        }
    }

    /// Mark every card of a young region as young.
    pub fn mark_young(&self, from: Address, to: Address) {
        self.set_range(from, to, CardState::Young);
    }

    /// Clear every card of `[from, to)`.
    pub fn clear_range(&self, from: Address, to: Address) {
        self.set_range(from, to, CardState::Clear);
    }

    /// Indices of all marked cards in `[from, to)`.
    pub fn marked_in_range(&self, from: Address, to: Address) -> Vec<CardIndex> {
        if from >= to {
            return Vec::new();
        }
        let first = self.index_of(from);
        let last = self.index_of(Address::new(to.raw() - 1));
        (first..=last).filter(|&c| self.is_marked(c)).collect()
    }

    /// Number of marked cards.
    pub fn marked_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CardState::Marked as u8)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::HEAP_BASE;

    fn table() -> CardTable {
        CardTable::new(Address::new(HEAP_BASE), 1024 * 1024)
    }

    #[test]
    fn index_and_bounds() {
        let ct = table();
        let addr = Address::new(HEAP_BASE + 3 * CARD_SIZE + 17);
        let card = ct.index_of(addr);
        assert_eq!(card, 3);
        assert_eq!(ct.card_start(card).raw(), HEAP_BASE + 3 * CARD_SIZE);
        assert_eq!(ct.card_end(card).raw(), HEAP_BASE + 4 * CARD_SIZE);
    }

    #[test]
    fn mark_and_clear() {
        let ct = table();
        assert_eq!(ct.state(5), CardState::Clear);
        ct.mark(5);
        assert!(ct.is_marked(5));
        assert_eq!(ct.marked_count(), 1);
        ct.clear(5);
        assert!(!ct.is_marked(5));
    }

    #[test]
    fn young_ranges() {
        let ct = table();
        let from = Address::new(HEAP_BASE + 64 * 1024);
        let to = from.offset(64 * 1024);
        ct.mark_young(from, to);
        assert!(ct.is_young(ct.index_of(from)));
        assert!(ct.is_young(ct.index_of(Address::new(to.raw() - 1))));
        assert!(!ct.is_young(ct.index_of(to)));
        ct.mark(ct.index_of(from));
        assert_eq!(ct.marked_in_range(from, to), vec![ct.index_of(from)]);
        ct.clear_range(from, to);
        assert_eq!(ct.state(ct.index_of(from)), CardState::Clear);
    }
}
