//! Per-region object bitmaps.
//!
//! One bit per [`OBJECT_ALIGNMENT`](crate::address::OBJECT_ALIGNMENT) bytes of
//! the region's span. A set bit marks the start of an object. Bits are stored
//! in atomic words so that parallel markers can claim objects with
//! [`MarkBitmap::atomic_test_and_set`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::{Address, OBJECT_ALIGNMENT};

const BITS_PER_WORD: usize = 64;

/// Bitmap covering `[begin, begin + span)`.
pub struct MarkBitmap {
    begin: Address,
    span: usize,
    words: Box<[AtomicU64]>,
}

impl MarkBitmap {
    /// Create a cleared bitmap for the given span.
    pub fn new(begin: Address, span: usize) -> Self {
        let bits = span / OBJECT_ALIGNMENT;
        let words = (0..bits.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { begin, span, words }
    }

    #[inline]
    fn locate(&self, addr: Address) -> (usize, u64) {
        debug_assert!(
            addr >= self.begin && addr.distance_from(self.begin) < self.span,
            "address {addr} outside bitmap [{}, +{:#x})",
            self.begin,
            self.span
        );
        let bit = addr.distance_from(self.begin) / OBJECT_ALIGNMENT;
        (bit / BITS_PER_WORD, 1u64 << (bit % BITS_PER_WORD))
    }

    #[inline]
    fn address_of(&self, bit: usize) -> Address {
        self.begin.offset(bit * OBJECT_ALIGNMENT)
    }

    /// Whether `addr` lies in the covered span.
    #[inline]
    pub fn covers(&self, addr: Address) -> bool {
        addr >= self.begin && addr.distance_from(self.begin) < self.span
    }

    /// Set the bit for `addr`.
    #[inline]
    pub fn set(&self, addr: Address) {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_or(mask, Ordering::AcqRel);
    }

    /// Clear the bit for `addr`.
    #[inline]
    pub fn clear(&self, addr: Address) {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Whether the bit for `addr` is set.
    #[inline]
    pub fn test(&self, addr: Address) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Set the bit and report whether it was already set.
    #[inline]
    pub fn atomic_test_and_set(&self, addr: Address) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clear every bit.
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Overwrite this bitmap with the contents of `other` (same span).
    pub fn copy_from(&self, other: &MarkBitmap) {
        debug_assert_eq!(self.span, other.span);
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            dst.store(src.load(Ordering::Acquire), Ordering::Release);
        }
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Visit every marked address in `[from, to)` in ascending order.
    ///
    /// The visitor returns `false` to stop early.
    pub fn iterate_marked_in_range(
        &self,
        from: Address,
        to: Address,
        visitor: &mut dyn FnMut(Address) -> bool,
    ) {
        if from >= to {
            return;
        }
        let first = from.distance_from(self.begin) / OBJECT_ALIGNMENT;
        let last = (to.distance_from(self.begin).min(self.span)).div_ceil(OBJECT_ALIGNMENT);
        let mut bit = first;
        while bit < last {
            let word_index = bit / BITS_PER_WORD;
            let mut word = self.words[word_index].load(Ordering::Acquire);
            word &= u64::MAX << (bit % BITS_PER_WORD);
            if word == 0 {
                bit = (word_index + 1) * BITS_PER_WORD;
                continue;
            }
            let found = word_index * BITS_PER_WORD + word.trailing_zeros() as usize;
            if found >= last {
                return;
            }
            if !visitor(self.address_of(found)) {
                return;
            }
            bit = found + 1;
        }
    }

    /// Visit every marked address in the whole span.
    pub fn iterate_marked(&self, visitor: &mut dyn FnMut(Address) -> bool) {
        self.iterate_marked_in_range(self.begin, self.begin.offset(self.span), visitor);
    }

    /// Closest marked address at or below `addr`, if any.
    pub fn find_marked_at_or_before(&self, addr: Address) -> Option<Address> {
        let bit = addr.distance_from(self.begin) / OBJECT_ALIGNMENT;
        let mut word_index = bit / BITS_PER_WORD;
        let shift = BITS_PER_WORD - 1 - bit % BITS_PER_WORD;
        let mut word = (self.words[word_index].load(Ordering::Acquire) << shift) >> shift;
        loop {
            if word != 0 {
                let found =
                    word_index * BITS_PER_WORD + (BITS_PER_WORD - 1 - word.leading_zeros() as usize);
                return Some(self.address_of(found));
            }
            if word_index == 0 {
                return None;
            }
            word_index -= 1;
            word = self.words[word_index].load(Ordering::Acquire);
        }
    }
}

impl std::fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkBitmap")
            .field("begin", &self.begin)
            .field("span", &self.span)
            .field("marked", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::HEAP_BASE;

    fn bitmap() -> MarkBitmap {
        MarkBitmap::new(Address::new(HEAP_BASE), 64 * 1024)
    }

    #[test]
    fn test_and_set_reports_previous_state() {
        let bm = bitmap();
        let a = Address::new(HEAP_BASE + 0x40);
        assert!(!bm.atomic_test_and_set(a));
        assert!(bm.atomic_test_and_set(a));
        assert!(bm.test(a));
        bm.clear(a);
        assert!(!bm.test(a));
    }

    #[test]
    fn iterates_marked_addresses_in_order() {
        let bm = bitmap();
        let base = Address::new(HEAP_BASE);
        for off in [0x10, 0x18, 0x400, 0x2000, 0x8008] {
            bm.set(base.offset(off));
        }
        let mut seen = Vec::new();
        bm.iterate_marked_in_range(base.offset(0x18), base.offset(0x2008), &mut |a| {
            seen.push(a.distance_from(base));
            true
        });
        assert_eq!(seen, vec![0x18, 0x400, 0x2000]);
        assert_eq!(bm.count(), 5);
    }

    #[test]
    fn iteration_stops_when_visitor_returns_false() {
        let bm = bitmap();
        let base = Address::new(HEAP_BASE);
        bm.set(base.offset(8));
        bm.set(base.offset(16));
        let mut visits = 0;
        bm.iterate_marked(&mut |_| {
            visits += 1;
            false
        });
        assert_eq!(visits, 1);
    }

    #[test]
    fn finds_previous_mark_across_words() {
        let bm = bitmap();
        let base = Address::new(HEAP_BASE);
        bm.set(base.offset(0x100));
        assert_eq!(bm.find_marked_at_or_before(base.offset(0x100)), Some(base.offset(0x100)));
        assert_eq!(bm.find_marked_at_or_before(base.offset(0x3000)), Some(base.offset(0x100)));
        assert_eq!(bm.find_marked_at_or_before(base.offset(0xf8)), None);
    }

    #[test]
    fn copy_from_publishes_marks() {
        let mark = bitmap();
        let live = bitmap();
        let a = Address::new(HEAP_BASE + 0x88);
        mark.set(a);
        live.copy_from(&mark);
        assert!(live.test(a));
        mark.clear_all();
        assert!(mark.is_empty());
        assert!(live.test(a));
    }
}
