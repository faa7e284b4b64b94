//! Heap addresses and alignment helpers.
//!
//! The collector never hands out host pointers. Every heap location is an
//! [`Address`] in a virtual range starting at [`HEAP_BASE`]; the region pool
//! resolves it to a region id and a word offset inside that region's storage.

use std::fmt;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = 8;

/// Alignment of every object start (and of every object size).
pub const OBJECT_ALIGNMENT: usize = WORD_SIZE;

/// First address of the virtual heap range.
///
/// Non-zero so that a zero word can always be read as a null reference.
pub const HEAP_BASE: usize = 0x1000_0000;

/// A location in the managed heap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    /// The null reference.
    pub const NULL: Address = Address(0);

    /// Wrap a raw address value.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw address value.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Whether this is the null reference.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Byte distance from `base` to this address.
    #[inline]
    pub const fn distance_from(self, base: Address) -> usize {
        self.0 - base.0
    }

    /// Whether the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Round down to a multiple of `align` (a power of two).
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Self(self.0 & !(align - 1))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round an object size up to [`OBJECT_ALIGNMENT`].
#[inline]
pub const fn aligned_object_size(size: usize) -> usize {
    align_up(size, OBJECT_ALIGNMENT)
}
