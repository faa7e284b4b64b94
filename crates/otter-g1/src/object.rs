//! Object layout contract.
//!
//! Every heap object starts with two words:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┬─────────────────┐
//! │ mark word            │ class word           │ fields ...      │
//! └──────────────────────┴──────────────────────┴─────────────────┘
//! obj + 0                obj + 8                obj + 16
//! ```
//!
//! The mark word belongs to the collector (forwarding). The class word is
//! opaque here: an [`ObjectModel`] turns it into a size and a list of
//! reference-slot offsets. Two models ship with the crate:
//!
//! - [`StaticLayout`]: class table with fixed field layouts and arrays
//! - [`DynamicLayout`]: every slot holds a tagged value

use parking_lot::RwLock;

use crate::address::{Address, WORD_SIZE, aligned_object_size};

/// Bytes of the mark word plus the class word.
pub const OBJECT_HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Offset of the mark word.
pub const MARK_WORD_OFFSET: usize = 0;

/// Offset of the class word.
pub const CLASS_WORD_OFFSET: usize = WORD_SIZE;

/// Which family of object layouts a runtime uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageKind {
    /// Class-based layouts with statically known reference fields
    Static,
    /// Every slot carries its own tag
    Dynamic,
}

/// Collector-owned header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkWord(usize);

impl MarkWord {
    const FORWARDED: usize = 0b11;

    /// Wrap a raw mark word.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Mark word pointing to the copy at `to`.
    pub const fn forwarded_to(to: Address) -> Self {
        Self(to.raw() | Self::FORWARDED)
    }

    /// Raw value.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Whether the object has been evacuated.
    pub const fn is_forwarded(self) -> bool {
        self.0 & Self::FORWARDED == Self::FORWARDED
    }

    /// Address of the copy, if the object has been evacuated.
    pub const fn forward_address(self) -> Option<Address> {
        if self.is_forwarded() {
            Some(Address::new(self.0 & !Self::FORWARDED))
        } else {
            None
        }
    }
}

/// Size and class word for a new object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectShape {
    /// Object size in bytes, header included
    pub size: usize,
    /// Value for the class word
    pub class_word: usize,
}

/// Traversal capability supplied by the language runtime.
pub trait ObjectModel: Send + Sync {
    /// Layout family.
    fn kind(&self) -> LanguageKind;

    /// Size in bytes of an object with this class word.
    fn object_size(&self, class_word: usize) -> usize;

    /// Visit the byte offsets of every slot that may hold a reference.
    fn visit_reference_offsets(&self, class_word: usize, visitor: &mut dyn FnMut(usize));

    /// Whether a slot value is a heap reference.
    fn is_reference(&self, value: usize) -> bool {
        value != 0
    }
}

/// Identifier of a class registered with [`StaticLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// Layout of one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassShape {
    /// Fixed-size object; `ref_offsets` are byte offsets of reference fields
    Instance {
        /// Total size, header included
        size: usize,
        /// Offsets of reference fields
        ref_offsets: Vec<usize>,
    },
    /// Array of references
    RefArray,
    /// Array of primitive elements (strings, byte buffers)
    PrimitiveArray {
        /// Bytes per element
        element_size: usize,
    },
}

/// Class-table based object model.
///
/// The class word holds the class id in the low 32 bits and the array length
/// in the high 32 bits. Class id 0 is never handed out so that a zeroed word
/// cannot be mistaken for an object.
pub struct StaticLayout {
    classes: RwLock<Vec<ClassShape>>,
}

impl StaticLayout {
    /// Empty class table.
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(vec![ClassShape::PrimitiveArray { element_size: 0 }]),
        }
    }

    /// Register a class and return its id.
    pub fn register(&self, shape: ClassShape) -> ClassId {
        if let ClassShape::Instance { size, ref_offsets } = &shape {
            assert!(*size >= OBJECT_HEADER_SIZE, "instance smaller than header");
            assert!(
                ref_offsets
                    .iter()
                    .all(|o| *o >= OBJECT_HEADER_SIZE && o % WORD_SIZE == 0 && *o < *size),
                "reference field outside instance"
            );
        }
        let mut classes = self.classes.write();
        classes.push(shape);
        ClassId((classes.len() - 1) as u32)
    }

    /// Shape of an object of `class` with `length` array elements.
    pub fn shape(&self, class: ClassId, length: u32) -> ObjectShape {
        let class_word = class.0 as usize | ((length as usize) << 32);
        ObjectShape {
            size: self.object_size(class_word),
            class_word,
        }
    }

    fn split(class_word: usize) -> (usize, usize) {
        (class_word & 0xffff_ffff, class_word >> 32)
    }
}

impl Default for StaticLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectModel for StaticLayout {
    fn kind(&self) -> LanguageKind {
        LanguageKind::Static
    }

    fn object_size(&self, class_word: usize) -> usize {
        let (class, length) = Self::split(class_word);
        let classes = self.classes.read();
        let size = match classes.get(class) {
            Some(ClassShape::Instance { size, .. }) => *size,
            Some(ClassShape::RefArray) => OBJECT_HEADER_SIZE + length * WORD_SIZE,
            Some(ClassShape::PrimitiveArray { element_size }) => {
                OBJECT_HEADER_SIZE + length * element_size
            }
            None => {
                tracing::error!(target: "otter::gc", class_word, "unknown class");
                panic!("object with unknown class word {class_word:#x}");
            }
        };
        aligned_object_size(size)
    }

    fn visit_reference_offsets(&self, class_word: usize, visitor: &mut dyn FnMut(usize)) {
        let (class, length) = Self::split(class_word);
        let classes = self.classes.read();
        match classes.get(class) {
            Some(ClassShape::Instance { ref_offsets, .. }) => {
                ref_offsets.iter().for_each(|o| visitor(*o));
            }
            Some(ClassShape::RefArray) => {
                (0..length).for_each(|i| visitor(OBJECT_HEADER_SIZE + i * WORD_SIZE));
            }
            _ => {}
        }
    }
}

/// Object model where every slot is a tagged value.
///
/// The class word stores `slots << 1 | 1`. Slot values with the low three
/// bits clear (and non-zero) are references; primitives are stored as
/// `value << 1 | 1`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLayout;

impl DynamicLayout {
    /// Shape of an object with `slots` tagged slots.
    pub fn shape(slots: usize) -> ObjectShape {
        let class_word = (slots << 1) | 1;
        ObjectShape {
            size: OBJECT_HEADER_SIZE + slots * WORD_SIZE,
            class_word,
        }
    }

    /// Encode a primitive integer as a slot value.
    pub fn int(value: isize) -> usize {
        ((value << 1) | 1) as usize
    }

    /// Decode a primitive slot value.
    pub fn as_int(slot: usize) -> Option<isize> {
        (slot & 1 == 1).then_some((slot as isize) >> 1)
    }
}

impl ObjectModel for DynamicLayout {
    fn kind(&self) -> LanguageKind {
        LanguageKind::Dynamic
    }

    fn object_size(&self, class_word: usize) -> usize {
        OBJECT_HEADER_SIZE + (class_word >> 1) * WORD_SIZE
    }

    fn visit_reference_offsets(&self, class_word: usize, visitor: &mut dyn FnMut(usize)) {
        (0..class_word >> 1).for_each(|i| visitor(OBJECT_HEADER_SIZE + i * WORD_SIZE));
    }

    fn is_reference(&self, value: usize) -> bool {
        value != 0 && value & 0b111 == 0
    }
}
