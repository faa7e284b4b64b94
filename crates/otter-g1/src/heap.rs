//! Heap context: region pool, card table and object model bundled together.
//!
//! Everything that needs to interpret object memory (marking, evacuation,
//! remembered-set scanning, verification) goes through [`Heap`].

use std::sync::Arc;

use crate::address::{Address, HEAP_BASE};
use crate::bitmap::MarkBitmap;
use crate::card_table::CardTable;
use crate::config::GcConfig;
use crate::object::{CLASS_WORD_OFFSET, MARK_WORD_OFFSET, MarkWord, ObjectModel, ObjectShape};
use crate::region::Region;
use crate::region_space::RegionPool;

/// Shared view of the managed heap.
pub struct Heap {
    pool: RegionPool,
    cards: CardTable,
    model: Arc<dyn ObjectModel>,
}

impl Heap {
    /// Create the heap for a validated configuration.
    pub fn new(config: &GcConfig, model: Arc<dyn ObjectModel>) -> Self {
        let count = config.region_count();
        Self {
            pool: RegionPool::new(
                config.region_size,
                count,
                config.region_release_policy,
                config.empty_regions_retained_max,
            ),
            cards: CardTable::new(Address::new(HEAP_BASE), count * config.region_size),
            model,
        }
    }

    /// Region arena.
    pub fn pool(&self) -> &RegionPool {
        &self.pool
    }

    /// Card table.
    pub fn cards(&self) -> &CardTable {
        &self.cards
    }

    /// Object model.
    pub fn model(&self) -> &dyn ObjectModel {
        self.model.as_ref()
    }

    /// Write the header of a freshly allocated object.
    pub fn initialize_object(&self, obj: Address, shape: ObjectShape) {
        self.pool.store(obj.offset(MARK_WORD_OFFSET), 0);
        self.pool.store(obj.offset(CLASS_WORD_OFFSET), shape.class_word);
    }

    /// Class word of `obj`.
    #[inline]
    pub fn class_word(&self, obj: Address) -> usize {
        self.pool.load(obj.offset(CLASS_WORD_OFFSET))
    }

    /// Mark word of `obj`.
    #[inline]
    pub fn mark_word(&self, obj: Address) -> MarkWord {
        MarkWord::from_raw(self.pool.load(obj.offset(MARK_WORD_OFFSET)))
    }

    /// Aligned size of `obj`.
    #[inline]
    pub fn object_size(&self, obj: Address) -> usize {
        self.model.object_size(self.class_word(obj))
    }

    /// New location of `obj` if it has been evacuated.
    #[inline]
    pub fn forwardee(&self, obj: Address) -> Option<Address> {
        self.mark_word(obj).forward_address()
    }

    /// Install a forwarding pointer with a single CAS.
    ///
    /// Returns the winner's address when another thread forwarded first.
    pub fn try_forward(&self, obj: Address, expected: MarkWord, to: Address) -> Result<(), Address> {
        let slot = obj.offset(MARK_WORD_OFFSET);
        match self
            .pool
            .compare_exchange(slot, expected.raw(), MarkWord::forwarded_to(to).raw())
        {
            Ok(_) => Ok(()),
            Err(current) => match MarkWord::from_raw(current).forward_address() {
                Some(winner) => Err(winner),
                None => {
                    tracing::error!(target: "otter::gc", %obj, current, "mark word changed without forwarding");
                    panic!("mark word of {obj} changed without forwarding");
                }
            },
        }
    }

    /// Reference stored in `slot`, or null for primitives.
    #[inline]
    pub fn load_ref(&self, slot: Address) -> Address {
        let value = self.pool.load(slot);
        if self.model.is_reference(value) {
            Address::new(value)
        } else {
            Address::NULL
        }
    }

    /// Store a reference into `slot`.
    #[inline]
    pub fn store_ref(&self, slot: Address, value: Address) {
        self.pool.store(slot, value.raw());
    }

    /// Visit `(slot, referent)` for every non-null reference field of `obj`.
    pub fn for_each_ref(&self, obj: Address, visitor: &mut dyn FnMut(Address, Address)) {
        let class_word = self.class_word(obj);
        if class_word == 0 {
            // Allocated but not yet initialized.
            return;
        }
        self.model.visit_reference_offsets(class_word, &mut |offset| {
            let slot = obj.offset(offset);
            let value = self.load_ref(slot);
            if !value.is_null() {
                visitor(slot, value);
            }
        });
    }

    /// Like [`Heap::for_each_ref`] restricted to slots in `[from, to)`.
    pub fn for_each_ref_in_range(
        &self,
        obj: Address,
        from: Address,
        to: Address,
        visitor: &mut dyn FnMut(Address, Address),
    ) {
        let class_word = self.class_word(obj);
        if class_word == 0 {
            // Allocated but not yet initialized.
            return;
        }
        self.model.visit_reference_offsets(class_word, &mut |offset| {
            let slot = obj.offset(offset);
            if slot < from || slot >= to {
                return;
            }
            let value = self.load_ref(slot);
            if !value.is_null() {
                visitor(slot, value);
            }
        });
    }

    /// Walk every initialized object of `region` by address order.
    ///
    /// The visitor returns `false` to stop.
    pub fn iterate_objects(&self, region: &Region, visitor: &mut dyn FnMut(Address) -> bool) {
        for (from, to) in region.object_ranges() {
            let mut cursor = from;
            while cursor < to {
                let class_word = region.load(cursor.offset(CLASS_WORD_OFFSET));
                if class_word == 0 {
                    break;
                }
                if !visitor(cursor) {
                    return;
                }
                cursor = cursor.offset(self.model.object_size(class_word));
            }
        }
    }

    /// Visit objects marked in `bitmap`.
    pub fn iterate_marked(&self, bitmap: &MarkBitmap, visitor: &mut dyn FnMut(Address) -> bool) {
        bitmap.iterate_marked(visitor);
    }

    /// Visit every object of `region` that overlaps `[from, to)`.
    ///
    /// Young regions are walked linearly; other regions through their live
    /// bitmap, so only objects known to be live are visited.
    pub fn objects_overlapping(
        &self,
        region: &Region,
        from: Address,
        to: Address,
        visitor: &mut dyn FnMut(Address),
    ) {
        if region.is_young() {
            self.iterate_objects(region, &mut |obj| {
                if obj >= to {
                    return false;
                }
                if obj.offset(self.object_size(obj)) > from {
                    visitor(obj);
                }
                true
            });
            return;
        }
        let bitmap = region.live_bitmap();
        let start = if from < region.begin() { region.begin() } else { from };
        if let Some(prev) = bitmap.find_marked_at_or_before(start)
            && prev < start
            && self.class_word(prev) != 0
            && prev.offset(self.object_size(prev)) > start
        {
            visitor(prev);
        }
        bitmap.iterate_marked_in_range(start, to.min(region.end()), &mut |obj| {
            visitor(obj);
            true
        });
    }

    /// Visit references stored in `[from, to)` of `region`.
    pub fn refs_in_range(
        &self,
        region: &Region,
        from: Address,
        to: Address,
        visitor: &mut dyn FnMut(Address, Address),
    ) {
        self.objects_overlapping(region, from, to, &mut |obj| {
            self.for_each_ref_in_range(obj, from, to, visitor);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ClassShape, StaticLayout};
    use crate::region::RegionFlags;

    fn heap() -> (Heap, Arc<StaticLayout>) {
        let layout = Arc::new(StaticLayout::new());
        let config = GcConfig {
            heap_size: 1024 * 1024,
            region_size: 64 * 1024,
            tlab_size: 1024,
            ..GcConfig::default()
        };
        (Heap::new(&config, layout.clone()), layout)
    }

    #[test]
    fn walks_objects_and_fields() {
        let (heap, layout) = heap();
        let node = layout.register(ClassShape::Instance {
            size: 32,
            ref_offsets: vec![16],
        });
        let region = heap.pool().alloc_region(RegionFlags::EDEN).unwrap();
        let shape = layout.shape(node, 0);
        let a = region.alloc(shape.size).unwrap();
        let b = region.alloc(shape.size).unwrap();
        heap.initialize_object(a, shape);
        heap.initialize_object(b, shape);
        heap.store_ref(a.offset(16), b);

        let mut objects = Vec::new();
        heap.iterate_objects(&region, &mut |o| {
            objects.push(o);
            true
        });
        assert_eq!(objects, vec![a, b]);

        let mut refs = Vec::new();
        heap.for_each_ref(a, &mut |slot, value| refs.push((slot, value)));
        assert_eq!(refs, vec![(a.offset(16), b)]);
        assert!(heap.load_ref(b.offset(16)).is_null());
    }

    #[test]
    fn forwarding_race_has_one_winner() {
        let (heap, layout) = heap();
        let class = layout.register(ClassShape::Instance {
            size: 16,
            ref_offsets: vec![],
        });
        let region = heap.pool().alloc_region(RegionFlags::EDEN).unwrap();
        let obj = region.alloc(16).unwrap();
        heap.initialize_object(obj, layout.shape(class, 0));
        let mw = heap.mark_word(obj);
        let first = Address::new(HEAP_BASE + 0x8000);
        let second = Address::new(HEAP_BASE + 0x9000);
        assert_eq!(heap.try_forward(obj, mw, first), Ok(()));
        assert_eq!(heap.try_forward(obj, mw, second), Err(first));
        assert_eq!(heap.forwardee(obj), Some(first));
    }

    #[test]
    fn overlapping_scan_uses_live_bitmap_for_old_regions() {
        let (heap, layout) = heap();
        let big = layout.register(ClassShape::Instance {
            size: 1024,
            ref_offsets: vec![16, 1000],
        });
        let region = heap.pool().alloc_region(RegionFlags::OLD).unwrap();
        let shape = layout.shape(big, 0);
        let obj = region.alloc(shape.size).unwrap();
        heap.initialize_object(obj, shape);
        region.live_bitmap().set(obj);
        let target = Address::new(HEAP_BASE + 0x2_0000);
        heap.store_ref(obj.offset(1000), target);

        let card_start = obj.offset(1000).align_down(512);
        let mut seen = Vec::new();
        heap.refs_in_range(&region, card_start, card_start.offset(512), &mut |slot, value| {
            seen.push((slot, value))
        });
        assert_eq!(seen, vec![(obj.offset(1000), target)]);
    }
}
