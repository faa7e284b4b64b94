//! Post-collection heap verification.

use rustc_hash::FxHashSet;

use crate::address::Address;
use crate::allocator::ObjectAllocatorG1;
use crate::heap::Heap;

/// Checks that every live object only references allocated objects.
pub struct HeapVerifier<'a> {
    heap: &'a Heap,
    allocator: &'a ObjectAllocatorG1,
}

impl<'a> HeapVerifier<'a> {
    /// Verifier over the objects known to `allocator`.
    pub fn new(heap: &'a Heap, allocator: &'a ObjectAllocatorG1) -> Self {
        Self { heap, allocator }
    }

    /// Run every check and return the number of failures.
    ///
    /// Objects in young regions are valid targets but are not checked as
    /// sources, since dead young objects are only known after marking.
    pub fn verify(&self) -> usize {
        let mut starts: FxHashSet<Address> = FxHashSet::default();
        self.allocator.iterate_objects(&mut |obj| {
            starts.insert(obj);
        });

        let mut failures = 0;
        for region in self.allocator.all_regions() {
            if region.live_bytes() > region.allocated_bytes() {
                tracing::warn!(
                    target: "otter::gc",
                    region = region.id(),
                    live = region.live_bytes(),
                    allocated = region.allocated_bytes(),
                    "live bytes exceed allocated bytes"
                );
                failures += 1;
            }
            if region.is_young() {
                continue;
            }
            region.live_bitmap().iterate_marked(&mut |obj| {
                failures += self.verify_object(obj, &starts);
                true
            });
        }
        if failures > 0 {
            tracing::warn!(target: "otter::gc", failures, objects = starts.len(), "heap verification failed");
        } else {
            tracing::debug!(target: "otter::gc", objects = starts.len(), "heap verified");
        }
        failures
    }

    fn verify_object(&self, obj: Address, starts: &FxHashSet<Address>) -> usize {
        let mut failures = 0;
        if self.heap.mark_word(obj).is_forwarded() {
            tracing::warn!(target: "otter::gc", %obj, "live object still carries a forwarding pointer");
            failures += 1;
        }
        self.heap.for_each_ref(obj, &mut |slot, value| {
            if !starts.contains(&value) {
                tracing::warn!(target: "otter::gc", %obj, %slot, %value, "reference to unallocated memory");
                failures += 1;
            }
        });
        failures
    }
}
