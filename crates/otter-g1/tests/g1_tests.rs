//! End-to-end collection cycles through the public API.

use std::sync::{Arc, Once, OnceLock, Weak};

use parking_lot::Mutex;

use otter_g1::address::Address;
use otter_g1::object::OBJECT_HEADER_SIZE;
use otter_g1::{
    DynamicLayout, G1Gc, GcCollectionType, GcConfig, GcListener, GcPhase, GcTask, GcTaskCause,
    Handle, HandleTable, MutatorContext, ObjectModel, ObjectShape, RegionFlags, RootType,
};

const KB: usize = 1024;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn test_config() -> GcConfig {
    GcConfig {
        region_size: 64 * KB,
        heap_size: 4 * 1024 * KB,
        tlab_size: 0,
        enable_concurrent_update_remset: false,
        gc_workers_count: 2,
        ..GcConfig::default()
    }
}

struct Runtime {
    gc: Arc<G1Gc>,
    handles: Arc<HandleTable>,
    ctx: Arc<MutatorContext>,
}

impl Runtime {
    fn new(config: GcConfig) -> Self {
        init_tracing();
        let model: Arc<dyn ObjectModel> = Arc::new(DynamicLayout);
        let gc = G1Gc::new(config, model).unwrap();
        let handles = Arc::new(HandleTable::new(RootType::Handle));
        gc.add_root_provider(handles.clone());
        let ctx = gc.register_mutator();
        Self { gc, handles, ctx }
    }

    fn alloc(&self, slots: usize) -> Address {
        self.gc
            .allocate(Some(&self.ctx), DynamicLayout::shape(slots))
            .unwrap()
    }

    /// Object of exactly `bytes`, header included.
    fn alloc_bytes(&self, bytes: usize) -> Address {
        self.alloc((bytes - OBJECT_HEADER_SIZE) / 8)
    }

    fn root(&self, obj: Address) -> Handle {
        self.handles.create(obj)
    }

    fn get(&self, handle: Handle) -> Address {
        self.handles.get(handle)
    }

    fn set_int(&self, obj: Address, slot: usize, value: isize) {
        self.gc
            .heap()
            .pool()
            .store(obj.offset(OBJECT_HEADER_SIZE + slot * 8), DynamicLayout::int(value));
    }

    fn int(&self, obj: Address, slot: usize) -> Option<isize> {
        let raw = self
            .gc
            .heap()
            .pool()
            .load(obj.offset(OBJECT_HEADER_SIZE + slot * 8));
        DynamicLayout::as_int(raw)
    }

    fn link(&self, obj: Address, slot: usize, value: Address) {
        self.gc
            .write_ref(&self.ctx, obj, OBJECT_HEADER_SIZE + slot * 8, value);
    }

    fn field(&self, obj: Address, slot: usize) -> Address {
        self.gc.read_ref(obj, OBJECT_HEADER_SIZE + slot * 8)
    }

    fn collect(&self, cause: GcTaskCause) -> GcCollectionType {
        let kind = self.gc.run_gc(GcTask::new(cause));
        self.check_invariants();
        kind
    }

    fn check_invariants(&self) {
        for region in self.gc.allocator().all_regions() {
            assert!(!region.in_collection_set(), "region {} still tagged", region.id());
            assert!(
                region.live_bytes() <= region.allocated_bytes(),
                "region {} live {} > allocated {}",
                region.id(),
                region.live_bytes(),
                region.allocated_bytes()
            );
        }
        self.gc.verify_heap().unwrap();
    }
}

#[test]
fn dense_young_region_is_promoted_in_place() {
    let rt = Runtime::new(test_config());
    let handles: Vec<(Handle, Address)> = (0..40)
        .map(|i| {
            let obj = rt.alloc_bytes(KB);
            rt.set_int(obj, 0, i);
            (rt.root(obj), obj)
        })
        .collect();
    let region = rt.gc.heap().pool().region_of(handles[0].1).unwrap();

    assert_eq!(rt.collect(GcTaskCause::Young), GcCollectionType::Young);

    for (i, (handle, obj)) in handles.iter().enumerate() {
        assert_eq!(rt.get(*handle), *obj);
        assert_eq!(rt.int(*obj, 0), Some(i as isize));
    }
    assert!(!region.is_young());
    assert!(region.has_flag(RegionFlags::PROMOTED));
    assert_eq!(region.live_bytes(), 40 * KB);
    let record = rt.gc.stats().last().unwrap();
    assert_eq!(record.promoted_regions, 1);
    assert_eq!(record.moved_objects, 0);
}

#[test]
fn sparse_young_region_is_evacuated() {
    let rt = Runtime::new(test_config());
    let objects: Vec<Address> = (0..60).map(|_| rt.alloc_bytes(KB)).collect();
    let kept: Vec<(Handle, Address)> = objects
        .iter()
        .step_by(6)
        .enumerate()
        .map(|(i, &obj)| {
            rt.set_int(obj, 0, i as isize);
            (rt.root(obj), obj)
        })
        .collect();
    let young = rt.gc.heap().pool().region_of(objects[0]).unwrap();

    rt.collect(GcTaskCause::Young);

    let record = rt.gc.stats().last().unwrap();
    assert_eq!(record.promoted_regions, 0);
    assert_eq!(record.moved_objects, kept.len());
    assert_eq!(record.moved_bytes, kept.len() * KB);
    assert_eq!(record.freed_bytes, (60 - kept.len()) * KB);
    assert!(young.has_flag(RegionFlags::FREE));
    for (i, (handle, old)) in kept.iter().enumerate() {
        let new = rt.get(*handle);
        assert_ne!(new, *old);
        let region = rt.gc.heap().pool().region_of(new).unwrap();
        assert!(region.has_flag(RegionFlags::OLD));
        assert_eq!(rt.int(new, 0), Some(i as isize));
    }
    assert_eq!(rt.gc.allocator().young_region_count(), 0);
}

#[test]
fn shared_object_is_copied_once() {
    let rt = Runtime::new(test_config());
    let obj = rt.alloc(1);
    let a = rt.root(obj);
    let b = rt.root(obj);
    let holder = rt.alloc(2);
    rt.link(holder, 0, obj);
    rt.link(holder, 1, obj);
    let h = rt.root(holder);

    rt.collect(GcTaskCause::Young);

    let moved = rt.get(a);
    assert_ne!(moved, obj);
    assert_eq!(rt.get(b), moved);
    let holder = rt.get(h);
    assert_eq!(rt.field(holder, 0), moved);
    assert_eq!(rt.field(holder, 1), moved);
    assert_eq!(rt.gc.stats().last().unwrap().moved_objects, 2);
}

#[test]
fn old_to_young_reference_keeps_young_object_alive() {
    let rt = Runtime::new(test_config());
    let holder = rt.alloc(1);
    let h = rt.root(holder);
    rt.collect(GcTaskCause::Young);
    let holder = rt.get(h);
    assert!(!rt.gc.heap().pool().region_of(holder).unwrap().is_young());

    // Only the old holder references the new object.
    let young = rt.alloc(1);
    rt.set_int(young, 0, 42);
    rt.link(holder, 0, young);
    rt.collect(GcTaskCause::Young);

    let moved = rt.field(holder, 0);
    assert_ne!(moved, young);
    assert_eq!(rt.int(moved, 0), Some(42));
    let target = rt.gc.heap().pool().region_of(moved).unwrap();
    if !target.contains(holder) {
        assert!(target.remset().contains_ref(holder.offset(OBJECT_HEADER_SIZE)));
    }
}

#[test]
fn humongous_object_lives_until_unreachable() {
    let rt = Runtime::new(test_config());
    let big = rt.alloc(10_000);
    let region = rt.gc.heap().pool().region_of(big).unwrap();
    assert!(region.is_humongous());
    assert_eq!(region.size(), 2 * 64 * KB);
    let h = rt.root(big);

    assert_eq!(rt.collect(GcTaskCause::Oom), GcCollectionType::Full);
    assert_eq!(rt.get(h), big);
    assert_eq!(rt.gc.allocator().humongous_regions().len(), 1);

    rt.handles.release(h);
    rt.collect(GcTaskCause::Oom);
    assert!(rt.gc.allocator().humongous_regions().is_empty());
    assert!(rt.gc.stats().last().unwrap().freed_regions >= 1);
}

#[test]
fn humongous_object_is_swept_by_the_next_concurrent_mark() {
    let rt = Runtime::new(test_config());
    let free_before = rt.gc.heap().pool().free_region_count();
    let big = rt.alloc(10_000);
    let region = rt.gc.heap().pool().region_of(big).unwrap();
    let h = rt.root(big);

    assert_eq!(
        rt.collect(GcTaskCause::HeapUsageThreshold),
        GcCollectionType::None
    );
    assert_eq!(rt.gc.stats().last().unwrap().kind, GcCollectionType::ConcurrentMark);
    assert_eq!(rt.get(h), big);
    assert_eq!(rt.gc.allocator().humongous_regions().len(), 1);
    assert!(!region.has_flag(RegionFlags::FREE));

    rt.handles.release(h);
    rt.collect(GcTaskCause::HeapUsageThreshold);
    assert!(rt.gc.allocator().humongous_regions().is_empty());
    assert!(region.has_flag(RegionFlags::FREE));
    assert!(rt.gc.heap().pool().region_of(big).is_none());
    assert_eq!(rt.gc.heap().pool().free_region_count(), free_before);
    assert!(
        rt.gc
            .stats()
            .records()
            .iter()
            .all(|r| r.kind == GcCollectionType::ConcurrentMark)
    );
}

#[test]
fn dead_humongous_object_drops_its_remset_entries() {
    let rt = Runtime::new(test_config());
    let big = rt.alloc(10_000);
    let held = rt.alloc(1);
    let h = rt.root(held);
    rt.link(big, 0, held);
    let slot = big.offset(OBJECT_HEADER_SIZE);

    rt.collect(GcTaskCause::Young);
    let held = rt.get(h);
    assert_eq!(rt.field(big, 0), held);
    // The rewritten slot's card is rescanned at the start of the next pause.
    rt.collect(GcTaskCause::Young);
    let target = rt.gc.heap().pool().region_of(held).unwrap();
    assert!(target.remset().contains_ref(slot));

    rt.collect(GcTaskCause::Oom);
    assert!(rt.gc.allocator().humongous_regions().is_empty());
    let held = rt.get(h);
    let target = rt.gc.heap().pool().region_of(held).unwrap();
    assert!(!target.remset().contains_ref(slot));
    let mut objects = Vec::new();
    rt.gc.allocator().iterate_objects(&mut |obj| objects.push(obj));
    assert_eq!(objects, vec![held]);
}

#[test]
fn pinned_humongous_object_survives_without_roots() {
    let rt = Runtime::new(test_config());
    let big = rt.alloc(10_000);
    rt.gc.pin_object(big);
    rt.collect(GcTaskCause::Oom);
    assert_eq!(rt.gc.allocator().humongous_regions().len(), 1);
    rt.gc.unpin_object(big);
    rt.collect(GcTaskCause::Oom);
    assert!(rt.gc.allocator().humongous_regions().is_empty());
}

#[test]
fn concurrent_mark_measures_garbage() {
    let rt = Runtime::new(test_config());
    let array = rt.alloc(2);
    let first = rt.alloc(3);
    let second = rt.alloc(3);
    rt.link(array, 0, first);
    rt.link(array, 1, second);
    let h = rt.root(array);
    rt.collect(GcTaskCause::Young);

    let array = rt.get(h);
    let region = rt.gc.heap().pool().region_of(array).unwrap();
    assert_eq!(region.allocated_bytes(), 32 + 2 * 40);
    rt.link(array, 0, Address::NULL);

    assert_eq!(
        rt.collect(GcTaskCause::HeapUsageThreshold),
        GcCollectionType::None
    );
    let record = rt.gc.stats().last().unwrap();
    assert_eq!(record.kind, GcCollectionType::ConcurrentMark);
    assert_eq!(record.phase_line, "[CONCURRENT MARK (Threshold)]");
    assert_eq!(region.live_bytes(), 32 + 40);
    assert_eq!(region.garbage_bytes(), 40);
    assert!(!rt.gc.is_mixed_gc_required());
    assert!(!rt.gc.is_concurrent_marking());
    assert!(!rt.gc.barriers().is_concurrent_marking());
}

#[test]
fn mixed_collection_follows_marking() {
    let config = GcConfig {
        region_garbage_rate_threshold: 50,
        ..test_config()
    };
    let rt = Runtime::new(config);
    let handles: Vec<Handle> = (0..40)
        .map(|i| {
            let obj = rt.alloc_bytes(KB);
            rt.set_int(obj, 0, i);
            rt.root(obj)
        })
        .collect();
    rt.collect(GcTaskCause::Young);
    let survivor = rt.get(handles[7]);
    let promoted = rt.gc.heap().pool().region_of(survivor).unwrap();
    assert!(promoted.has_flag(RegionFlags::PROMOTED));
    for (i, handle) in handles.iter().enumerate() {
        if i != 7 {
            rt.handles.release(*handle);
        }
    }

    rt.collect(GcTaskCause::HeapUsageThreshold);
    assert_eq!(promoted.live_bytes(), KB);
    assert!(rt.gc.is_mixed_gc_required());

    assert_eq!(rt.collect(GcTaskCause::Young), GcCollectionType::Mixed);
    assert_eq!(
        rt.gc.stats().last().unwrap().phase_line,
        "[MIXED (Young)]"
    );
    let moved = rt.get(handles[7]);
    assert_ne!(moved, survivor);
    assert_eq!(rt.int(moved, 0), Some(7));
    assert!(promoted.has_flag(RegionFlags::FREE));
    assert!(!rt.gc.is_mixed_gc_required());
}

#[test]
fn full_collection_compacts_old_regions() {
    let rt = Runtime::new(test_config());
    let handles: Vec<Handle> = (0..40)
        .map(|i| {
            let obj = rt.alloc_bytes(KB);
            rt.set_int(obj, 0, i);
            rt.root(obj)
        })
        .collect();
    rt.collect(GcTaskCause::Young);
    for handle in handles.iter().skip(4) {
        rt.handles.release(*handle);
    }
    let before: Vec<Address> = handles.iter().take(4).map(|h| rt.get(*h)).collect();

    assert_eq!(rt.collect(GcTaskCause::Oom), GcCollectionType::Full);

    let record = rt.gc.stats().last().unwrap();
    assert_eq!(record.phase_line, "[FULL (OOM)]");
    assert_eq!(record.moved_objects, 4);
    assert_eq!(record.freed_bytes, 36 * KB);
    for (i, handle) in handles.iter().take(4).enumerate() {
        let now = rt.get(*handle);
        assert_ne!(now, before[i]);
        assert_eq!(rt.int(now, 0), Some(i as isize));
    }
    assert!(rt.gc.allocator().has_reserved_region());
}

#[test]
fn full_collection_keeps_young_references_consistent() {
    let rt = Runtime::new(test_config());
    let old = rt.alloc(1);
    let h = rt.root(old);
    rt.collect(GcTaskCause::Young);
    let old = rt.get(h);

    let young = rt.alloc(1);
    rt.set_int(young, 0, 9);
    rt.link(old, 0, young);
    rt.collect(GcTaskCause::Oom);

    let old = rt.get(h);
    let young = rt.field(old, 0);
    assert_eq!(rt.int(young, 0), Some(9));
    assert_eq!(rt.gc.allocator().young_region_count(), 0);
}

#[test]
fn non_movable_objects_are_swept() {
    let rt = Runtime::new(test_config());
    let shape = DynamicLayout::shape(1);
    let kept = rt.gc.allocate_non_movable(shape).unwrap();
    let dead = rt.gc.allocate_non_movable(shape).unwrap();
    let h = rt.root(kept);
    rt.collect(GcTaskCause::Oom);

    assert_eq!(rt.get(h), kept);
    let region = rt.gc.heap().pool().region_of(kept).unwrap();
    assert!(region.live_bitmap().test(kept));
    assert!(!region.live_bitmap().test(dead));

    rt.handles.release(h);
    rt.collect(GcTaskCause::Oom);
    assert!(rt.gc.allocator().nonmovable_regions().is_empty());
}

#[derive(Default)]
struct PhaseLog {
    phases: Mutex<Vec<GcPhase>>,
    interrupt: OnceLock<Weak<G1Gc>>,
}

impl GcListener for PhaseLog {
    fn gc_phase_started(&self, phase: GcPhase) {
        self.phases.lock().push(phase);
        if phase == GcPhase::ConcurrentMark
            && let Some(gc) = self.interrupt.get().and_then(Weak::upgrade)
        {
            gc.interrupt_concurrent_marking();
        }
    }
}

#[test]
fn phases_follow_the_cycle() {
    let rt = Runtime::new(test_config());
    let log = Arc::new(PhaseLog::default());
    rt.gc.add_listener(log.clone());
    let obj = rt.alloc(1);
    rt.root(obj);

    rt.collect(GcTaskCause::Explicit);
    assert_eq!(
        std::mem::take(&mut *log.phases.lock()),
        vec![GcPhase::MarkYoung, GcPhase::CollectYoungAndMove]
    );
    assert_eq!(
        rt.gc.stats().last().unwrap().phase_line,
        "[YOUNG (Explicit)]"
    );

    rt.collect(GcTaskCause::Oom);
    assert_eq!(
        std::mem::take(&mut *log.phases.lock()),
        vec![GcPhase::FullMark, GcPhase::Sweep, GcPhase::FullCompact]
    );

    rt.collect(GcTaskCause::StartupComplete);
    assert_eq!(
        std::mem::take(&mut *log.phases.lock()),
        vec![
            GcPhase::InitialMark,
            GcPhase::ConcurrentMark,
            GcPhase::Remark,
            GcPhase::Sweep
        ]
    );
    assert_eq!(rt.gc.phase(), GcPhase::Idle);
}

#[test]
fn explicit_request_runs_full_when_concurrent_gc_is_disabled() {
    let config = GcConfig {
        explicit_concurrent_gc_enabled: false,
        ..test_config()
    };
    let rt = Runtime::new(config);
    rt.alloc(1);
    assert_eq!(rt.collect(GcTaskCause::Explicit), GcCollectionType::Full);
    assert_eq!(
        rt.gc.stats().last().unwrap().phase_line,
        "[FULL (Explicit)]"
    );
}

#[test]
fn interrupted_marking_restores_live_bytes() {
    let rt = Runtime::new(test_config());
    let log = Arc::new(PhaseLog::default());
    let _ = log.interrupt.set(Arc::downgrade(&rt.gc));
    rt.gc.add_listener(log.clone());

    let obj = rt.alloc(4);
    rt.root(obj);
    rt.collect(GcTaskCause::Young);
    let region = rt.gc.allocator().tenured_regions()[0].clone();
    let live = region.live_bytes();
    assert_eq!(live, 48);

    rt.collect(GcTaskCause::HeapUsageThreshold);

    assert_eq!(rt.gc.stats().count_of(GcCollectionType::ConcurrentMark), 0);
    assert!(!log.phases.lock().contains(&GcPhase::Remark));
    assert_eq!(region.live_bytes(), live);
    assert!(!rt.gc.is_concurrent_marking());
    assert!(!rt.gc.barriers().is_concurrent_marking());
    assert!(!rt.gc.is_mixed_gc_required());
}

#[test]
fn allocation_collects_before_failing() {
    let config = GcConfig {
        young_space_percent: 10,
        ..test_config()
    };
    let rt = Runtime::new(config);
    let shape: ObjectShape = DynamicLayout::shape(126);
    // Far more than eden holds; nothing is rooted, so young collections keep up.
    for _ in 0..2000 {
        rt.gc.allocate_or_collect(Some(&rt.ctx), shape).unwrap();
    }
    assert!(rt.gc.stats().count_of(GcCollectionType::Young) > 0);
    rt.check_invariants();
}

#[test]
fn out_of_memory_is_reported() {
    let rt = Runtime::new(test_config());
    let shape = DynamicLayout::shape(126);
    let mut result = Ok(Address::NULL);
    for _ in 0..5000 {
        result = rt.gc.allocate_or_collect(Some(&rt.ctx), shape);
        match result {
            Ok(obj) => {
                rt.root(obj);
            }
            Err(_) => break,
        }
    }
    assert!(matches!(result, Err(otter_g1::GcError::OutOfMemory(_))));
}

#[test]
fn postponed_collections_promote_everything() {
    let rt = Runtime::new(test_config());
    rt.gc.postpone_gc_start();
    let obj = rt.alloc(1);
    let h = rt.root(obj);
    rt.collect(GcTaskCause::Young);
    assert_eq!(rt.get(h), obj);
    assert_eq!(rt.gc.stats().last().unwrap().promoted_regions, 1);
    rt.gc.postpone_gc_end();
    assert!(!rt.gc.is_postponed());
}
