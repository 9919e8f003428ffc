//! Weak reference clearing

use crate::common::Fixture;
use memory_manager::GcHeader;

#[test]
fn test_dead_referent_is_cleared() {
    let f = Fixture::new();
    let weak = f.heap.malloc_fixed(f.t.weak, 8, false, true).unwrap();
    let target = f.heap.malloc_fixed(f.t.cell, 16, false, false).unwrap();
    f.roots.push(weak);
    unsafe { f.heap.write_weakref(weak, Some(target)).unwrap() };

    f.heap.collect().unwrap();
    let cycle = f.heap.stats().last_cycle.unwrap();
    assert_eq!(cycle.weakrefs_cleared, 1);
    assert_eq!(cycle.objects_freed, 1);
    assert_eq!(unsafe { f.heap.read_weakref(weak) }.unwrap(), None);
}

#[test]
fn test_live_referent_is_kept() {
    let f = Fixture::new();
    let weak = f.heap.malloc_fixed(f.t.weak, 8, false, true).unwrap();
    let target = f.heap.malloc_fixed(f.t.cell, 16, false, false).unwrap();
    f.roots.push(weak);
    f.roots.push(target);
    unsafe { f.heap.write_weakref(weak, Some(target)).unwrap() };

    f.heap.collect().unwrap();
    f.heap.collect().unwrap();
    assert_eq!(f.heap.stats().totals.weakrefs_cleared, 0);
    assert_eq!(unsafe { f.heap.read_weakref(weak) }.unwrap(), Some(target));
}

#[test]
fn test_dead_weakref_is_dropped_silently() {
    let f = Fixture::new();
    let weak = f.heap.malloc_fixed(f.t.weak, 8, false, true).unwrap();
    let target = f.heap.malloc_fixed(f.t.cell, 16, false, false).unwrap();
    unsafe { f.heap.write_weakref(weak, Some(target)).unwrap() };

    f.heap.collect().unwrap();
    let cycle = f.heap.stats().last_cycle.unwrap();
    assert_eq!(cycle.objects_freed, 2);
    assert_eq!(cycle.weakrefs_cleared, 0);
}

#[test]
fn test_old_weakref_to_young_referent() {
    let f = Fixture::new();
    let weak = f.heap.malloc_fixed(f.t.weak, 8, false, true).unwrap();
    f.roots.push(weak);
    f.heap.collect().unwrap();

    let target = f.heap.malloc_fixed(f.t.cell, 16, false, false).unwrap();
    unsafe { f.heap.write_weakref(weak, Some(target)).unwrap() };
    f.heap.trigger_next_collection().unwrap();
    f.heap.wait_for_the_end_of_collection().unwrap();

    let cycle = f.heap.stats().last_cycle.unwrap();
    assert_eq!(cycle.weakrefs_cleared, 1);
    assert_eq!(cycle.objects_freed, 1);
    assert_eq!(unsafe { f.heap.read_weakref(weak) }.unwrap(), None);
}

#[test]
fn test_referent_read_during_cycle_survives_it() {
    let f = Fixture::new();
    let weak = f.heap.malloc_fixed(f.t.weak, 8, false, true).unwrap();
    f.roots.push(weak);

    for _ in 0..50 {
        let target = f.heap.malloc_fixed(f.t.cell, 16, false, false).unwrap();
        unsafe { f.heap.write_weakref(weak, Some(target)).unwrap() };
        f.heap.trigger_next_collection().unwrap();
        let during = unsafe { f.heap.read_weakref(weak) }.unwrap();
        f.heap.wait_for_the_end_of_collection().unwrap();
        let after = unsafe { f.heap.read_weakref(weak) }.unwrap();

        // Either the read won and the referent was kept, or the weakref had
        // already been cleared.
        assert_eq!(during, after);
        if let Some(obj) = after {
            assert_eq!(obj, target);
            assert_eq!(unsafe { GcHeader::from_ref(obj) }.type_id(), f.t.cell);
        }
    }
}
