//! Handles returned to a pool by finalizers
//!
//! The finalizer is the only place a handle goes back to the pool, so the
//! pool content tells exactly which resources the collector found dead.

use core_types::{GcRef, RootSet, TypeDescriptor, TypeTable};
use memory_manager::{GcConfig, Heap};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

static RETURNED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

const HANDLE: usize = 0;
const RESOURCES: usize = 120;

fn return_handle(obj: GcRef) {
    let handle = unsafe { obj.read_word(HANDLE) };
    RETURNED.lock().push(handle);
}

#[test]
fn test_dead_resources_return_their_handles() {
    let mut table = TypeTable::new();
    let resource = table.register(TypeDescriptor::fixed("resource", 8).with_finalizer(return_handle));
    let roots = Arc::new(RootSet::new());
    let config = GcConfig {
        nursery_size: 1 << 40,
        ..GcConfig::default()
    };
    let heap = Heap::new(config, Arc::new(table), roots.clone()).unwrap();

    // Three threads open handles; handles divisible by three stay owned.
    thread::scope(|s| {
        for first in 0..3 {
            let (heap, roots) = (&heap, &roots);
            s.spawn(move || {
                for handle in (first..RESOURCES).step_by(3) {
                    let obj = heap.malloc_fixed(resource, 8, true, false).unwrap();
                    unsafe { obj.write_word(HANDLE, handle) };
                    if handle % 3 == 0 {
                        roots.push(obj);
                    }
                }
            });
        }
    });

    heap.collect().unwrap();
    let mut returned = RETURNED.lock().clone();
    returned.sort_unstable();
    let expected: Vec<usize> = (0..RESOURCES).filter(|h| h % 3 != 0).collect();
    assert_eq!(returned, expected);

    let stats = heap.stats();
    assert_eq!(stats.totals.finalizers_run, expected.len() as u64);
    assert_eq!(stats.pending_finalizers, 0);

    // Finalized objects are reclaimed by the following cycle.
    heap.collect().unwrap();
    assert_eq!(heap.stats().last_cycle.unwrap().objects_freed, expected.len());

    roots.clear();
    heap.collect().unwrap();
    assert_eq!(RETURNED.lock().len(), RESOURCES);
    heap.collect().unwrap();
    assert_eq!(heap.stats().old_objects, 0);
}
