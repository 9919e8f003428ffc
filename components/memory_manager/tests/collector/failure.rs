//! Collector failures surface on the mutator side

use crate::common::{quiet_config, types};
use core_types::{GcRef, RootCallback, RootWalker};
use memory_manager::{GcError, Heap};
use std::sync::Arc;

/// Reports a block whose header was never initialised.
struct CorruptRoots {
    obj: GcRef,
}

impl RootWalker for CorruptRoots {
    fn walk_roots(
        &self,
        stack_root: RootCallback<'_>,
        _static_nongc_root: RootCallback<'_>,
        _static_gc_root: RootCallback<'_>,
    ) {
        stack_root(self.obj);
    }
}

#[test]
fn test_collector_panic_poisons_heap() {
    let mut storage = Box::new([0u64; 4]);
    let obj = GcRef::from_raw(unsafe { (storage.as_mut_ptr() as *mut u8).add(16) }).unwrap();
    let (table, t) = types();
    let heap = Heap::new(quiet_config(), Arc::new(table), Arc::new(CorruptRoots { obj })).unwrap();
    heap.malloc_fixed(t.cell, 16, false, false).unwrap();

    match heap.collect() {
        Err(GcError::CollectorFailed(message)) => assert!(message.contains("illegal color")),
        other => panic!("expected a collector failure, got {:?}", other),
    }
    assert!(matches!(
        heap.trigger_next_collection(),
        Err(GcError::CollectorFailed(_))
    ));
    assert!(matches!(
        heap.wait_for_the_end_of_collection(),
        Err(GcError::CollectorFailed(_))
    ));
    // Allocation does not depend on the collector.
    heap.malloc_fixed(t.cell, 16, false, false).unwrap();

    drop(heap);
    drop(storage);
}
