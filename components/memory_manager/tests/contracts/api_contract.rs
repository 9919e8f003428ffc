//! Contract tests verifying the memory_manager public API.
//! These tests pin the exported types and the behaviour callers rely on.

use core_types::{GcRef, RootSet, TypeDescriptor, TypeTable, VarsizeDescriptor};
use memory_manager::{
    size_class_for, ArenaCollection, CollectionKind, CollectorPhase, GcConfig, GcError, GcHeader,
    Heap, HEADER_SIZE, WORD,
};
use std::sync::Arc;

fn heap() -> (Heap, Arc<RootSet>, core_types::TypeId) {
    let mut types = TypeTable::new();
    let node = types.register(TypeDescriptor::fixed("node", 16).with_pointers(&[0, 8]));
    let roots = Arc::new(RootSet::new());
    let config = GcConfig {
        nursery_size: 1 << 30,
        ..GcConfig::default()
    };
    let heap = Heap::new(config, Arc::new(types), roots.clone()).unwrap();
    (heap, roots, node)
}

/// Contract: Heap is shared between mutator threads
#[test]
fn contract_heap_is_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Heap>();
}

/// Contract: the header is two words and precedes the payload
#[test]
fn contract_header_layout() {
    assert_eq!(WORD, 8);
    assert_eq!(HEADER_SIZE, 2 * WORD);
    assert_eq!(std::mem::size_of::<GcHeader>(), HEADER_SIZE);

    let (heap, _roots, node) = heap();
    let obj = heap.malloc_fixed(node, 16, false, false).unwrap();
    let hdr = unsafe { GcHeader::from_ref(obj) };
    assert_eq!(hdr.object(), obj);
    assert_eq!(hdr.type_id(), node);
}

/// Contract: size classes are counted in words
#[test]
fn contract_size_classes() {
    assert_eq!(size_class_for(16), 2);
    assert_eq!(size_class_for(17), 3);
    assert_eq!(size_class_for(32), 4);
}

/// Contract: fresh objects have null pointer fields
#[test]
fn contract_malloc_fixed_zeroes_pointers() {
    let (heap, _roots, node) = heap();
    let obj = heap.malloc_fixed(node, 16, false, false).unwrap();
    unsafe {
        assert_eq!(heap.read_pointer(obj, 0), None);
        assert_eq!(heap.read_pointer(obj, 8), None);
    }
}

/// Contract: pointer fields can be written and read back
#[test]
fn contract_write_then_read_pointer() {
    let (heap, _roots, node) = heap();
    let a = heap.malloc_fixed(node, 16, false, false).unwrap();
    let b = heap.malloc_fixed(node, 16, false, false).unwrap();
    unsafe {
        heap.write_pointer(a, 8, Some(b));
        assert_eq!(heap.read_pointer(a, 8), Some(b));
        heap.write_pointer(a, 8, None);
        assert_eq!(heap.read_pointer(a, 8), None);
    }
}

/// Contract: varsize allocation validates the layout against the oracle
#[test]
fn contract_malloc_varsize_checks_layout() {
    let mut types = TypeTable::new();
    let plain = types.register(TypeDescriptor::fixed("plain", 8));
    let bytes = types.register(TypeDescriptor::fixed("bytes", 8).with_varsize(VarsizeDescriptor {
        item_size: 1,
        offset_to_variable_part: 8,
        offset_to_length: 0,
        pointer_offsets: vec![],
    }));
    let heap = Heap::new(
        GcConfig::default(),
        Arc::new(types),
        Arc::new(RootSet::new()),
    )
    .unwrap();

    let s = heap.malloc_varsize(bytes, 13, 8, 1, 0).unwrap();
    assert_eq!(unsafe { s.read_word(0) }, 13);
    assert!(matches!(
        heap.malloc_varsize(plain, 1, 8, 1, 0),
        Err(GcError::InvalidRequest(_))
    ));
    assert!(matches!(
        heap.malloc_fixed(bytes, 8, false, false),
        Err(GcError::InvalidRequest(_))
    ));
}

/// Contract: the weak flag must match the layout and unknown types are refused
#[test]
fn contract_malloc_fixed_checks_request() {
    let mut types = TypeTable::new();
    let weak = types.register(TypeDescriptor::fixed("weak", 8).with_weakpointer(0));
    let plain = types.register(TypeDescriptor::fixed("plain", 8));
    let heap = Heap::new(
        GcConfig::default(),
        Arc::new(types),
        Arc::new(RootSet::new()),
    )
    .unwrap();

    assert!(matches!(
        heap.malloc_fixed(weak, 8, false, false),
        Err(GcError::InvalidRequest(_))
    ));
    assert!(matches!(
        heap.malloc_fixed(plain, 8, false, true),
        Err(GcError::InvalidRequest(_))
    ));
    heap.malloc_fixed(weak, 8, false, true).unwrap();

    let unknown = core_types::TypeId(7);
    assert!(matches!(
        heap.malloc_fixed(unknown, 8, false, false),
        Err(GcError::InvalidRequest(_))
    ));
    assert!(matches!(
        heap.malloc_varsize(unknown, 1, 8, 8, 0),
        Err(GcError::InvalidRequest(_))
    ));
    assert_eq!(heap.stats().young_objects, 1);
}

/// Contract: a page too small for its header and the largest block is rejected
#[test]
fn contract_heap_rejects_page_without_room() {
    let config = GcConfig {
        page_size: 64,
        arena_size: 4096,
        small_request_threshold: 32,
        ..GcConfig::default()
    };
    let result = Heap::new(
        config,
        Arc::new(TypeTable::new()),
        Arc::new(RootSet::new()),
    );
    assert!(matches!(result, Err(GcError::InvalidConfig(_))));
}

/// Contract: an invalid configuration is rejected at construction
#[test]
fn contract_heap_rejects_invalid_config() {
    let config = GcConfig {
        page_size: 1000,
        ..GcConfig::default()
    };
    let result = Heap::new(
        config,
        Arc::new(TypeTable::new()),
        Arc::new(RootSet::new()),
    );
    assert!(matches!(result, Err(GcError::InvalidConfig(_))));
}

/// Contract: collect() runs a major cycle and leaves the collector idle
#[test]
fn contract_collect_is_major_and_blocking() {
    let (heap, _roots, node) = heap();
    heap.malloc_fixed(node, 16, false, false).unwrap();
    heap.collect().unwrap();
    let stats = heap.stats();
    assert_eq!(stats.last_cycle.unwrap().kind, CollectionKind::Major);
    assert_eq!(stats.totals.major_cycles, 1);
    assert_eq!(heap.collector_phase(), CollectorPhase::Idle);
}

/// Contract: wait_for_the_end_of_collection is a no-op when idle
#[test]
fn contract_wait_without_cycle() {
    let (heap, _roots, _node) = heap();
    heap.wait_for_the_end_of_collection().unwrap();
    assert_eq!(heap.stats().totals.cycles(), 0);
}

/// Contract: rooted objects survive any number of cycles
#[test]
fn contract_roots_survive() {
    let (heap, roots, node) = heap();
    let obj: GcRef = heap.malloc_fixed(node, 16, false, false).unwrap();
    roots.push(obj);
    for _ in 0..3 {
        heap.trigger_next_collection().unwrap();
    }
    heap.collect().unwrap();
    assert_eq!(heap.stats().old_objects, 1);
    assert_eq!(unsafe { GcHeader::from_ref(obj) }.type_id(), node);
}

/// Contract: the allocator can be driven on its own
#[test]
fn contract_arena_collection_standalone() {
    let mut arenas = ArenaCollection::new(4096, 4 * 4096, 35 * WORD, None);
    let block = arenas.allocate(4).unwrap();
    assert_eq!(block.as_ptr() as usize % WORD, 0);
    unsafe { arenas.free(block, 4) };
    assert_eq!(arenas.free_page_count(), 1);
}

/// Contract: heap statistics serialize to JSON
#[test]
fn contract_stats_serialize() {
    let (heap, _roots, _node) = heap();
    let json = serde_json::to_value(heap.stats()).unwrap();
    assert_eq!(json["phase"], "idle");
    assert_eq!(json["young_objects"], 0);
    assert!(json["last_cycle"].is_null());
}
