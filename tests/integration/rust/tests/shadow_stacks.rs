//! Mutator threads building lists while a coordinator keeps collecting
//!
//! Every node carries a depth word and every item a checksummed tag, so a
//! node or item reclaimed while still reachable shows up as a type or
//! checksum mismatch when the chains are walked.

use core_types::{GcRef, TypeDescriptor, TypeId, TypeTable};
use integration_tests::ShadowStacks;
use memory_manager::{CollectorPhase, GcConfig, GcHeader, Heap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const NEXT: usize = 0;
const ITEM: usize = 8;
const DEPTH: usize = 16;
const MAX_DEPTH: usize = 8;

const THREADS: usize = 4;
const SLOTS: usize = 16;
const OPS: usize = SLOTS * MAX_DEPTH * 24;

struct Types {
    node: TypeId,
    item: TypeId,
}

fn setup(config: GcConfig) -> (Heap, Arc<ShadowStacks>, Types) {
    let mut table = TypeTable::new();
    let node = table.register(TypeDescriptor::fixed("node", 24).with_pointers(&[NEXT, ITEM]));
    let item = table.register(TypeDescriptor::fixed("item", 16));
    let stacks = Arc::new(ShadowStacks::new(THREADS, SLOTS));
    let heap = Heap::new(config, Arc::new(table), stacks.clone()).unwrap();
    (heap, stacks, Types { node, item })
}

fn quiet() -> GcConfig {
    GcConfig {
        nursery_size: 1 << 40,
        ..GcConfig::default()
    }
}

/// Pushes a fresh node carrying `tag` onto the chain in `slot`.
fn push_node(heap: &Heap, stacks: &ShadowStacks, t: &Types, thread: usize, slot: usize, tag: usize) {
    let _step = stacks.enter();
    let item = heap.malloc_fixed(t.item, 16, false, false).unwrap();
    let node = heap.malloc_fixed(t.node, 24, false, false).unwrap();
    let head = stacks.get(thread, slot);
    let depth = head.map_or(0, |h| unsafe { h.read_word(DEPTH) } + 1);
    unsafe {
        item.write_word(0, tag);
        item.write_word(8, !tag);
        node.write_word(DEPTH, depth % MAX_DEPTH);
        heap.write_pointer(node, ITEM, Some(item));
        heap.write_pointer(node, NEXT, if depth < MAX_DEPTH { head } else { None });
    }
    stacks.set(thread, slot, Some(node));
}

/// Walks every chain and returns the number of nodes seen.
fn check_chains(heap: &Heap, stacks: &ShadowStacks, t: &Types) -> usize {
    let mut seen = 0;
    for head in stacks.live() {
        let mut cursor = Some(head);
        let mut expected_depth = unsafe { head.read_word(DEPTH) };
        while let Some(node) = cursor {
            unsafe {
                assert_eq!(GcHeader::from_ref(node).type_id(), t.node);
                assert_eq!(node.read_word(DEPTH), expected_depth);
                let item = heap.read_pointer(node, ITEM).unwrap();
                assert_eq!(GcHeader::from_ref(item).type_id(), t.item);
                assert_eq!(item.read_word(8), !item.read_word(0));
                cursor = heap.read_pointer(node, NEXT);
            }
            seen += 1;
            if cursor.is_some() {
                expected_depth -= 1;
            }
        }
        assert_eq!(expected_depth, 0);
    }
    seen
}

fn run_mutators(heap: &Heap, stacks: &ShadowStacks, t: &Types, triggers: bool) -> usize {
    let finished = AtomicUsize::new(0);
    let mut rounds = 0;
    thread::scope(|s| {
        for thread in 0..THREADS {
            let finished = &finished;
            s.spawn(move || {
                for op in 0..OPS {
                    push_node(heap, stacks, t, thread, op % SLOTS, thread * OPS + op);
                }
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        if triggers {
            while finished.load(Ordering::SeqCst) < THREADS {
                {
                    let _world = stacks.stop_the_world();
                    heap.trigger_next_collection().unwrap();
                }
                heap.wait_for_the_end_of_collection().unwrap();
                rounds += 1;
            }
        }
    });
    rounds
}

#[test]
fn test_chains_survive_concurrent_collections() {
    let (heap, stacks, t) = setup(quiet());
    run_mutators(&heap, &stacks, &t, true);
    heap.wait_for_the_end_of_collection().unwrap();

    let before = check_chains(&heap, &stacks, &t);
    assert_eq!(before, THREADS * SLOTS * MAX_DEPTH);
    heap.collect().unwrap();
    assert_eq!(check_chains(&heap, &stacks, &t), before);

    // Only the chains are left: a node and an item per link.
    heap.collect().unwrap();
    let stats = heap.stats();
    assert_eq!(stats.old_objects, 2 * before);
    assert_eq!(stats.last_cycle.unwrap().objects_freed, 0);
    assert_eq!(stats.phase, CollectorPhase::Idle);
}

#[test]
fn test_releasing_every_frame_empties_the_heap() {
    let (heap, stacks, t) = setup(quiet());
    run_mutators(&heap, &stacks, &t, true);
    heap.collect().unwrap();

    stacks.clear();
    heap.collect().unwrap();
    let stats = heap.stats();
    assert_eq!(stats.old_objects, 0);
    assert_eq!(stats.old_bytes, 0);
    assert_eq!(stats.last_cycle.unwrap().objects_freed, 2 * THREADS * SLOTS * MAX_DEPTH);
}

#[test]
fn test_static_root_keeps_a_detached_chain() {
    let (heap, stacks, t) = setup(quiet());
    for i in 0..MAX_DEPTH {
        push_node(&heap, &stacks, &t, 0, 0, i);
    }
    let head = stacks.get(0, 0).unwrap();
    stacks.push_static(head);
    stacks.clear();

    heap.collect().unwrap();
    assert_eq!(heap.stats().old_objects, 2 * MAX_DEPTH);
    stacks.set(0, 0, Some(head));
    assert_eq!(check_chains(&heap, &stacks, &t), MAX_DEPTH);
}
