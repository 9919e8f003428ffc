//! Unit tests for the explicit root list

use core_types::{GcRef, RootSet, RootWalker};

fn refs(slots: &mut [usize]) -> Vec<GcRef> {
    slots
        .iter_mut()
        .map(|s| GcRef::from_raw(s as *mut usize as *mut u8).unwrap())
        .collect()
}

#[test]
fn test_walk_reports_every_stack_root_once() {
    let mut slots = [0usize; 4];
    let objs = refs(&mut slots);
    let roots = RootSet::new();
    roots.set(objs.clone());

    let mut seen = Vec::new();
    roots.walk_roots(&mut |r| seen.push(r), &mut |_| {}, &mut |_| {});
    assert_eq!(seen, objs);
}

#[test]
fn test_clear_empties_stack_roots() {
    let mut slots = [0usize; 2];
    let objs = refs(&mut slots);
    let roots = RootSet::new();
    roots.set(objs);
    roots.clear();

    let mut count = 0;
    roots.walk_roots(&mut |_| count += 1, &mut |_| {}, &mut |_| {});
    assert_eq!(count, 0);
}

#[test]
fn test_callbacks_may_reenter_root_set() {
    let mut slots = [0usize; 2];
    let objs = refs(&mut slots);
    let roots = RootSet::new();
    roots.push(objs[0]);

    // The walker hands out a snapshot, so a callback can push more roots
    // without deadlocking.
    roots.walk_roots(&mut |_| roots.push(objs[1]), &mut |_| {}, &mut |_| {});
    assert_eq!(roots.len(), 2);
}
