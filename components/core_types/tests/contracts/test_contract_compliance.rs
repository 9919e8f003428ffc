//! Contract compliance tests for core_types
//!
//! These tests pin the collaborator interfaces the collector relies on.

use core_types::{
    Finalizer, GcRef, RootCallback, RootSet, RootWalker, TypeDescriptor, TypeId, TypeLayout,
    TypeTable,
};

/// Contract: GcRef is Copy + Send + Sync and compares by address
#[test]
fn contract_gc_ref_is_plain_address() {
    fn assert_send_sync<T: Send + Sync + Copy + Eq + std::hash::Hash>() {}
    assert_send_sync::<GcRef>();

    let mut word = 0usize;
    let raw = &mut word as *mut usize as *mut u8;
    let a = GcRef::from_raw(raw).unwrap();
    let b = GcRef::from_raw(raw).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_ptr(), raw);
    assert_eq!(a.addr(), raw as usize);
}

/// Contract: TypeLayout is object safe and shareable across threads
#[test]
fn contract_type_layout_object_safe() {
    let mut table = TypeTable::new();
    let t = table.register(TypeDescriptor::fixed("t", 8));
    let oracle: Box<dyn TypeLayout> = Box::new(table);
    assert_eq!(oracle.fixed_size(t), 8);
}

/// Contract: weakpointer_offset reports absence as None
#[test]
fn contract_weakpointer_offset_optional() {
    let mut table = TypeTable::new();
    let t = table.register(TypeDescriptor::fixed("t", 8));
    assert_eq!(table.weakpointer_offset(t), None);
}

/// Contract: finalizers are plain function pointers over GcRef
#[test]
fn contract_finalizer_signature() {
    fn fin(_: GcRef) {}
    let f: Finalizer = fin;
    let mut table = TypeTable::new();
    let t = table.register(TypeDescriptor::fixed("t", 8).with_finalizer(f));
    assert!(table.finalizer(t).is_some());
}

/// Contract: walk_roots takes three callbacks
#[test]
fn contract_root_walker_three_callbacks() {
    struct Nothing;
    impl RootWalker for Nothing {
        fn walk_roots(&self, _: RootCallback<'_>, _: RootCallback<'_>, _: RootCallback<'_>) {}
    }
    let walkers: Vec<Box<dyn RootWalker>> = vec![Box::new(Nothing), Box::new(RootSet::new())];
    for walker in walkers {
        walker.walk_roots(&mut |_| panic!("no roots"), &mut |_| {}, &mut |_| {});
    }
}

/// Contract: TypeId is a transparent u32
#[test]
fn contract_type_id_u32() {
    assert_eq!(TypeId(42).as_u32(), 42);
}
