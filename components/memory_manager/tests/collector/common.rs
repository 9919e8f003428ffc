//! Shared fixtures for the collector tests

use core_types::{RootSet, TypeDescriptor, TypeId, TypeTable, VarsizeDescriptor};
use memory_manager::{GcConfig, Heap};
use std::sync::Arc;

/// Type ids registered by [`types`].
pub struct Types {
    /// 16 payload bytes, no pointers. 32 bytes with the header.
    pub cell: TypeId,
    /// Two pointer fields: `next` at 0 and `item` at 8.
    pub node: TypeId,
    /// One weak pointer at 0.
    pub weak: TypeId,
    /// Length word followed by pointer items.
    pub array: TypeId,
    /// Served outside the pages.
    pub blob: TypeId,
}

pub const NEXT: usize = 0;
pub const ITEM: usize = 8;
pub const BLOB_SIZE: usize = 1000;

pub fn types() -> (TypeTable, Types) {
    let mut table = TypeTable::new();
    let cell = table.register(TypeDescriptor::fixed("cell", 16));
    let node = table.register(TypeDescriptor::fixed("node", 16).with_pointers(&[NEXT, ITEM]));
    let weak = table.register(TypeDescriptor::fixed("weak", 8).with_weakpointer(0));
    let array = table.register(TypeDescriptor::fixed("array", 8).with_varsize(
        VarsizeDescriptor {
            item_size: 8,
            offset_to_variable_part: 8,
            offset_to_length: 0,
            pointer_offsets: vec![0],
        },
    ));
    let blob = table.register(TypeDescriptor::fixed("blob", BLOB_SIZE));
    (
        table,
        Types {
            cell,
            node,
            weak,
            array,
            blob,
        },
    )
}

/// A configuration that never triggers on its own.
pub fn quiet_config() -> GcConfig {
    GcConfig {
        nursery_size: 1 << 40,
        ..GcConfig::default()
    }
}

pub struct Fixture {
    pub heap: Heap,
    pub roots: Arc<RootSet>,
    pub t: Types,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture::with_config(quiet_config())
    }

    pub fn with_config(config: GcConfig) -> Self {
        let (table, t) = types();
        let roots = Arc::new(RootSet::new());
        let heap = Heap::new(config, Arc::new(table), roots.clone()).unwrap();
        Fixture { heap, roots, t }
    }
}

/// Builds a heap over a caller-provided table.
pub fn heap_over(table: TypeTable) -> (Heap, Arc<RootSet>) {
    let roots = Arc::new(RootSet::new());
    let heap = Heap::new(quiet_config(), Arc::new(table), roots.clone()).unwrap();
    (heap, roots)
}
