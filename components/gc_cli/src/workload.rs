//! The stress workload
//!
//! Every mutator thread owns a rooted table of slots. While the collector
//! marks, threads allocate into their slots, copy and clear slots, build
//! nodes over existing slot values, and create weak references and
//! finalizable resources. After each cycle the coordinator walks every table
//! and checks that nothing reachable was freed or damaged.
//!
//! A fresh object is allocated and stored into its slot under one gate, and
//! the coordinator triggers under the same gate, so no thread holds an object
//! the root walker cannot see when a cycle starts. Collections started from
//! inside an allocation (full nursery, out of memory) run under the gate too.

use crate::error::{CliError, CliResult};
use core_types::{GcRef, RootSet, TypeDescriptor, TypeId, TypeTable, VarsizeDescriptor};
use memory_manager::header::is_legal_color;
use memory_manager::{GcConfig, GcError, GcHeader, GcResult, Heap, HeapStats};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const LEAF_SIZE: usize = 16;
const NODE_SIZE: usize = 16;
const NODE_ITEM: usize = 0;
const NODE_NEXT: usize = 8;
const WEAK_SIZE: usize = 8;
const RESOURCE_SIZE: usize = 8;
const RESOURCE_MAGIC: usize = 0x7e57_ab1e;

/// Finalizations that found their resource already damaged.
static DAMAGED_FINALIZATIONS: AtomicUsize = AtomicUsize::new(0);

fn release_resource(obj: GcRef) {
    // SAFETY: the object stays intact while its finalizer runs.
    unsafe {
        if obj.read_word(0) != RESOURCE_MAGIC {
            DAMAGED_FINALIZATIONS.fetch_add(1, Ordering::Relaxed);
        }
        obj.write_word(0, 0);
    }
}

fn slot_offset(slot: usize) -> usize {
    8 + slot * 8
}

/// Shape of the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkloadOptions {
    /// Mutator threads.
    pub threads: usize,
    /// Collection cycles driven by the coordinator.
    pub rounds: usize,
    /// Operations per thread and cycle.
    pub ops: usize,
    /// Root slots per thread.
    pub slots: usize,
    /// Seed of the operation mix.
    pub seed: u64,
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        WorkloadOptions {
            threads: 4,
            rounds: 10,
            ops: 10_000,
            slots: 256,
            seed: 0x5eed,
        }
    }
}

impl WorkloadOptions {
    /// Rejects shapes the workload cannot run.
    pub fn validate(&self) -> CliResult<()> {
        if self.threads == 0 {
            return Err(CliError::Usage("at least one thread is needed".to_string()));
        }
        if self.slots == 0 {
            return Err(CliError::Usage("at least one slot is needed".to_string()));
        }
        Ok(())
    }
}

struct Types {
    leaf: TypeId,
    node: TypeId,
    weak: TypeId,
    resource: TypeId,
    table: TypeId,
}

impl Types {
    fn register(table: &mut TypeTable) -> Types {
        Types {
            leaf: table.register(TypeDescriptor::fixed("leaf", LEAF_SIZE)),
            node: table.register(
                TypeDescriptor::fixed("node", NODE_SIZE).with_pointers(&[NODE_ITEM, NODE_NEXT]),
            ),
            weak: table.register(TypeDescriptor::fixed("weak", WEAK_SIZE).with_weakpointer(0)),
            resource: table.register(
                TypeDescriptor::fixed("resource", RESOURCE_SIZE).with_finalizer(release_resource),
            ),
            table: table.register(TypeDescriptor::fixed("table", 8).with_varsize(
                VarsizeDescriptor {
                    item_size: 8,
                    offset_to_variable_part: 8,
                    offset_to_length: 0,
                    pointer_offsets: vec![0],
                },
            )),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Shape the workload ran with.
    pub options: WorkloadOptions,
    /// Objects allocated by the mutator threads.
    pub allocated: u64,
    /// Objects reachable from the tables at the end.
    pub reachable: usize,
    /// Weak references found with a live referent at the end.
    pub live_weakrefs: usize,
    /// Wall-clock time of the run.
    pub elapsed_ms: u64,
    /// Heap statistics at the end.
    pub heap: HeapStats,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let totals = &self.heap.totals;
        writeln!(
            f,
            "gc-stress: {} threads, {} rounds, {} ops per thread and round",
            self.options.threads, self.options.rounds, self.options.ops
        )?;
        writeln!(f, "  allocated:        {} objects", self.allocated)?;
        writeln!(
            f,
            "  reachable:        {} objects, {} live weak references",
            self.reachable, self.live_weakrefs
        )?;
        writeln!(
            f,
            "  cycles:           {} minor, {} major",
            totals.minor_cycles, totals.major_cycles
        )?;
        writeln!(
            f,
            "  freed:            {} objects, {} bytes",
            totals.objects_freed, totals.bytes_freed
        )?;
        writeln!(f, "  weakrefs cleared: {}", totals.weakrefs_cleared)?;
        writeln!(f, "  finalizers run:   {}", totals.finalizers_run)?;
        writeln!(
            f,
            "  old generation:   {} objects, {} bytes",
            self.heap.old_objects, self.heap.old_bytes
        )?;
        writeln!(
            f,
            "  collector time:   {} ms of {} ms",
            totals.collector_time_us / 1000,
            self.elapsed_ms
        )
    }
}

/// Result of walking the reachable graph.
struct Census {
    reachable: usize,
    live_weakrefs: usize,
}

/// A heap, its type table and one rooted slot table per mutator thread.
pub struct Workload {
    heap: Heap,
    types: Types,
    options: WorkloadOptions,
    tables: Vec<GcRef>,
    gate: Mutex<()>,
}

impl Workload {
    /// Builds the heap and allocates the slot tables.
    pub fn new(config: GcConfig, options: WorkloadOptions) -> CliResult<Self> {
        options.validate()?;
        let mut table = TypeTable::new();
        let types = Types::register(&mut table);
        let roots = Arc::new(RootSet::new());
        let heap = Heap::new(config, Arc::new(table), roots.clone())?;

        let mut tables = Vec::with_capacity(options.threads);
        for _ in 0..options.threads {
            let t = heap.malloc_varsize(types.table, options.slots, 8, 8, 0)?;
            roots.push(t);
            tables.push(t);
        }
        Ok(Workload {
            heap,
            types,
            options,
            tables,
            gate: Mutex::new(()),
        })
    }

    /// The heap under test.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Runs every round, then a full collection, checking the heap after
    /// each cycle.
    pub fn run(&self) -> CliResult<Report> {
        let start = Instant::now();
        let mut allocated = 0;
        for round in 0..self.options.rounds {
            {
                let _gate = self.gate.lock();
                self.heap.trigger_next_collection()?;
            }
            allocated += self.run_mutators(round)?;
            self.heap.wait_for_the_end_of_collection()?;
            let census = self.census()?;
            tracing::info!(round, allocated, reachable = census.reachable, "round finished");
        }

        self.heap.collect()?;
        let census = self.census()?;
        let damaged = DAMAGED_FINALIZATIONS.load(Ordering::Relaxed);
        if damaged > 0 {
            return Err(CliError::Check(format!(
                "{} finalizers found their object damaged",
                damaged
            )));
        }
        Ok(Report {
            options: self.options,
            allocated,
            reachable: census.reachable,
            live_weakrefs: census.live_weakrefs,
            elapsed_ms: start.elapsed().as_millis() as u64,
            heap: self.heap.stats(),
        })
    }

    fn run_mutators(&self, round: usize) -> CliResult<u64> {
        thread::scope(|s| {
            let handles: Vec<_> = self
                .tables
                .iter()
                .enumerate()
                .map(|(index, &table)| {
                    let seed = self.options.seed ^ ((round as u64) << 32) ^ index as u64;
                    thread::Builder::new()
                        .name(format!("mutator-{}", index))
                        .spawn_scoped(s, move || {
                            Mutator {
                                workload: self,
                                table,
                                rng: StdRng::seed_from_u64(seed),
                                allocated: 0,
                            }
                            .run()
                        })
                })
                .collect::<std::io::Result<_>>()
                .map_err(|e| CliError::Gc(GcError::Spawn(e)))?;

            let mut allocated = 0;
            for handle in handles {
                match handle.join() {
                    Ok(result) => allocated += result?,
                    Err(_) => return Err(CliError::Check("mutator thread panicked".to_string())),
                }
            }
            Ok(allocated)
        })
    }

    /// Walks everything reachable from the tables. Mutators must be stopped.
    fn census(&self) -> CliResult<Census> {
        let heap = &self.heap;
        let t = &self.types;
        let mut stack = Vec::new();
        for &table in &self.tables {
            for slot in 0..self.options.slots {
                // SAFETY: tables are rooted for the lifetime of the workload.
                if let Some(obj) = unsafe { heap.read_pointer(table, slot_offset(slot)) } {
                    stack.push(obj);
                }
            }
        }

        let mut seen = HashSet::new();
        let mut live_weakrefs = 0;
        while let Some(obj) = stack.pop() {
            if !seen.insert(obj) {
                continue;
            }
            // SAFETY: reachable objects have not been freed; the color check
            // below reports it if they were.
            let hdr = unsafe { GcHeader::from_ref(obj) };
            let color = hdr.color();
            if !is_legal_color(color) {
                return Err(CliError::Check(format!(
                    "reachable {:?} was freed (color {:#04x})",
                    obj, color
                )));
            }
            let type_id = hdr.type_id();
            // SAFETY: fields are accessed according to the object's type.
            unsafe {
                if type_id == t.leaf {
                    if obj.read_word(8) != !obj.read_word(0) {
                        return Err(CliError::Check(format!("leaf {:?} was overwritten", obj)));
                    }
                } else if type_id == t.node {
                    stack.extend(heap.read_pointer(obj, NODE_ITEM));
                    stack.extend(heap.read_pointer(obj, NODE_NEXT));
                } else if type_id == t.weak {
                    if let Some(target) = heap.read_weakref(obj)? {
                        live_weakrefs += 1;
                        stack.push(target);
                    }
                } else if type_id == t.resource {
                    if obj.read_word(0) != RESOURCE_MAGIC {
                        return Err(CliError::Check(format!(
                            "reachable resource {:?} was finalized",
                            obj
                        )));
                    }
                } else {
                    return Err(CliError::Check(format!(
                        "{:?} has unexpected type {}",
                        obj, type_id
                    )));
                }
            }
        }
        Ok(Census {
            reachable: seen.len(),
            live_weakrefs,
        })
    }
}

/// One mutator thread's view of the workload.
struct Mutator<'w> {
    workload: &'w Workload,
    table: GcRef,
    rng: StdRng,
    allocated: u64,
}

impl Mutator<'_> {
    fn run(mut self) -> GcResult<u64> {
        for _ in 0..self.workload.options.ops {
            match self.rng.gen_range(0..100) {
                0..=39 => self.new_leaf()?,
                40..=59 => self.new_node()?,
                60..=79 => self.copy_slot(),
                80..=87 => self.clear_slot(),
                88..=94 => self.new_weakref()?,
                _ => self.new_resource()?,
            }
        }
        Ok(self.allocated)
    }

    fn slot(&mut self) -> usize {
        self.rng.gen_range(0..self.workload.options.slots)
    }

    fn load(&self, slot: usize) -> Option<GcRef> {
        // SAFETY: the table is rooted and `slot` is in range.
        unsafe { self.workload.heap.read_pointer(self.table, slot_offset(slot)) }
    }

    fn store(&self, slot: usize, value: Option<GcRef>) {
        // SAFETY: as above; `value` comes from this table or a fresh allocation.
        unsafe {
            self.workload
                .heap
                .write_pointer(self.table, slot_offset(slot), value)
        }
    }

    /// Allocates through `init` and stores the result into a random slot,
    /// both under the gate.
    fn publish(&mut self, init: impl FnOnce(&Heap) -> GcResult<GcRef>) -> GcResult<()> {
        let slot = self.slot();
        let workload = self.workload;
        let _gate = workload.gate.lock();
        let obj = init(&workload.heap)?;
        self.store(slot, Some(obj));
        self.allocated += 1;
        Ok(())
    }

    fn new_leaf(&mut self) -> GcResult<()> {
        let tag = self.rng.gen::<u64>() as usize;
        let leaf_type = self.workload.types.leaf;
        self.publish(|heap| {
            let leaf = heap.malloc_fixed(leaf_type, LEAF_SIZE, false, false)?;
            // SAFETY: fresh object with two data words.
            unsafe {
                leaf.write_word(0, tag);
                leaf.write_word(8, !tag);
            }
            Ok(leaf)
        })
    }

    fn new_node(&mut self) -> GcResult<()> {
        let (item, next) = (self.slot(), self.slot());
        let node_type = self.workload.types.node;
        let table = self.table;
        self.publish(|heap| {
            let node = heap.malloc_fixed(node_type, NODE_SIZE, false, false)?;
            // SAFETY: fresh node; its referents come from the rooted table.
            unsafe {
                heap.write_pointer(node, NODE_ITEM, heap.read_pointer(table, slot_offset(item)));
                heap.write_pointer(node, NODE_NEXT, heap.read_pointer(table, slot_offset(next)));
            }
            Ok(node)
        })
    }

    fn copy_slot(&mut self) {
        let (from, to) = (self.slot(), self.slot());
        let value = self.load(from);
        self.store(to, value);
    }

    fn clear_slot(&mut self) {
        let slot = self.slot();
        self.store(slot, None);
    }

    fn new_weakref(&mut self) -> GcResult<()> {
        let target = self.slot();
        let weak_type = self.workload.types.weak;
        let table = self.table;
        self.publish(|heap| {
            let weak = heap.malloc_fixed(weak_type, WEAK_SIZE, false, true)?;
            // SAFETY: fresh weak reference; the referent comes from the table.
            unsafe { heap.write_weakref(weak, heap.read_pointer(table, slot_offset(target)))? };
            Ok(weak)
        })
    }

    fn new_resource(&mut self) -> GcResult<()> {
        let resource_type = self.workload.types.resource;
        self.publish(|heap| {
            let resource = heap.malloc_fixed(resource_type, RESOURCE_SIZE, true, false)?;
            // SAFETY: fresh object with one data word.
            unsafe { resource.write_word(0, RESOURCE_MAGIC) };
            Ok(resource)
        })
    }
}
