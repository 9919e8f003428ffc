//! The collector thread.
//!
//! A single background thread runs every collection cycle while the mutators
//! keep running. A cycle walks through these phases:
//!
//! - **Marking**: trace from the gray objects handed over at trigger time,
//!   blackening every object reached. The write barrier may add more work
//!   at any time; marking only ends once both the local stack and the
//!   barrier's list are empty while the barrier mutex is held.
//! - **ClearingWeakrefs**: still under that mutex, null every weak pointer
//!   whose referent was not reached.
//! - **MarkingFromFinalizers**: resurrect dead finalizable objects and queue
//!   them for finalization on the mutator side.
//! - **Sweeping**: free what is still untraced in the aging generation (and
//!   in the old generation during a major cycle), promote the rest.
//!
//! Mutators talk to the thread through two channels: commands go in, one
//! outcome per cycle comes back.

use crate::context::{CollectorContext, CollectorLists, ObjectList};
use crate::error::{panic_message, GcError, GcResult};
use crate::gc_assert;
use crate::gray::MarkWorker;
use crate::header::{is_legal_color, GcHeader, FLAG_LARGE, WORD};
use crate::stats::CycleStats;
use core_types::GcRef;
use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Phase of the collector thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum CollectorPhase {
    /// Cycle finished, outcome not collected by a mutator yet.
    Done = -1,
    /// Waiting for the next start signal.
    #[default]
    Idle = 0,
    Marking = 1,
    ClearingWeakrefs = 2,
    MarkingFromFinalizers = 3,
    Sweeping = 4,
}

/// Which generations a cycle collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    /// The aging generation only.
    #[default]
    Minor,
    /// The aging and the old generation.
    Major,
}

/// Commands sent to the collector thread.
#[derive(Debug)]
pub enum CollectorCommand {
    /// Run one cycle.
    Start(CollectionKind),
    /// Exit the thread loop.
    Shutdown,
}

/// Handle to the collector thread.
pub(crate) struct CollectorThread {
    commands: Sender<CollectorCommand>,
    finished: Receiver<GcResult<CycleStats>>,
    handle: Option<JoinHandle<()>>,
}

impl CollectorThread {
    /// Spawns the thread. It blocks until the first start command.
    pub fn spawn(ctx: Arc<CollectorContext>) -> GcResult<Self> {
        let (commands, command_rx) = channel::unbounded::<CollectorCommand>();
        let (finished_tx, finished) = channel::bounded::<GcResult<CycleStats>>(1);

        let handle = thread::Builder::new()
            .name("gc-collector".into())
            .spawn(move || {
                for command in command_rx.iter() {
                    match command {
                        CollectorCommand::Start(kind) => {
                            let outcome = run_cycle(&ctx, kind);
                            if finished_tx.send(outcome).is_err() {
                                break;
                            }
                        }
                        CollectorCommand::Shutdown => break,
                    }
                }
                tracing::debug!(target: "memory_manager::gc", "collector thread exiting");
            })
            .map_err(GcError::Spawn)?;

        Ok(CollectorThread {
            commands,
            finished,
            handle: Some(handle),
        })
    }

    /// Sends the start signal.
    pub fn start(&self, kind: CollectionKind) -> GcResult<()> {
        self.commands
            .send(CollectorCommand::Start(kind))
            .map_err(|_| GcError::CollectorStopped)
    }

    /// Blocks until the running cycle reports its outcome.
    pub fn wait_finished(&self) -> GcResult<CycleStats> {
        self.finished
            .recv()
            .map_err(|_| GcError::CollectorStopped)?
    }

    /// Stops the thread and joins it. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(CollectorCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CollectorThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs one cycle, turning a panic into [`GcError::CollectorFailed`].
fn run_cycle(ctx: &CollectorContext, kind: CollectionKind) -> GcResult<CycleStats> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| Collection::new(ctx, kind).run()));
    ctx.phase.store(CollectorPhase::Done);
    outcome.map_err(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!(
            target: "memory_manager::gc",
            kind = ?kind,
            error = %message,
            "collection cycle failed"
        );
        GcError::CollectorFailed(message)
    })
}

/// An object found dead by the sweep.
struct DeadObject {
    hdr: NonNull<GcHeader>,
    bytes: usize,
    large: bool,
}

/// One collection cycle, run on the collector thread.
pub(crate) struct Collection<'a> {
    ctx: &'a CollectorContext,
    kind: CollectionKind,
    stats: CycleStats,
    /// Weakref records whose own object was untraced at clearing time.
    dying_weakrefs: Vec<GcRef>,
}

impl<'a> Collection<'a> {
    pub(crate) fn new(ctx: &'a CollectorContext, kind: CollectionKind) -> Self {
        Collection {
            ctx,
            kind,
            stats: CycleStats {
                kind,
                ..CycleStats::default()
            },
            dying_weakrefs: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) -> CycleStats {
        let start = Instant::now();
        let ctx = self.ctx;
        let worker = MarkWorker::new(&ctx.gray);
        let mut lists = ctx.lists.lock();

        tracing::debug!(
            target: "memory_manager::gc",
            kind = ?self.kind,
            aging = lists.aging.len(),
            old = lists.old.len(),
            "marking"
        );
        self.mark(&worker, &mut lists);

        ctx.phase.store(CollectorPhase::MarkingFromFinalizers);
        self.mark_from_finalizers(&worker, &mut lists);
        self.keep_resurrected_weakrefs(&mut lists);

        ctx.phase.store(CollectorPhase::Sweeping);
        tracing::debug!(
            target: "memory_manager::gc",
            marked = self.stats.objects_marked,
            weakrefs_cleared = self.stats.weakrefs_cleared,
            "sweeping"
        );
        let dead = self.sweep(&mut lists);
        drop(lists);
        self.free(dead);

        self.stats.duration_us = start.elapsed().as_micros() as u64;
        self.stats
    }

    /// Blackens `obj` if the running cycle has not traced it yet.
    fn visit(&mut self, obj: GcRef, worker: &MarkWorker<'_>) {
        let ctx = self.ctx;
        let colors = &ctx.colors;
        // SAFETY: gray objects are live managed or prebuilt objects.
        let hdr = unsafe { GcHeader::from_ref(obj) };
        let color = hdr.color();
        gc_assert!(
            is_legal_color(color),
            "gray object {:?} has illegal color {:#04x}",
            obj,
            color
        );
        if !colors.is_untraced(color) {
            return;
        }
        // SAFETY: as above.
        unsafe { ctx.layout.trace(obj, |child| worker.push(child)) };
        // Only after tracing: a barrier running in between sees the object
        // still untraced and records the referents itself.
        if hdr.compare_exchange_color(color, colors.old()) {
            self.stats.objects_marked += 1;
        }
    }

    fn drain(&mut self, worker: &MarkWorker<'_>) {
        while let Some(obj) = worker.pop() {
            self.visit(obj, worker);
        }
    }

    /// Marks until no gray object is left anywhere, then clears weak
    /// references without releasing the barrier mutex in between.
    fn mark(&mut self, worker: &MarkWorker<'_>, lists: &mut CollectorLists) {
        loop {
            self.drain(worker);
            let mut barrier = self.ctx.barrier.lock();
            if barrier.extra_objects_to_mark.is_empty() && worker.is_empty() {
                self.ctx.phase.store(CollectorPhase::ClearingWeakrefs);
                self.clear_weakrefs(lists);
                return;
            }
            for obj in barrier.extra_objects_to_mark.drain(..) {
                worker.push(obj);
            }
        }
    }

    /// Called with the barrier mutex held.
    fn clear_weakrefs(&mut self, lists: &mut CollectorLists) {
        let ctx = self.ctx;
        let colors = &ctx.colors;
        let records = std::mem::take(&mut lists.objects_with_weakrefs);
        let mut kept = Vec::with_capacity(records.len());
        for weakref in records {
            // SAFETY: registered weakrefs are live until their record is dropped here.
            let color = unsafe { GcHeader::from_ref(weakref) }.color();
            if colors.is_untraced(color) {
                // A finalizer may still resurrect the weakref, so its slot
                // must not outlive the referent.
                self.clear_slot_if_dead(weakref);
                self.dying_weakrefs.push(weakref);
                continue;
            }
            self.clear_if_dead(weakref);
            kept.push(weakref);
        }
        lists.objects_with_weakrefs = kept;

        let young = ctx.young_weakrefs.lock().clone();
        for weakref in young {
            self.clear_if_dead(weakref);
        }
    }

    fn clear_if_dead(&mut self, weakref: GcRef) {
        if self.clear_slot_if_dead(weakref) {
            self.stats.weakrefs_cleared += 1;
        }
    }

    /// Nulls the weak slot of `weakref` if its referent is untraced.
    fn clear_slot_if_dead(&self, weakref: GcRef) -> bool {
        // SAFETY: weakref is intact; its type has a weak pointer field.
        unsafe {
            let info = self.ctx.layout.info_of(weakref);
            let Some(offset) = info.weakpointer_offset else {
                crate::error::invariant_violated(format_args!(
                    "registered weakref {:?} has no weak pointer field",
                    weakref
                ));
            };
            if let Some(target) = weakref.load_ref(offset) {
                if self.ctx.colors.is_untraced(GcHeader::from_ref(target).color()) {
                    weakref.store_ref(offset, None);
                    return true;
                }
            }
            false
        }
    }

    /// Registers again the dying weakrefs that finalizer marking reached.
    fn keep_resurrected_weakrefs(&mut self, lists: &mut CollectorLists) {
        let ctx = self.ctx;
        let colors = &ctx.colors;
        for weakref in self.dying_weakrefs.drain(..) {
            // SAFETY: dying weakrefs are not freed before the sweep.
            if !colors.is_untraced(unsafe { GcHeader::from_ref(weakref) }.color()) {
                lists.objects_with_weakrefs.push(weakref);
            }
        }
    }

    /// Resurrects dead finalizable objects and queues them.
    ///
    /// Their children are marked first. A dead finalizable object reached
    /// that way is deferred: it stays registered and its finalizer runs in a
    /// later cycle, after the one of the object that referenced it. If every
    /// dead object was reached (cycles), they are all queued at once.
    fn mark_from_finalizers(&mut self, worker: &MarkWorker<'_>, lists: &mut CollectorLists) {
        let ctx = self.ctx;
        let colors = &ctx.colors;
        let is_dead = |obj: GcRef| {
            // SAFETY: registered finalizable objects are live or dying, never freed.
            colors.is_untraced(unsafe { GcHeader::from_ref(obj) }.color())
        };
        let (dying, mut alive): (Vec<GcRef>, Vec<GcRef>) = lists
            .objects_with_finalizers
            .drain(..)
            .partition(|&obj| is_dead(obj));
        if dying.is_empty() {
            lists.objects_with_finalizers = alive;
            return;
        }

        for &obj in &dying {
            // SAFETY: dying objects are still intact.
            unsafe { ctx.layout.trace(obj, |child| worker.push(child)) };
        }
        self.drain(worker);

        let (unreached, reached): (Vec<GcRef>, Vec<GcRef>) =
            dying.iter().copied().partition(|&obj| is_dead(obj));
        let scheduled = if unreached.is_empty() {
            dying
        } else {
            alive.extend(reached);
            unreached
        };
        let old = colors.old();
        for &obj in &scheduled {
            // SAFETY: as above.
            let hdr = unsafe { GcHeader::from_ref(obj) };
            let color = hdr.color();
            if colors.is_untraced(color) && hdr.compare_exchange_color(color, old) {
                self.stats.objects_marked += 1;
            }
        }
        self.stats.finalizers_scheduled = scheduled.len();
        ctx.run_finalizers.lock().extend(scheduled);
        lists.objects_with_finalizers = alive;
    }

    /// Unlinks dead objects from the generation lists and promotes the
    /// survivors of the aging generation.
    fn sweep(&mut self, lists: &mut CollectorLists) -> Vec<DeadObject> {
        let mut dead = Vec::new();
        let major = self.kind == CollectionKind::Major;

        let mut old = if major {
            let mut kept = ObjectList::new();
            self.sweep_list(lists.old.take(), &mut kept, &mut dead);
            kept
        } else {
            lists.old.take()
        };
        self.sweep_list(lists.aging.take(), &mut old, &mut dead);
        lists.old = old;

        let old_bytes = lists.old.bytes();
        self.stats.old_bytes_after = old_bytes;
        self.ctx.old_objects.store(lists.old.len(), Ordering::Relaxed);
        self.ctx.old_bytes.store(old_bytes, Ordering::Relaxed);
        if major {
            let config = &self.ctx.config;
            let grown = (old_bytes as f64 * config.major_collection_threshold) as usize;
            lists.next_major_threshold = grown.max(config.min_heap_size);
        }
        dead
    }

    fn sweep_list(&self, list: ObjectList, survivors: &mut ObjectList, dead: &mut Vec<DeadObject>) {
        let colors = &self.ctx.colors;
        for hdr_ptr in list.drain() {
            // SAFETY: list members are initialised headers of intact objects.
            let hdr = unsafe { GcHeader::from_ptr(hdr_ptr) };
            let bytes = unsafe { self.ctx.layout.object_size(hdr.object()) };
            if colors.is_untraced(hdr.color()) {
                dead.push(DeadObject {
                    hdr: hdr_ptr,
                    bytes,
                    large: hdr.has_flag(FLAG_LARGE),
                });
            } else {
                survivors.push(hdr_ptr, bytes);
            }
        }
    }

    /// Returns dead objects to the allocator. Takes the heap lock and nothing
    /// else.
    fn free(&mut self, dead: Vec<DeadObject>) {
        if dead.is_empty() {
            return;
        }
        let ctx = self.ctx;
        let mut heap = ctx.heap.lock();
        for object in dead {
            // SAFETY: the object is unreachable and unlinked from every list.
            unsafe {
                GcHeader::from_ptr(object.hdr).clear();
                let block = object.hdr.cast::<u8>();
                if object.large {
                    heap.arenas.raw_free(block, object.bytes);
                } else {
                    heap.arenas.free(block, object.bytes / WORD);
                }
            }
            self.stats.objects_freed += 1;
            self.stats.bytes_freed += object.bytes;
        }
    }
}
