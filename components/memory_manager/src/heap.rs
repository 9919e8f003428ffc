//! The public heap: allocation, the mutator/collector handshake and
//! finalizer execution.
//!
//! A [`Heap`] is shared by any number of mutator threads. Objects are
//! allocated young; [`Heap::trigger_next_collection`] turns the young
//! objects into the aging generation and starts the collector thread on
//! them, then returns immediately. The next trigger (or
//! [`Heap::wait_for_the_end_of_collection`]) joins that cycle.

use crate::concurrent_gc::{CollectionKind, CollectorPhase, CollectorThread};
use crate::config::GcConfig;
use crate::context::CollectorContext;
use crate::error::{GcError, GcResult};
use crate::header::{
    GcHeader, COLOR_STATIC, FLAG_FINALIZER, FLAG_LARGE, FLAG_PREBUILT, FLAG_WEAKREF, HEADER_SIZE,
    WORD,
};
use crate::layout::{round_up_to_word, LayoutCache};
use crate::stats::{CycleStats, CycleTotals, HeapStats};
use core_types::{GcRef, RootWalker, TypeId, TypeLayout};
use parking_lot::Mutex;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Join state, guarded by the cycle lock.
struct CycleState {
    collector: CollectorThread,
    /// Kind of the cycle started and not joined yet.
    running: Option<CollectionKind>,
    /// Set once a cycle failed; the heap cannot be collected any more.
    poisoned: Option<String>,
}

/// A garbage-collected heap served by one background collector thread.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use core_types::{RootSet, TypeDescriptor, TypeTable};
/// use memory_manager::{GcConfig, Heap};
///
/// let mut types = TypeTable::new();
/// let pair = types.register(TypeDescriptor::fixed("pair", 16).with_pointers(&[0, 8]));
/// let roots = Arc::new(RootSet::new());
/// let heap = Heap::new(GcConfig::default(), Arc::new(types), roots.clone()).unwrap();
///
/// let kept = heap.malloc_fixed(pair, 16, false, false).unwrap();
/// let child = heap.malloc_fixed(pair, 16, false, false).unwrap();
/// unsafe { heap.write_pointer(kept, 0, Some(child)) };
/// heap.malloc_fixed(pair, 16, false, false).unwrap();
/// roots.push(kept);
///
/// heap.collect().unwrap();
/// let cycle = heap.stats().last_cycle.unwrap();
/// assert_eq!(cycle.objects_freed, 1);
/// assert_eq!(unsafe { heap.read_pointer(kept, 0) }, Some(child));
/// ```
pub struct Heap {
    ctx: Arc<CollectorContext>,
    cycle: Mutex<CycleState>,
    totals: Mutex<(CycleTotals, Option<CycleStats>)>,
    running_finalizers: AtomicBool,
}

impl Heap {
    /// Creates a heap and starts its collector thread.
    pub fn new(
        config: GcConfig,
        layout: Arc<dyn TypeLayout>,
        roots: Arc<dyn RootWalker>,
    ) -> GcResult<Heap> {
        config.validate()?;
        let ctx = Arc::new(CollectorContext::new(config, LayoutCache::new(layout), roots));
        let collector = CollectorThread::spawn(ctx.clone())?;
        tracing::debug!(
            target: "memory_manager::gc",
            page_size = ctx.config.page_size,
            nursery_size = ctx.config.nursery_size,
            "heap created"
        );
        Ok(Heap {
            ctx,
            cycle: Mutex::new(CycleState {
                collector,
                running: None,
                poisoned: None,
            }),
            totals: Mutex::new((CycleTotals::default(), None)),
            running_finalizers: AtomicBool::new(false),
        })
    }

    /// The configuration the heap runs with.
    pub fn config(&self) -> &GcConfig {
        &self.ctx.config
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates a fixed-size object of `size` payload bytes.
    ///
    /// `size` must match the layout's fixed size, and `contains_weakptr`
    /// must be set exactly for types with a weak pointer field. Objects
    /// with a finalizer or a weak pointer field are registered for the
    /// collector.
    ///
    /// A full nursery makes this call trigger the next collection, so the
    /// same safepoint rule as for
    /// [`trigger_next_collection`](Self::trigger_next_collection) applies.
    pub fn malloc_fixed(
        &self,
        type_id: TypeId,
        size: usize,
        needs_finalizer: bool,
        contains_weakptr: bool,
    ) -> GcResult<GcRef> {
        let info = self.ctx.layout.checked_info(type_id)?;
        if info.varsize.is_some() {
            return Err(GcError::InvalidRequest(format!(
                "{} is variable-sized, use malloc_varsize",
                type_id
            )));
        }
        if size != info.fixed_size {
            return Err(GcError::InvalidRequest(format!(
                "{} has {} payload bytes, {} requested",
                type_id, info.fixed_size, size
            )));
        }
        let mut flags = 0;
        if needs_finalizer {
            if info.finalizer.is_none() {
                return Err(GcError::InvalidRequest(format!(
                    "{} has no finalizer",
                    type_id
                )));
            }
            flags |= FLAG_FINALIZER;
        }
        match (contains_weakptr, info.weakpointer_offset.is_some()) {
            (true, true) => flags |= FLAG_WEAKREF,
            (false, false) => {}
            (true, false) => {
                return Err(GcError::InvalidRequest(format!(
                    "{} has no weak pointer field",
                    type_id
                )));
            }
            (false, true) => {
                return Err(GcError::InvalidRequest(format!(
                    "{} has a weak pointer field, contains_weakptr must be set",
                    type_id
                )));
            }
        }
        let total = round_up_to_word(HEADER_SIZE + size);
        self.allocate(type_id, total, flags, None)
    }

    /// Allocates a variable-sized object with `length` items of
    /// `item_size` bytes after a fixed part of `size` bytes. The length is
    /// stored at `offset_to_length`.
    ///
    /// May trigger the next collection like [`malloc_fixed`](Self::malloc_fixed).
    pub fn malloc_varsize(
        &self,
        type_id: TypeId,
        length: usize,
        size: usize,
        item_size: usize,
        offset_to_length: usize,
    ) -> GcResult<GcRef> {
        let info = self.ctx.layout.checked_info(type_id)?;
        let Some(varsize) = info.varsize.as_ref() else {
            return Err(GcError::InvalidRequest(format!(
                "{} is not variable-sized",
                type_id
            )));
        };
        if info.weakpointer_offset.is_some() {
            return Err(GcError::Unimplemented("weak pointers in varsize objects"));
        }
        if size != varsize.offset_to_variable_part
            || item_size != varsize.item_size
            || offset_to_length != varsize.offset_to_length
        {
            return Err(GcError::InvalidRequest(format!(
                "{} layout mismatch: size {}, item size {}, length offset {}",
                type_id, size, item_size, offset_to_length
            )));
        }
        let total = length
            .checked_mul(item_size)
            .and_then(|items| items.checked_add(HEADER_SIZE + size))
            .and_then(|bytes| bytes.checked_add(WORD - 1))
            .map(|bytes| bytes & !(WORD - 1))
            .ok_or_else(|| {
                GcError::InvalidRequest(format!("{} items of {} bytes overflow", length, item_size))
            })?;
        let flags = if info.finalizer.is_some() { FLAG_FINALIZER } else { 0 };
        self.allocate(type_id, total, flags, Some((offset_to_length, length)))
    }

    fn allocate(
        &self,
        type_id: TypeId,
        total: usize,
        flags: u8,
        length: Option<(usize, usize)>,
    ) -> GcResult<GcRef> {
        let mut may_trigger = true;
        let mut collected = false;
        loop {
            match self.try_allocate(type_id, total, flags, length, may_trigger) {
                Ok(Some(obj)) => return Ok(obj),
                Ok(None) => {
                    // Triggered before allocating, so the new object stays
                    // young and out of the cycle just started.
                    self.trigger_next_collection()?;
                    may_trigger = false;
                }
                Err(GcError::OutOfMemory { requested }) if !collected => {
                    tracing::warn!(
                        target: "memory_manager::gc",
                        requested,
                        "allocation failed, forcing a full collection"
                    );
                    self.collect()?;
                    collected = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Allocates and registers one object under the heap lock. Returns
    /// `None` without allocating when the nursery is full and `may_trigger`
    /// is set.
    fn try_allocate(
        &self,
        type_id: TypeId,
        total: usize,
        mut flags: u8,
        length: Option<(usize, usize)>,
        may_trigger: bool,
    ) -> GcResult<Option<GcRef>> {
        let ctx = &*self.ctx;
        let mut heap = ctx.heap.lock();
        if may_trigger && heap.new_young.bytes() >= ctx.config.nursery_size {
            return Ok(None);
        }
        let large = total > heap.arenas.small_request_threshold();
        let block = if large {
            flags |= FLAG_LARGE;
            heap.arenas.raw_malloc(total)?
        } else {
            heap.arenas.allocate(total / WORD)?
        };

        // SAFETY: the block is `total` bytes, exclusively ours until it is
        // published on the young list.
        let obj = unsafe {
            if ctx.config.zero_fill && !large {
                ptr::write_bytes(block.as_ptr(), 0, total);
            }
            let hdr = GcHeader::init(block, type_id, ctx.colors.young(), flags);
            let obj = GcHeader::from_ptr(hdr).object();
            if let Some((offset, length)) = length {
                obj.write_word(offset, length);
            }
            if !ctx.config.zero_fill && !large {
                ctx.layout.for_each_pointer_offset(obj, |offset| obj.store_ref(offset, None));
                if let Some(offset) = ctx.layout.info(type_id).weakpointer_offset {
                    obj.store_ref(offset, None);
                }
            }
            heap.new_young.push(hdr, total);
            obj
        };

        if flags & FLAG_FINALIZER != 0 {
            ctx.young_finalizers.lock().push(obj);
        }
        if flags & FLAG_WEAKREF != 0 {
            ctx.young_weakrefs.lock().push(obj);
        }
        Ok(Some(obj))
    }

    /// Turns `addr` into a prebuilt (static) object of type `type_id` and
    /// returns its reference. Prebuilt objects are never freed.
    ///
    /// # Safety
    ///
    /// `addr` must be word aligned, writable for [`HEADER_SIZE`] plus the
    /// payload size, and outlive the heap. The payload must not point to
    /// managed objects until the first barriered write.
    pub unsafe fn init_prebuilt_object(&self, addr: NonNull<u8>, type_id: TypeId) -> GcRef {
        let hdr = GcHeader::init(addr, type_id, COLOR_STATIC, FLAG_PREBUILT);
        GcHeader::from_ptr(hdr).object()
    }

    // ------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------

    /// Must be called before storing a pointer into `obj` by other means
    /// than [`write_pointer`](Self::write_pointer).
    ///
    /// # Safety
    ///
    /// `obj` must be a live object of this heap.
    pub unsafe fn write_barrier(&self, obj: GcRef) {
        self.ctx.write_barrier(obj)
    }

    /// Barriered pointer store.
    ///
    /// # Safety
    ///
    /// `obj` must be live and `offset` one of its pointer fields; `value`
    /// must be live.
    pub unsafe fn write_pointer(&self, obj: GcRef, offset: usize, value: Option<GcRef>) {
        self.ctx.write_pointer(obj, offset, value)
    }

    /// Pointer load.
    ///
    /// # Safety
    ///
    /// `obj` must be live and `offset` one of its pointer fields.
    pub unsafe fn read_pointer(&self, obj: GcRef, offset: usize) -> Option<GcRef> {
        self.ctx.read_pointer(obj, offset)
    }

    /// Referent of a weak reference, `None` once it has been collected.
    ///
    /// # Safety
    ///
    /// `weakref` must be a live weak reference of this heap.
    pub unsafe fn read_weakref(&self, weakref: GcRef) -> GcResult<Option<GcRef>> {
        self.ctx.read_weakref(weakref)
    }

    /// Sets the referent of a weak reference.
    ///
    /// # Safety
    ///
    /// `weakref` must be a live weak reference of this heap and `target`
    /// live.
    pub unsafe fn write_weakref(&self, weakref: GcRef, target: Option<GcRef>) -> GcResult<()> {
        self.ctx.write_weakref(weakref, target)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Starts a collection of the current young objects and returns without
    /// waiting for it. A cycle still running is joined first.
    ///
    /// Other mutator threads must be at a point where the root walker can
    /// report their roots.
    pub fn trigger_next_collection(&self) -> GcResult<()> {
        self.trigger(false)
    }

    /// Blocks until the running cycle, if any, has finished, then runs the
    /// finalizers it queued.
    pub fn wait_for_the_end_of_collection(&self) -> GcResult<()> {
        {
            let mut cycle = self.cycle.lock();
            self.join(&mut cycle)?;
        }
        self.execute_finalizers();
        Ok(())
    }

    /// Runs a full (major) collection to completion.
    pub fn collect(&self) -> GcResult<()> {
        self.trigger(true)?;
        self.wait_for_the_end_of_collection()
    }

    fn trigger(&self, force_major: bool) -> GcResult<()> {
        let mut cycle = self.cycle.lock();
        self.join(&mut cycle)?;

        // Roots are gathered before any collector lock is taken; the walker
        // is foreign code.
        let (mut stack, mut statics, mut prebuilt) = (Vec::new(), Vec::new(), Vec::new());
        self.ctx.roots.walk_roots(
            &mut |r| stack.push(r),
            &mut |r| statics.push(r),
            &mut |r| prebuilt.push(r),
        );

        let ctx = &*self.ctx;
        let mut heap = ctx.heap.lock();
        let mut lists = ctx.lists.lock();
        let kind = if force_major || lists.old.bytes() > lists.next_major_threshold {
            CollectionKind::Major
        } else {
            CollectionKind::Minor
        };
        crate::gc_assert!(
            lists.aging.is_empty(),
            "aging generation not empty at trigger ({} objects)",
            lists.aging.len()
        );
        crate::gc_assert!(ctx.gray.is_empty(), "gray queue not empty at trigger");

        let flagged = {
            let mut barrier = ctx.barrier.lock();
            ctx.colors.rotate(kind == CollectionKind::Major);
            let flagged = barrier.flagged_objects.len();
            for obj in barrier.flagged_objects.drain(..) {
                ctx.gray.push(obj);
            }
            for &obj in &barrier.prebuilt_roots {
                ctx.gray.push(obj);
            }
            for &obj in stack.iter().chain(&statics).chain(&prebuilt) {
                ctx.gray.push(obj);
            }
            for &obj in ctx.run_finalizers.lock().iter() {
                ctx.gray.push(obj);
            }
            ctx.phase.store(CollectorPhase::Marking);
            flagged
        };

        lists.aging = heap.new_young.take();
        lists
            .objects_with_weakrefs
            .extend(ctx.young_weakrefs.lock().drain(..));
        lists
            .objects_with_finalizers
            .extend(ctx.young_finalizers.lock().drain(..));

        tracing::debug!(
            target: "memory_manager::gc",
            kind = ?kind,
            roots = stack.len() + statics.len() + prebuilt.len(),
            flagged,
            aging = lists.aging.len(),
            "collection triggered"
        );
        drop(lists);
        drop(heap);

        if let Err(e) = cycle.collector.start(kind) {
            cycle.poisoned = Some(e.to_string());
            return Err(e);
        }
        cycle.running = Some(kind);
        Ok(())
    }

    /// Collects the outcome of the running cycle, if any.
    fn join(&self, cycle: &mut CycleState) -> GcResult<()> {
        if let Some(message) = &cycle.poisoned {
            return Err(GcError::CollectorFailed(message.clone()));
        }
        let Some(kind) = cycle.running.take() else {
            return Ok(());
        };
        match cycle.collector.wait_finished() {
            Ok(stats) => {
                self.ctx.barrier.lock().extra_objects_to_mark.clear();
                self.ctx.colors.end_cycle();
                self.ctx.phase.store(CollectorPhase::Idle);
                tracing::info!(
                    target: "memory_manager::gc",
                    kind = ?kind,
                    marked = stats.objects_marked,
                    freed = stats.objects_freed,
                    bytes_freed = stats.bytes_freed,
                    weakrefs_cleared = stats.weakrefs_cleared,
                    finalizers = stats.finalizers_scheduled,
                    old_bytes = stats.old_bytes_after,
                    duration_us = stats.duration_us,
                    "collection finished"
                );
                let mut totals = self.totals.lock();
                totals.0.record(&stats);
                totals.1 = Some(stats);
                Ok(())
            }
            Err(e) => {
                tracing::error!(target: "memory_manager::gc", error = %e, "heap poisoned");
                cycle.poisoned = Some(match &e {
                    GcError::CollectorFailed(message) => message.clone(),
                    other => other.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Runs the finalizers queued by finished cycles. Does nothing when
    /// called from inside a finalizer.
    pub fn execute_finalizers(&self) {
        if self.running_finalizers.swap(true, Ordering::Acquire) {
            return;
        }
        let _reset = ResetOnDrop(&self.running_finalizers);
        loop {
            // The object stays queued, and therefore rooted, while its
            // finalizer runs.
            let next = self.ctx.run_finalizers.lock().front().copied();
            let Some(obj) = next else { break };
            // SAFETY: queued objects are kept alive until popped below.
            let info = unsafe { self.ctx.layout.info_of(obj) };
            if let Some(finalizer) = info.finalizer {
                finalizer(obj);
            }
            self.ctx.run_finalizers.lock().pop_front();
            self.totals.lock().0.finalizers_run += 1;
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Current phase of the collector thread.
    pub fn collector_phase(&self) -> CollectorPhase {
        self.ctx.phase.load()
    }

    /// True between a trigger and the join of its cycle.
    pub fn is_collecting(&self) -> bool {
        self.ctx.phase.load() != CollectorPhase::Idle
    }

    /// Free blocks currently available for `size_class` (in words).
    pub fn free_block_count(&self, size_class: usize) -> usize {
        self.ctx.heap.lock().arenas.free_block_count(size_class)
    }

    /// Snapshot of the heap statistics. Does not wait for a running cycle.
    pub fn stats(&self) -> HeapStats {
        let ctx = &*self.ctx;
        let (young_objects, young_bytes, arena_bytes, large_bytes, pages_in_use, free_pages) = {
            let heap = ctx.heap.lock();
            (
                heap.new_young.len(),
                heap.new_young.bytes(),
                heap.arenas.arena_bytes(),
                heap.arenas.large_bytes(),
                heap.arenas.page_count_in_use(),
                heap.arenas.free_page_count(),
            )
        };
        let pending_finalizers = ctx.run_finalizers.lock().len();
        let (totals, last_cycle) = self.totals.lock().clone();
        HeapStats {
            phase: ctx.phase.load(),
            young_objects,
            young_bytes,
            old_objects: ctx.old_objects.load(Ordering::Relaxed),
            old_bytes: ctx.old_bytes.load(Ordering::Relaxed),
            arena_bytes,
            large_bytes,
            pages_in_use,
            free_pages,
            pending_finalizers,
            totals,
            last_cycle,
        }
    }
}

struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let cycle = self.cycle.get_mut();
        if cycle.running.is_some() {
            if let Ok(stats) = cycle.collector.wait_finished() {
                tracing::debug!(
                    target: "memory_manager::gc",
                    freed = stats.objects_freed,
                    "joined collection on drop"
                );
            }
            cycle.running = None;
        }
        cycle.collector.shutdown();

        // Arenas go with the context; large objects have to be released here.
        let ctx = &*self.ctx;
        let mut heap = ctx.heap.lock();
        let mut lists = ctx.lists.lock();
        let young = heap.new_young.take();
        let lists_taken = [young, lists.aging.take(), lists.old.take()];
        for list in lists_taken {
            for hdr_ptr in list.drain() {
                // SAFETY: the collector thread is gone; nothing else uses these objects.
                unsafe {
                    let hdr = GcHeader::from_ptr(hdr_ptr);
                    if hdr.has_flag(FLAG_LARGE) {
                        let bytes = ctx.layout.object_size(hdr.object());
                        heap.arenas.raw_free(hdr_ptr.cast(), bytes);
                    }
                }
            }
        }
    }
}
