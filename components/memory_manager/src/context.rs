//! State shared between the mutators and the collector thread.
//!
//! Lock order: cycle (in [`Heap`](crate::Heap)) → `heap` → `lists` →
//! `barrier` → the young registries and the finalizer run queue.

use crate::arena::ArenaCollection;
use crate::concurrent_gc::CollectorPhase;
use crate::config::GcConfig;
use crate::gray::GrayQueue;
use crate::header::{GcHeader, OLD_COLORS, YOUNG_COLORS};
use crate::layout::LayoutCache;
use core_types::{GcRef, RootWalker};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// The colours currently playing each role.
///
/// Only changed at trigger time, under the barrier mutex, while the collector
/// thread is idle.
pub struct MarkerColors {
    young: AtomicU8,
    aging: AtomicU8,
    old: AtomicU8,
    /// Old colour of the previous major cycle; 0 outside major cycles.
    previous_old: AtomicU8,
}

impl MarkerColors {
    pub fn new() -> Self {
        MarkerColors {
            young: AtomicU8::new(YOUNG_COLORS[0]),
            aging: AtomicU8::new(YOUNG_COLORS[1]),
            old: AtomicU8::new(OLD_COLORS[0]),
            previous_old: AtomicU8::new(0),
        }
    }

    pub fn young(&self) -> u8 {
        self.young.load(Ordering::Acquire)
    }

    pub fn aging(&self) -> u8 {
        self.aging.load(Ordering::Acquire)
    }

    pub fn old(&self) -> u8 {
        self.old.load(Ordering::Acquire)
    }

    pub fn previous_old(&self) -> u8 {
        self.previous_old.load(Ordering::Acquire)
    }

    /// True if an object of colour `color` has not been traced by the
    /// running cycle.
    pub fn is_untraced(&self, color: u8) -> bool {
        color == self.aging() || (color != 0 && color == self.previous_old())
    }

    /// Young objects become aging. A major cycle also retires the old colour
    /// so that every old object becomes untraced.
    pub(crate) fn rotate(&self, major: bool) {
        let young = self.young();
        self.young.store(self.aging(), Ordering::Release);
        self.aging.store(young, Ordering::Release);
        if major {
            let old = self.old();
            let next = if old == OLD_COLORS[0] {
                OLD_COLORS[1]
            } else {
                OLD_COLORS[0]
            };
            self.previous_old.store(old, Ordering::Release);
            self.old.store(next, Ordering::Release);
        }
    }

    pub(crate) fn end_cycle(&self) {
        self.previous_old.store(0, Ordering::Release);
    }
}

impl Default for MarkerColors {
    fn default() -> Self {
        Self::new()
    }
}

/// Singly linked list of objects threaded through the header `next` word.
#[derive(Default)]
pub struct ObjectList {
    head: Option<NonNull<GcHeader>>,
    len: usize,
    bytes: usize,
}

// SAFETY: the list owns the link words of its objects and is only touched
// under the lock of the structure that holds it.
unsafe impl Send for ObjectList {}

impl ObjectList {
    pub fn new() -> Self {
        ObjectList::default()
    }

    pub fn push(&mut self, hdr: NonNull<GcHeader>, bytes: usize) {
        // SAFETY: list members are initialised headers.
        unsafe { GcHeader::from_ptr(hdr) }.set_next(self.head);
        self.head = Some(hdr);
        self.len += 1;
        self.bytes += bytes;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn take(&mut self) -> ObjectList {
        mem::take(self)
    }

    /// Consumes the list. Each link is read before its object is yielded,
    /// so the consumer may relink or free it.
    pub fn drain(self) -> Drain {
        Drain { next: self.head }
    }
}

pub struct Drain {
    next: Option<NonNull<GcHeader>>,
}

impl Iterator for Drain {
    type Item = NonNull<GcHeader>;

    fn next(&mut self) -> Option<NonNull<GcHeader>> {
        let current = self.next?;
        // SAFETY: list members are initialised headers.
        self.next = unsafe { GcHeader::from_ptr(current) }.next();
        Some(current)
    }
}

/// Guarded by the barrier mutex.
#[derive(Default)]
pub struct BarrierState {
    /// Referents recorded by the write barrier and by weakref reads during
    /// marking. Drained by the collector before it may finish marking.
    pub extra_objects_to_mark: Vec<GcRef>,
    /// Objects reset to young since the last trigger.
    pub flagged_objects: Vec<GcRef>,
    /// Static objects written at least once. Roots of every cycle.
    pub prebuilt_roots: Vec<GcRef>,
}

/// Guarded by the heap lock.
pub struct MutatorHeap {
    pub arenas: ArenaCollection,
    /// Objects allocated since the last trigger.
    pub new_young: ObjectList,
}

/// Guarded by the lists lock. The collector thread holds it for most of a
/// cycle; mutators only take it at trigger time and on drop.
pub struct CollectorLists {
    /// The previous nursery, collected by the running cycle.
    pub aging: ObjectList,
    pub old: ObjectList,
    pub objects_with_finalizers: Vec<GcRef>,
    pub objects_with_weakrefs: Vec<GcRef>,
    /// Old-generation size above which the next trigger starts a major cycle.
    pub next_major_threshold: usize,
}

/// Everything the mutators and the collector thread share.
pub struct CollectorContext {
    pub config: GcConfig,
    pub layout: LayoutCache,
    pub roots: Arc<dyn RootWalker>,
    pub colors: MarkerColors,
    pub phase: AtomicCell<CollectorPhase>,
    /// Roots and flagged objects handed to the collector at trigger.
    pub gray: GrayQueue,
    pub heap: Mutex<MutatorHeap>,
    pub lists: Mutex<CollectorLists>,
    pub barrier: Mutex<BarrierState>,
    /// Weak references allocated since the last trigger.
    pub young_weakrefs: Mutex<Vec<GcRef>>,
    /// Finalizable objects allocated since the last trigger.
    pub young_finalizers: Mutex<Vec<GcRef>>,
    /// Dead objects whose finalizer has not run yet. Kept alive as roots.
    pub run_finalizers: Mutex<VecDeque<GcRef>>,
    /// Old generation as of the last sweep, readable without the lists lock.
    pub old_objects: AtomicUsize,
    pub old_bytes: AtomicUsize,
}

impl CollectorContext {
    pub fn new(config: GcConfig, layout: LayoutCache, roots: Arc<dyn RootWalker>) -> Self {
        let arenas = ArenaCollection::new(
            config.page_size,
            config.arena_size,
            config.small_request_threshold,
            config.max_heap_size,
        );
        let next_major_threshold = config.min_heap_size;
        CollectorContext {
            layout,
            roots,
            colors: MarkerColors::new(),
            phase: AtomicCell::new(CollectorPhase::Idle),
            gray: GrayQueue::new(),
            heap: Mutex::new(MutatorHeap {
                arenas,
                new_young: ObjectList::new(),
            }),
            lists: Mutex::new(CollectorLists {
                aging: ObjectList::new(),
                old: ObjectList::new(),
                objects_with_finalizers: Vec::new(),
                objects_with_weakrefs: Vec::new(),
                next_major_threshold,
            }),
            barrier: Mutex::new(BarrierState::default()),
            young_weakrefs: Mutex::new(Vec::new()),
            young_finalizers: Mutex::new(Vec::new()),
            run_finalizers: Mutex::new(VecDeque::new()),
            old_objects: AtomicUsize::new(0),
            old_bytes: AtomicUsize::new(0),
            config,
        }
    }
}
