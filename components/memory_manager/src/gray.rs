//! Gray-object queues.
//!
//! Gray objects have been discovered but their fields not yet traced. The
//! mutator hands roots to the collector through the shared [`GrayQueue`]
//! at trigger time; the collector thread then works off a private
//! [`MarkWorker`] that refills itself from the shared queue.
//!
//! The barrier's `extra_objects_to_mark` list is not one of these: it lives
//! under the barrier mutex, see [`crate::context::BarrierState`].

use core_types::GcRef;
use crossbeam_deque::{Injector, Steal, Worker};

/// Shared queue of gray objects, safe to push from any thread.
pub struct GrayQueue {
    injector: Injector<GcRef>,
}

impl GrayQueue {
    pub fn new() -> Self {
        GrayQueue {
            injector: Injector::new(),
        }
    }

    pub fn push(&self, obj: GcRef) {
        self.injector.push(obj);
    }

    /// Takes one object, retrying while the queue is contended.
    pub fn pop(&self) -> Option<GcRef> {
        loop {
            match self.injector.steal() {
                Steal::Success(obj) => return Some(obj),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The collector thread's private gray stack.
///
/// Depth-first (LIFO) locally; when it runs dry it moves a batch over from
/// the shared queue.
pub struct MarkWorker<'a> {
    local: Worker<GcRef>,
    shared: &'a GrayQueue,
}

impl<'a> MarkWorker<'a> {
    pub fn new(shared: &'a GrayQueue) -> Self {
        MarkWorker {
            local: Worker::new_lifo(),
            shared,
        }
    }

    pub fn push(&self, obj: GcRef) {
        self.local.push(obj);
    }

    pub fn pop(&self) -> Option<GcRef> {
        if let Some(obj) = self.local.pop() {
            return Some(obj);
        }
        loop {
            match self.shared.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(obj) => return Some(obj),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.shared.is_empty()
    }
}
