//! Root enumeration.
//!
//! At the start of every collection the collector asks a [`RootWalker`] for
//! the current roots. The walker invokes one of three callbacks per root it
//! finds, depending on where the root lives.

use crate::gc_ref::GcRef;
use parking_lot::Mutex;

/// Callback receiving one root.
pub type RootCallback<'a> = &'a mut dyn FnMut(GcRef);

/// Enumerates the roots of all mutator threads.
///
/// The collector calls [`walk_roots`](RootWalker::walk_roots) from the
/// mutator thread that triggers a collection. The implementation is
/// responsible for making the other mutators' roots available at that
/// point.
pub trait RootWalker: Send + Sync {
    /// Reports every root through the callback matching its location.
    fn walk_roots(
        &self,
        stack_root: RootCallback<'_>,
        static_nongc_root: RootCallback<'_>,
        static_gc_root: RootCallback<'_>,
    );
}

/// An explicit, shareable list of stack roots.
///
/// # Examples
///
/// ```
/// use core_types::{GcRef, RootSet, RootWalker};
///
/// let mut word = 0usize;
/// let obj = GcRef::from_raw(&mut word as *mut usize as *mut u8).unwrap();
///
/// let roots = RootSet::new();
/// roots.push(obj);
///
/// let mut seen = Vec::new();
/// roots.walk_roots(&mut |r| seen.push(r), &mut |_| {}, &mut |_| {});
/// assert_eq!(seen, vec![obj]);
/// ```
#[derive(Debug, Default)]
pub struct RootSet {
    stack: Mutex<Vec<GcRef>>,
    statics: Mutex<Vec<GcRef>>,
}

impl RootSet {
    /// Creates an empty root set.
    pub fn new() -> Self {
        RootSet::default()
    }

    /// Adds a stack root.
    pub fn push(&self, obj: GcRef) {
        self.stack.lock().push(obj);
    }

    /// Removes the most recently pushed stack root.
    pub fn pop(&self) -> Option<GcRef> {
        self.stack.lock().pop()
    }

    /// Removes every stack occurrence of `obj`. Returns true if one was found.
    pub fn remove(&self, obj: GcRef) -> bool {
        let mut stack = self.stack.lock();
        let before = stack.len();
        stack.retain(|&r| r != obj);
        stack.len() != before
    }

    /// Replaces all stack roots.
    pub fn set(&self, roots: Vec<GcRef>) {
        *self.stack.lock() = roots;
    }

    /// Drops all stack roots.
    pub fn clear(&self) {
        self.stack.lock().clear();
    }

    /// Adds a root living in static, non-GC memory.
    pub fn push_static(&self, obj: GcRef) {
        self.statics.lock().push(obj);
    }

    /// Number of stack roots.
    pub fn len(&self) -> usize {
        self.stack.lock().len()
    }

    /// Returns true if there are no stack roots.
    pub fn is_empty(&self) -> bool {
        self.stack.lock().is_empty()
    }

    /// Snapshot of the stack roots.
    pub fn snapshot(&self) -> Vec<GcRef> {
        self.stack.lock().clone()
    }
}

impl RootWalker for RootSet {
    fn walk_roots(
        &self,
        stack_root: RootCallback<'_>,
        static_nongc_root: RootCallback<'_>,
        _static_gc_root: RootCallback<'_>,
    ) {
        // Snapshots keep the locks out of the callbacks.
        let stack = self.snapshot();
        for root in stack {
            stack_root(root);
        }
        let statics = self.statics.lock().clone();
        for root in statics {
            static_nongc_root(root);
        }
    }
}
