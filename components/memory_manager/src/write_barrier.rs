//! Deletion (snapshot-at-the-beginning) write barrier and field access.
//!
//! The mutator calls the barrier with the containing object before every
//! pointer store. If the object has not been traced yet by the running
//! cycle, its current referents are handed to the collector first, so the
//! values about to be overwritten still get marked. Every object that takes
//! the slow path is also reset to the young colour and recorded as flagged;
//! flagged objects are roots of the next cycle, which is how old-to-young
//! pointers are found without a card table.

use crate::concurrent_gc::CollectorPhase;
use crate::context::CollectorContext;
use crate::error::{GcError, GcResult};
use crate::gc_assert;
use crate::header::{is_legal_color, GcHeader, FLAG_PREBUILT, FLAG_PREBUILT_ROOT};
use core_types::GcRef;

impl CollectorContext {
    /// Must be called before storing a pointer into `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a live managed or prebuilt object.
    #[inline]
    pub unsafe fn write_barrier(&self, obj: GcRef) {
        let hdr = GcHeader::from_ref(obj);
        if hdr.color() == self.colors.young() {
            return;
        }
        self.write_barrier_slow(obj, hdr);
    }

    #[cold]
    unsafe fn write_barrier_slow(&self, obj: GcRef, hdr: &GcHeader) {
        let mut barrier = self.barrier.lock();
        let color = hdr.color();
        let young = self.colors.young();
        if color == young {
            return;
        }
        gc_assert!(
            is_legal_color(color),
            "write barrier on {:?} with illegal color {:#04x}",
            obj,
            color
        );
        if self.colors.is_untraced(color) {
            let extra = &mut barrier.extra_objects_to_mark;
            self.layout.trace(obj, |child| extra.push(child));
        }
        if hdr.has_flag(FLAG_PREBUILT) && hdr.set_flag(FLAG_PREBUILT_ROOT) {
            barrier.prebuilt_roots.push(obj);
        }
        hdr.set_color(young);
        barrier.flagged_objects.push(obj);
    }

    /// Stores `value` into the pointer field at `offset` of `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be live and `offset` one of its pointer fields.
    pub unsafe fn write_pointer(&self, obj: GcRef, offset: usize, value: Option<GcRef>) {
        self.write_barrier(obj);
        obj.store_ref(offset, value);
    }

    /// Loads the pointer field at `offset` of `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be live and `offset` one of its pointer fields.
    pub unsafe fn read_pointer(&self, obj: GcRef, offset: usize) -> Option<GcRef> {
        obj.load_ref(offset)
    }

    unsafe fn weak_offset(&self, weakref: GcRef) -> GcResult<usize> {
        self.layout.info_of(weakref).weakpointer_offset.ok_or_else(|| {
            GcError::InvalidRequest(format!("{:?} is not a weak reference", weakref))
        })
    }

    /// Returns the referent of `weakref`, or `None` once it has been cleared.
    ///
    /// While marking runs, a referent the collector has not reached yet is
    /// handed to it before being returned, otherwise the caller could keep
    /// an object alive that the collector is about to free.
    ///
    /// # Safety
    ///
    /// `weakref` must be a live object allocated with `contains_weakptr`.
    pub unsafe fn read_weakref(&self, weakref: GcRef) -> GcResult<Option<GcRef>> {
        let offset = self.weak_offset(weakref)?;
        let target = match weakref.load_ref(offset) {
            Some(target) => target,
            None => return Ok(None),
        };
        if !self.colors.is_untraced(GcHeader::from_ref(target).color()) {
            return Ok(Some(target));
        }
        let mut barrier = self.barrier.lock();
        // Weakref clearing happens under this lock, so the slot is final
        // unless marking is still running.
        let target = weakref.load_ref(offset);
        if self.phase.load() == CollectorPhase::Marking {
            if let Some(target) = target {
                barrier.extra_objects_to_mark.push(target);
            }
        }
        Ok(target)
    }

    /// Replaces the referent of `weakref`.
    ///
    /// # Safety
    ///
    /// `weakref` must be a live object allocated with `contains_weakptr`,
    /// `target` a live object.
    pub unsafe fn write_weakref(&self, weakref: GcRef, target: Option<GcRef>) -> GcResult<()> {
        let offset = self.weak_offset(weakref)?;
        weakref.store_ref(offset, target);
        Ok(())
    }
}
