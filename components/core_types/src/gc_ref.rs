//! Object references and type identifiers shared between the collector and
//! its collaborators.
//!
//! A [`GcRef`] is the address of the first byte of an object's payload, i.e.
//! the word just past the collector-owned header. Field offsets handed out by
//! the type layout oracle are relative to this address.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Identifier of an object's type, as understood by the layout oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    /// Returns the raw numeric id.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Non-null reference to a managed object.
///
/// `GcRef` is a plain address: copying it does not keep the object alive.
/// Liveness is decided by reachability from the roots reported by the
/// root walker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef(NonNull<u8>);

// SAFETY: a GcRef is an address into the collector-managed heap. All
// accesses through it go through atomic field operations or happen under
// the collector's locks.
unsafe impl Send for GcRef {}
unsafe impl Sync for GcRef {}

impl GcRef {
    /// Wraps a raw payload address, returning `None` for null.
    pub fn from_raw(ptr: *mut u8) -> Option<GcRef> {
        NonNull::new(ptr).map(GcRef)
    }

    /// Wraps a non-null payload address.
    pub fn from_non_null(ptr: NonNull<u8>) -> GcRef {
        GcRef(ptr)
    }

    /// Returns the payload address.
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Returns the payload address as an integer.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Returns the address of the field at `offset` bytes into the payload.
    ///
    /// # Safety
    ///
    /// `offset` must lie within the object's payload.
    pub unsafe fn field_ptr(self, offset: usize) -> *mut u8 {
        self.0.as_ptr().add(offset)
    }

    /// Atomically loads the object reference stored at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be a word-aligned pointer field of a live object.
    pub unsafe fn load_ref(self, offset: usize) -> Option<GcRef> {
        let slot = &*(self.field_ptr(offset) as *const AtomicPtr<u8>);
        GcRef::from_raw(slot.load(Ordering::Acquire))
    }

    /// Atomically stores an object reference at `offset`.
    ///
    /// This bypasses the write barrier; mutators go through the heap's
    /// `write_pointer` instead.
    ///
    /// # Safety
    ///
    /// `offset` must be a word-aligned pointer field of a live object.
    pub unsafe fn store_ref(self, offset: usize, value: Option<GcRef>) {
        let slot = &*(self.field_ptr(offset) as *const AtomicPtr<u8>);
        let raw = value.map_or(std::ptr::null_mut(), GcRef::as_ptr);
        slot.store(raw, Ordering::Release);
    }

    /// Reads a non-pointer word at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be a word-aligned field of a live object.
    pub unsafe fn read_word(self, offset: usize) -> usize {
        let slot = &*(self.field_ptr(offset) as *const AtomicUsize);
        slot.load(Ordering::Relaxed)
    }

    /// Writes a non-pointer word at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be a word-aligned, non-pointer field of a live object.
    pub unsafe fn write_word(self, offset: usize, value: usize) {
        let slot = &*(self.field_ptr(offset) as *const AtomicUsize);
        slot.store(value, Ordering::Relaxed);
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:#x})", self.addr())
    }
}
