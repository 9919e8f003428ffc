//! Object header codec.
//!
//! Every managed object is preceded by a two-word [`GcHeader`]:
//!
//! ```text
//! word 0:  | type id (32) | unused (16) | flags (8) | color (8) |
//! word 1:  next object in the generation list
//! ```
//!
//! The collector thread changes the colour byte while mutators read the type
//! id, so the colour is only ever updated through a compare-and-swap of the
//! whole word that preserves the other bits.

use crate::gc_assert;
use core_types::{GcRef, TypeId};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Machine word size, the unit of size classes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Size of the object header.
pub const HEADER_SIZE: usize = std::mem::size_of::<GcHeader>();

/// Colour of prebuilt (static) objects.
pub const COLOR_STATIC: u8 = b'S';
/// The two colours rotated between the young and the aging generation.
pub const YOUNG_COLORS: [u8; 2] = [b'm', b'K'];
/// The two colours rotated for old objects.
pub const OLD_COLORS: [u8; 2] = [b'#', b'/'];

/// The object has a finalizer.
pub const FLAG_FINALIZER: u8 = 0x01;
/// The object is a weak reference.
pub const FLAG_WEAKREF: u8 = 0x02;
/// The object was allocated outside the page allocator.
pub const FLAG_LARGE: u8 = 0x04;
/// The object lives in static memory and is never freed.
pub const FLAG_PREBUILT: u8 = 0x08;
/// Static object that has been written to and is scanned at every trigger.
pub const FLAG_PREBUILT_ROOT: u8 = 0x10;

const COLOR_MASK: u64 = 0xff;
const FLAGS_SHIFT: u32 = 8;
const FLAGS_MASK: u64 = 0xff << FLAGS_SHIFT;
const TYPE_SHIFT: u32 = 32;

/// Packs a header word.
pub fn make_header(type_id: TypeId, color: u8, flags: u8) -> u64 {
    ((type_id.0 as u64) << TYPE_SHIFT) | ((flags as u64) << FLAGS_SHIFT) | color as u64
}

/// Returns true for every colour an initialised object can carry.
pub fn is_legal_color(color: u8) -> bool {
    color == COLOR_STATIC || YOUNG_COLORS.contains(&color) || OLD_COLORS.contains(&color)
}

/// Header preceding every managed object.
#[repr(C)]
pub struct GcHeader {
    word: AtomicU64,
    next: AtomicPtr<GcHeader>,
}

impl GcHeader {
    /// Returns the header of the object whose payload starts at `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must point to the payload of an object allocated by this
    /// collector or registered as a prebuilt object.
    pub unsafe fn from_ref<'a>(obj: GcRef) -> &'a GcHeader {
        &*(obj.as_ptr().sub(HEADER_SIZE) as *const GcHeader)
    }

    /// Returns the header at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a header written with [`GcHeader::init`].
    pub unsafe fn from_ptr<'a>(ptr: NonNull<GcHeader>) -> &'a GcHeader {
        &*ptr.as_ptr()
    }

    /// Writes a fresh header at `block`.
    ///
    /// # Safety
    ///
    /// `block` must be writable for [`HEADER_SIZE`] bytes, word aligned,
    /// and not yet visible to any other thread.
    pub unsafe fn init(block: NonNull<u8>, type_id: TypeId, color: u8, flags: u8) -> NonNull<GcHeader> {
        let hdr = block.cast::<GcHeader>();
        ptr::write(
            hdr.as_ptr(),
            GcHeader {
                word: AtomicU64::new(make_header(type_id, color, flags)),
                next: AtomicPtr::new(ptr::null_mut()),
            },
        );
        hdr
    }

    /// Payload reference of this object.
    pub fn object(&self) -> GcRef {
        // SAFETY: the payload directly follows a header that lives inside a block.
        let payload = unsafe { (self as *const GcHeader as *mut u8).add(HEADER_SIZE) };
        GcRef::from_non_null(NonNull::new(payload).unwrap_or_else(|| {
            crate::error::invariant_violated(format_args!("header at end of address space"))
        }))
    }

    /// Pointer to this header.
    pub fn as_non_null(&self) -> NonNull<GcHeader> {
        NonNull::from(self)
    }

    /// Reads the raw header word.
    pub fn raw(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Current colour.
    pub fn color(&self) -> u8 {
        (self.raw() & COLOR_MASK) as u8
    }

    /// Replaces the colour, leaving type id and flags untouched.
    pub fn set_color(&self, color: u8) {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let new = (current & !COLOR_MASK) | color as u64;
            match self
                .word
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Changes the colour from `expected` to `new` if it still is `expected`.
    /// Returns false if another thread changed the colour first.
    pub fn compare_exchange_color(&self, expected: u8, new: u8) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            if (current & COLOR_MASK) as u8 != expected {
                return false;
            }
            let replaced = (current & !COLOR_MASK) | new as u64;
            match self
                .word
                .compare_exchange_weak(current, replaced, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Type id of the object. The header must be initialised.
    pub fn type_id(&self) -> TypeId {
        let word = self.raw();
        let color = (word & COLOR_MASK) as u8;
        gc_assert!(
            is_legal_color(color),
            "type id read from header {:#x} with illegal color {:#04x}",
            self as *const GcHeader as usize,
            color
        );
        TypeId((word >> TYPE_SHIFT) as u32)
    }

    /// Flag byte.
    pub fn flags(&self) -> u8 {
        ((self.raw() & FLAGS_MASK) >> FLAGS_SHIFT) as u8
    }

    /// Returns true if every bit of `flag` is set.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag == flag
    }

    /// Sets `flag`. Returns true if it was not set before.
    pub fn set_flag(&self, flag: u8) -> bool {
        let previous = self
            .word
            .fetch_or((flag as u64) << FLAGS_SHIFT, Ordering::AcqRel);
        ((previous & FLAGS_MASK) >> FLAGS_SHIFT) as u8 & flag != flag
    }

    /// Overwrites the word with an illegal colour so that stale references
    /// trip the type id assertion.
    pub fn clear(&self) {
        self.word.store(0, Ordering::Release);
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
    }

    /// Next object in the generation list.
    pub fn next(&self) -> Option<NonNull<GcHeader>> {
        NonNull::new(self.next.load(Ordering::Relaxed))
    }

    /// Links the next object in the generation list.
    pub fn set_next(&self, next: Option<NonNull<GcHeader>>) {
        let raw = next.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.next.store(raw, Ordering::Relaxed);
    }
}
