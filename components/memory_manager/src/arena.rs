//! Page and arena allocator for small objects.
//!
//! Memory is obtained from the system in arenas, each aligned to the page
//! size and carved lazily into pages. A page serves blocks of exactly one
//! size class (a multiple of [`WORD`]) and starts with an in-place
//! [`PageHeader`]. Free blocks are chained through their first word.
//!
//! Per size class the allocator keeps a doubly linked chain of pages that
//! still have room. A page leaves the chain when it fills up, comes back when
//! one of its blocks is freed, and moves to the shared pool of free pages
//! once all of its blocks are free again. Arenas are only returned to the
//! system when the collection is dropped.
//!
//! Requests above the small-request threshold bypass all of this and go
//! through [`ArenaCollection::raw_malloc`].

use crate::error::{GcError, GcResult};
use crate::header::WORD;
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};

/// Alignment of large objects.
const LARGE_ALIGN: usize = 16;

/// Header stored at the start of every page in use.
#[repr(C)]
pub struct PageHeader {
    nextpage: *mut PageHeader,
    prevpage: *mut PageHeader,
    /// Blocks at the end of the page never handed out yet.
    nuninitialized: usize,
    /// Blocks in the `freeblock` chain.
    nfree: usize,
    freeblock: *mut u8,
    size_class: usize,
}

/// Bytes at the start of every page taken by its [`PageHeader`].
pub const PAGE_HEADER_SIZE: usize = (std::mem::size_of::<PageHeader>() + WORD - 1) & !(WORD - 1);

/// Number of words needed for `bytes`.
pub fn size_class_for(bytes: usize) -> usize {
    (bytes + WORD - 1) / WORD
}

/// One region obtained from the system allocator.
#[derive(Debug)]
struct Arena {
    base: NonNull<u8>,
    layout: Layout,
}

impl Arena {
    fn new(size: usize, page_size: usize) -> Option<Arena> {
        let layout = Layout::from_size_align(size, page_size).ok()?;
        // SAFETY: the layout has a non-zero size.
        let base = unsafe { alloc(layout) };
        NonNull::new(base).map(|base| Arena { base, layout })
    }

    fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn end(&self) -> usize {
        self.start() + self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: allocated in Arena::new with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// The allocator. Owned by the heap and only used under the heap lock.
pub struct ArenaCollection {
    page_size: usize,
    next_arena_size: usize,
    small_request_threshold: usize,
    max_heap_size: Option<usize>,
    nblocks_for_size: Vec<usize>,
    /// Head of the chain of pages with room, per size class.
    page_for_size: Vec<*mut PageHeader>,
    free_pages: *mut PageHeader,
    arenas: Vec<Arena>,
    /// Next never-used page of the newest arena and the end of that arena.
    uninitialized: usize,
    arena_end: usize,
    arena_bytes: usize,
    large_bytes: usize,
    pages_in_use: usize,
}

// SAFETY: the raw page pointers refer to arenas owned by the collection, and
// the collection is only ever accessed under the heap lock.
unsafe impl Send for ArenaCollection {}

impl ArenaCollection {
    /// Creates an empty collection. No memory is reserved until the first
    /// allocation.
    pub fn new(
        page_size: usize,
        arena_size: usize,
        small_request_threshold: usize,
        max_heap_size: Option<usize>,
    ) -> Self {
        let max_class = size_class_for(small_request_threshold);
        let nblocks_for_size = (0..=max_class)
            .map(|sc| {
                if sc == 0 {
                    0
                } else {
                    (page_size - PAGE_HEADER_SIZE) / (WORD * sc)
                }
            })
            .collect();
        ArenaCollection {
            page_size,
            next_arena_size: round_to_pages(arena_size, page_size),
            small_request_threshold,
            max_heap_size,
            nblocks_for_size,
            page_for_size: vec![ptr::null_mut(); max_class + 1],
            free_pages: ptr::null_mut(),
            arenas: Vec::new(),
            uninitialized: 0,
            arena_end: 0,
            arena_bytes: 0,
            large_bytes: 0,
            pages_in_use: 0,
        }
    }

    /// Largest request served from pages.
    pub fn small_request_threshold(&self) -> usize {
        self.small_request_threshold
    }

    /// Number of blocks of `size_class` that fit in one page.
    pub fn blocks_per_page(&self, size_class: usize) -> usize {
        self.nblocks_for_size[size_class]
    }

    /// Hands out one block of `size_class` words. The content is undefined.
    pub fn allocate(&mut self, size_class: usize) -> GcResult<NonNull<u8>> {
        crate::gc_assert!(
            size_class > 0 && size_class < self.page_for_size.len(),
            "size class {} outside 1..{}",
            size_class,
            self.page_for_size.len()
        );
        let mut page = self.page_for_size[size_class];
        if page.is_null() {
            page = self.allocate_new_page(size_class)?;
        }
        // SAFETY: pages in a size-class chain are initialised and owned by us.
        unsafe {
            let p = &mut *page;
            let block = if !p.freeblock.is_null() {
                let block = p.freeblock;
                p.freeblock = *(block as *mut *mut u8);
                p.nfree -= 1;
                block
            } else {
                crate::gc_assert!(
                    p.nuninitialized > 0,
                    "page {:#x} in chain for size class {} has no room",
                    page as usize,
                    size_class
                );
                let used = self.nblocks_for_size[size_class] - p.nuninitialized;
                p.nuninitialized -= 1;
                (page as *mut u8).add(PAGE_HEADER_SIZE + used * size_class * WORD)
            };
            if p.freeblock.is_null() && p.nuninitialized == 0 {
                // Full: leave the chain. The page is always its head here.
                self.page_for_size[size_class] = p.nextpage;
                if !p.nextpage.is_null() {
                    (*p.nextpage).prevpage = ptr::null_mut();
                }
                p.nextpage = ptr::null_mut();
                p.prevpage = ptr::null_mut();
            }
            Ok(NonNull::new_unchecked(block))
        }
    }

    /// Returns a block to its page.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`allocate`](Self::allocate) with
    /// the same `size_class` and not freed since.
    pub unsafe fn free(&mut self, block: NonNull<u8>, size_class: usize) {
        let page = self.start_of_page(block.as_ptr());
        let p = &mut *page;
        crate::gc_assert!(
            p.size_class == size_class,
            "block {:#x} freed as size class {} but its page holds class {}",
            block.as_ptr() as usize,
            size_class,
            p.size_class
        );
        let was_full = p.freeblock.is_null() && p.nuninitialized == 0;

        // A freed block's first word is the link, an aligned address whose
        // low byte is never a legal colour.
        *(block.as_ptr() as *mut *mut u8) = p.freeblock;
        p.freeblock = block.as_ptr();
        p.nfree += 1;

        if p.nfree + p.nuninitialized == self.nblocks_for_size[size_class] {
            if !was_full {
                self.unlink(page, size_class);
            }
            p.size_class = 0;
            p.prevpage = ptr::null_mut();
            p.nextpage = self.free_pages;
            self.free_pages = page;
            self.pages_in_use -= 1;
        } else if was_full {
            let head = self.page_for_size[size_class];
            p.prevpage = ptr::null_mut();
            p.nextpage = head;
            if !head.is_null() {
                (*head).prevpage = page;
            }
            self.page_for_size[size_class] = page;
        }
    }

    /// Allocates a zeroed block outside the pages.
    pub fn raw_malloc(&mut self, bytes: usize) -> GcResult<NonNull<u8>> {
        self.check_budget(bytes)?;
        let layout = Layout::from_size_align(bytes, LARGE_ALIGN)
            .map_err(|e| GcError::InvalidRequest(format!("{} bytes: {}", bytes, e)))?;
        // SAFETY: callers never request zero bytes (the header alone is 16).
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(GcError::OutOfMemory { requested: bytes })?;
        self.large_bytes += bytes;
        Ok(ptr)
    }

    /// Releases a block obtained from [`raw_malloc`](Self::raw_malloc).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `raw_malloc(bytes)` and not be freed already.
    pub unsafe fn raw_free(&mut self, ptr: NonNull<u8>, bytes: usize) {
        dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(bytes, LARGE_ALIGN));
        self.large_bytes -= bytes;
    }

    /// Number of free blocks in pages that currently serve `size_class`.
    pub fn free_block_count(&self, size_class: usize) -> usize {
        let mut count = 0;
        let mut page = self.page_for_size[size_class];
        while !page.is_null() {
            // SAFETY: chained pages are initialised.
            unsafe {
                count += (*page).nfree;
                page = (*page).nextpage;
            }
        }
        count
    }

    /// Number of completely free pages waiting for reuse.
    pub fn free_page_count(&self) -> usize {
        let mut count = 0;
        let mut page = self.free_pages;
        while !page.is_null() {
            count += 1;
            // SAFETY: pages in the free pool keep a valid link.
            page = unsafe { (*page).nextpage };
        }
        count
    }

    /// Pages currently assigned to a size class.
    pub fn page_count_in_use(&self) -> usize {
        self.pages_in_use
    }

    /// Bytes reserved in arenas.
    pub fn arena_bytes(&self) -> usize {
        self.arena_bytes
    }

    /// Bytes held by large objects.
    pub fn large_bytes(&self) -> usize {
        self.large_bytes
    }

    fn start_of_page(&self, addr: *mut u8) -> *mut PageHeader {
        (addr as usize & !(self.page_size - 1)) as *mut PageHeader
    }

    unsafe fn unlink(&mut self, page: *mut PageHeader, size_class: usize) {
        let p = &mut *page;
        if p.prevpage.is_null() {
            self.page_for_size[size_class] = p.nextpage;
        } else {
            (*p.prevpage).nextpage = p.nextpage;
        }
        if !p.nextpage.is_null() {
            (*p.nextpage).prevpage = p.prevpage;
        }
        p.nextpage = ptr::null_mut();
        p.prevpage = ptr::null_mut();
    }

    fn allocate_new_page(&mut self, size_class: usize) -> GcResult<*mut PageHeader> {
        let page = if !self.free_pages.is_null() {
            let page = self.free_pages;
            // SAFETY: pages in the free pool keep a valid link.
            self.free_pages = unsafe { (*page).nextpage };
            page
        } else {
            if self.uninitialized + self.page_size > self.arena_end {
                self.allocate_new_arena()?;
            }
            let page = self.uninitialized as *mut PageHeader;
            self.uninitialized += self.page_size;
            page
        };
        // SAFETY: the page is page_size bytes of arena memory nobody else uses.
        unsafe {
            ptr::write(
                page,
                PageHeader {
                    nextpage: ptr::null_mut(),
                    prevpage: ptr::null_mut(),
                    nuninitialized: self.nblocks_for_size[size_class],
                    nfree: 0,
                    freeblock: ptr::null_mut(),
                    size_class,
                },
            );
        }
        self.page_for_size[size_class] = page;
        self.pages_in_use += 1;
        Ok(page)
    }

    fn allocate_new_arena(&mut self) -> GcResult<()> {
        let mut size = self.next_arena_size;
        if let Some(max) = self.max_heap_size {
            let used = self.arena_bytes + self.large_bytes;
            let room = round_down_to_pages(max.saturating_sub(used), self.page_size);
            if room == 0 {
                return Err(GcError::OutOfMemory {
                    requested: self.page_size,
                });
            }
            size = size.min(room);
        }
        let arena = Arena::new(size, self.page_size).ok_or(GcError::OutOfMemory {
            requested: size,
        })?;
        tracing::debug!(
            target: "memory_manager::gc",
            arena_size = size,
            arenas = self.arenas.len() + 1,
            "new arena"
        );
        self.uninitialized = arena.start();
        self.arena_end = arena.end();
        self.arena_bytes += size;
        self.arenas.push(arena);
        self.next_arena_size = round_to_pages(size / 4 * 5, self.page_size);
        Ok(())
    }

    fn check_budget(&self, bytes: usize) -> GcResult<()> {
        match self.max_heap_size {
            Some(max) if self.arena_bytes + self.large_bytes + bytes > max => {
                Err(GcError::OutOfMemory { requested: bytes })
            }
            _ => Ok(()),
        }
    }
}

fn round_to_pages(bytes: usize, page_size: usize) -> usize {
    ((bytes + page_size - 1) & !(page_size - 1)).max(page_size)
}

fn round_down_to_pages(bytes: usize, page_size: usize) -> usize {
    bytes & !(page_size - 1)
}
