//! Definition of fixed size byte regions that back a ring.

use crate::RingError;
use memmap2::{MmapMut, MmapOptions};
use std::{
    alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// A contiguous region of bytes with a size fixed at allocation time.
///
/// The ring never grows or shrinks its memory, so implementations only
/// need to hand out the same region over and over again.
pub trait Memory: AsRef<[u8]> + AsMut<[u8]> + Send {
    /// Allocate a new zero initialized region of exactly `len` visible bytes.
    ///
    /// Returns [`RingError::InvalidCapacity`] when `len` is 0 or too large to
    /// ever be allocated.
    ///
    /// # Arguments
    ///
    /// * `len` - Number of bytes in the region, must be > 0.
    fn alloc(len: usize) -> Result<Self, RingError>
    where
        Self: Sized;
}

// Safety: Raw pointer is only exposed via AsRef and AsMut.
unsafe impl Sync for Heap {}
unsafe impl Send for Heap {}

/// Memory allocated using the registered global allocator.
///
/// * If no custom allocator is registered, the default allocator from Rust std is used.
/// * Uses RAII pattern to free memory when heap memory goes out of scope.
#[derive(Debug)]
pub struct Heap {
    len: usize,
    layout: Layout,
    ptr: NonNull<u8>,
}

impl Memory for Heap {
    fn alloc(len: usize) -> Result<Self, RingError> {
        if len == 0 {
            return Err(RingError::InvalidCapacity);
        }

        // More than isize::MAX bytes can never be allocated.
        let layout = Layout::array::<u8>(len).map_err(|_| RingError::InvalidCapacity)?;

        // Zeroed so that every byte handed out is initialized.
        // Safety: We just made sure layout is correct and non-zero sized.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));

        Ok(Self { len, ptr, layout })
    }
}

impl Drop for Heap {
    #[inline]
    fn drop(&mut self) {
        // Safety: Cannot initialize with invalid pointer and layout.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl AsRef<[u8]> for Heap {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        // Safety
        // * Pointer is guaranteed to be initialized.
        // * length is guaranteed to be > 0.
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for Heap {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        // Safety
        // * Pointer is guaranteed to be initialized.
        // * length is guaranteed to be > 0.
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Off heap memory from an anonymous memory map.
///
/// The mapping is rounded up to a whole number of pages, but only the
/// requested number of bytes is ever visible.
#[derive(Debug)]
pub struct OffHeap {
    len: usize,
    mmap: MmapMut,
}

impl Memory for OffHeap {
    fn alloc(len: usize) -> Result<Self, RingError> {
        if len == 0 {
            return Err(RingError::InvalidCapacity);
        }

        // Map whole pages, the tail of the last page stays unused.
        let page = page_size::get();
        let mapped = len
            .checked_next_multiple_of(page)
            .filter(|mapped| *mapped <= isize::MAX as usize)
            .ok_or(RingError::InvalidCapacity)?;

        let mmap = MmapOptions::new()
            .len(mapped)
            // Fault all pages so that they are eagerly initialized.
            .populate()
            // Map with anonymous memory map for off-heap memory.
            .map_anon()?;

        Ok(Self { len, mmap })
    }
}

impl AsRef<[u8]> for OffHeap {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.mmap[..self.len]
    }
}

impl AsMut<[u8]> for OffHeap {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..self.len]
    }
}
