use core::ptr::NonNull;
use std::alloc::{alloc, dealloc, Layout};

use super::{Allocator, MIN_ALIGN};
use crate::{Error, Result};

/// Size prefix stored in front of every block so `free` can rebuild the [`Layout`].
const HEADER: usize = MIN_ALIGN;

/// Thin wrapper over the host heap.
///
/// Stateless and zero-sized: every copy refers to the same process heap, so there is nothing to
/// tear down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NativeAllocator;

impl NativeAllocator {
    #[inline]
    fn layout(size: usize) -> Result<Layout> {
        let total = size
            .checked_add(HEADER)
            .ok_or(Error::OutOfMemory { size })?;
        Layout::from_size_align(total, MIN_ALIGN).map_err(|_| Error::OutOfMemory { size })
    }
}

impl Allocator for NativeAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Self::layout(size)?;
        // Safety: `layout` always has a non-zero size (it includes the header).
        let base = NonNull::new(unsafe { alloc(layout) }).ok_or(Error::OutOfMemory { size })?;
        // Safety: the block is at least `HEADER` bytes and `MIN_ALIGN`-aligned, which satisfies
        // `usize` alignment.
        unsafe {
            base.as_ptr().cast::<usize>().write(size);
            Ok(NonNull::new_unchecked(base.as_ptr().add(HEADER)))
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: caller guarantees `ptr` came from `allocate`, so the header precedes it and
        // holds the size used to build the original layout.
        unsafe {
            let base = ptr.as_ptr().sub(HEADER);
            let size = base.cast::<usize>().read();
            let layout = Layout::from_size_align_unchecked(size + HEADER, MIN_ALIGN);
            dealloc(base, layout);
        }
    }
}
