//! Raw memory sources for the JIT tables.
//!
//! Every table in this crate takes its backing pages from an [`Allocator`]. The default is the
//! process-wide [`NativeAllocator`]; compiler passes use an [`ArenaAllocator`] for data that only
//! lives as long as one compiled block. Tests substitute counting or failing allocators.

mod arena;
mod arenas;
mod native;

use core::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use crate::Result;

pub use arena::{ArenaAllocator, ArenaOptions, ArenaStats};
pub use arenas::CompilerArenas;
pub use native::NativeAllocator;

/// Alignment guaranteed for every pointer returned by an [`Allocator`] in this crate.
///
/// This is at least the native pointer width on all supported targets (including wasm32, where
/// `u64` entries still need 8-byte alignment).
pub const MIN_ALIGN: usize = 8;

/// Source of raw, untyped memory blocks.
pub trait Allocator {
    /// Allocates `size` bytes aligned to [`MIN_ALIGN`].
    ///
    /// Fails with [`crate::Error::OutOfMemory`] if the request cannot be satisfied. Callers must
    /// not retry.
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Releases a block previously returned by [`Allocator::allocate`].
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this same allocator and must not have been freed
    /// already. No references into the block may be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>);
}

/// A raw page owned by one of the tables.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PagePtr(pub(crate) NonNull<u8>);

// Safety: pages are plain memory exclusively owned by their table, which serializes structural
// access under its own lock.
unsafe impl Send for PagePtr {}

/// Allocates an uninitialized array of `count` elements of `T`.
pub(crate) fn allocate_array<T, A: Allocator + ?Sized>(
    allocator: &A,
    count: usize,
) -> Result<NonNull<T>> {
    debug_assert!(core::mem::align_of::<T>() <= MIN_ALIGN);
    let size = count
        .checked_mul(core::mem::size_of::<T>())
        .ok_or(crate::Error::OutOfMemory { size: usize::MAX })?;
    Ok(allocator.allocate(size)?.cast())
}

impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        <A as Allocator>::allocate(&**self, size)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: forwarded caller contract.
        unsafe { <A as Allocator>::free(&**self, ptr) }
    }
}

impl<A: Allocator + ?Sized> Allocator for Arc<A> {
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        <A as Allocator>::allocate(&**self, size)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: forwarded caller contract.
        unsafe { <A as Allocator>::free(&**self, ptr) }
    }
}

impl<A: Allocator + ?Sized> Allocator for Rc<A> {
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        <A as Allocator>::allocate(&**self, size)
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: forwarded caller contract.
        unsafe { <A as Allocator>::free(&**self, ptr) }
    }
}
