//! Paged table of fixed-size records with permanently stable addresses.
//!
//! Generated code embeds the address of an entry (for example a call counter) as an immediate
//! operand, so entries can never move: the table grows by adding pages, never by reallocating
//! them.

use core::marker::PhantomData;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytemuck::Pod;
use tracing::debug;

use crate::alloc::{Allocator, NativeAllocator, PagePtr, MIN_ALIGN};
use crate::bitmap::BitMap;
use crate::{Error, Result};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

struct State<A: Allocator> {
    pages: HashMap<usize, PagePtr>,
    allocated: Option<BitMap<A>>,
    free_hint: usize,
}

/// A table of `T` slots identified by index.
///
/// Slot addresses are stable until [`EntryTable::dispose`] (or drop). All operations take the
/// table lock, so the table can be shared between compiler threads behind an `Arc`.
pub struct EntryTable<T: Pod, A: Allocator + Clone = NativeAllocator> {
    allocator: A,
    page_capacity: usize,
    state: Mutex<State<A>>,
    _entries: PhantomData<T>,
}

impl<T: Pod> EntryTable<T> {
    pub fn new() -> Result<Self> {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Result<Self> {
        Self::with_page_size_in(page_size, NativeAllocator)
    }
}

impl<T: Pod, A: Allocator + Clone> EntryTable<T, A> {
    /// Creates a table whose pages hold as many entries as fit in `page_size` bytes, rounded
    /// down to a power of two.
    pub fn with_page_size_in(page_size: usize, allocator: A) -> Result<Self> {
        let entry_size = core::mem::size_of::<T>();
        if entry_size == 0 {
            return Err(Error::ZeroSizedEntry);
        }
        if core::mem::align_of::<T>() > MIN_ALIGN {
            return Err(Error::UnsupportedAlignment {
                align: core::mem::align_of::<T>(),
            });
        }
        let fits = page_size / entry_size;
        if fits == 0 {
            return Err(Error::InvalidPageSize {
                page_size,
                entry_size,
            });
        }
        let page_capacity = 1usize << fits.ilog2();

        Ok(Self {
            state: Mutex::new(State {
                pages: HashMap::new(),
                allocated: Some(BitMap::new_in(allocator.clone())),
                free_hint: 0,
            }),
            allocator,
            page_capacity,
            _entries: PhantomData,
        })
    }

    /// Entries per page.
    pub fn page_capacity(&self) -> usize {
        self.page_capacity
    }

    pub fn page_count(&self) -> usize {
        self.lock().pages.len()
    }

    // `update` runs caller code under the lock. A panic there leaves the slot untouched and
    // every other piece of state consistent, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, State<A>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_ptr(&self, state: &State<A>, index: usize) -> Option<NonNull<T>> {
        let page = state.pages.get(&(index / self.page_capacity))?;
        // Safety: every page holds `page_capacity` entries and the offset is below that.
        Some(unsafe {
            NonNull::new_unchecked(
                page.0
                    .as_ptr()
                    .cast::<T>()
                    .add(index % self.page_capacity),
            )
        })
    }

    /// Reserves a slot, zeroes it and returns its index.
    pub fn allocate(&self) -> Result<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let allocated = state.allocated.as_mut().ok_or(Error::Disposed {
            object: "EntryTable",
        })?;

        if allocated.is_set(state.free_hint) {
            state.free_hint = allocated.find_first_unset();
        }
        let index = state.free_hint;

        let page_index = index / self.page_capacity;
        if !state.pages.contains_key(&page_index) {
            let bytes = self.page_capacity * core::mem::size_of::<T>();
            let page = self.allocator.allocate(bytes)?;
            state.pages.insert(page_index, PagePtr(page));
        }

        allocated.set(index)?;
        state.free_hint = index + 1;

        let entry = self
            .entry_ptr(state, index)
            .ok_or(Error::EntryNotAllocated { index })?;
        // Safety: the page was allocated above and the slot is now reserved for the caller.
        unsafe { entry.as_ptr().write(T::zeroed()) };
        Ok(index)
    }

    /// Releases a slot. Freeing a slot that is not allocated is a no-op.
    pub fn free(&self, index: usize) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let allocated = state.allocated.as_mut().ok_or(Error::Disposed {
            object: "EntryTable",
        })?;

        if allocated.is_set(index) {
            allocated.clear(index)?;
            state.free_hint = index;
        }
        Ok(())
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        self.lock()
            .allocated
            .as_ref()
            .is_some_and(|allocated| allocated.is_set(index))
    }

    /// Stable address of an allocated slot.
    ///
    /// The pointer stays valid until the slot is freed or the table is disposed; later pages
    /// never move it. Dereferencing it is the caller's responsibility.
    pub fn get_value(&self, index: usize) -> Result<NonNull<T>> {
        let state = self.lock();
        self.allocated_entry(&state, index)
    }

    fn allocated_entry(&self, state: &State<A>, index: usize) -> Result<NonNull<T>> {
        let allocated = state.allocated.as_ref().ok_or(Error::Disposed {
            object: "EntryTable",
        })?;
        if !allocated.is_set(index) {
            return Err(Error::EntryNotAllocated { index });
        }
        self.entry_ptr(state, index)
            .ok_or(Error::EntryNotAllocated { index })
    }

    /// Reads a slot under the table lock.
    pub fn read(&self, index: usize) -> Result<T> {
        let state = self.lock();
        let ptr = self.allocated_entry(&state, index)?;
        // Safety: the slot is allocated and its page outlives the guard. Generated code may
        // update it concurrently, hence the volatile access.
        Ok(unsafe { ptr.as_ptr().read_volatile() })
    }

    /// Writes a slot under the table lock.
    pub fn write(&self, index: usize, value: T) -> Result<()> {
        let state = self.lock();
        let ptr = self.allocated_entry(&state, index)?;
        // Safety: see `read`.
        unsafe { ptr.as_ptr().write_volatile(value) };
        Ok(())
    }

    /// Replaces a slot with `f(old)` under the table lock, returning `old`.
    ///
    /// If `f` panics the slot keeps its old value and the table stays usable.
    pub fn update(&self, index: usize, f: impl FnOnce(T) -> T) -> Result<T> {
        let state = self.lock();
        let ptr = self.allocated_entry(&state, index)?;
        // Safety: see `read`.
        let old = unsafe { ptr.as_ptr().read_volatile() };
        let new = f(old);
        // Safety: see `read`.
        unsafe { ptr.as_ptr().write_volatile(new) };
        Ok(old)
    }

    /// Frees every page and the slot map. Later operations fail with [`Error::Disposed`].
    pub fn dispose(&self) {
        Self::release(&self.allocator, &mut self.lock());
    }

    fn release(allocator: &A, state: &mut State<A>) {
        let Some(allocated) = state.allocated.take() else {
            return;
        };
        allocated.dispose();

        let pages = state.pages.len();
        for (_, page) in state.pages.drain() {
            // Safety: pages were allocated by the table's allocator and are only freed here, once.
            unsafe { allocator.free(page.0) };
        }
        debug!(pages, "entry table disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().allocated.is_none()
    }
}

impl<T: Pod, A: Allocator + Clone> Drop for EntryTable<T, A> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        Self::release(&self.allocator, state);
    }
}

impl<T: Pod, A: Allocator + Clone> core::fmt::Debug for EntryTable<T, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntryTable")
            .field("page_capacity", &self.page_capacity)
            .finish_non_exhaustive()
    }
}
