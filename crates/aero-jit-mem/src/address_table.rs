//! Sparse multi-level table mapping guest addresses to entries.
//!
//! The table is a radix tree over selected bitfields ("levels") of a guest address. Every
//! level except the last is an array of pointers to the next level; the last level is an array
//! of entries. Pages are allocated the first time an address in their subtree is touched, so a
//! 48-bit guest address space costs only as much memory as the code that actually runs.
//!
//! Generated code dispatches through the table without calling back into Rust: it loads the
//! root from [`AddressTable::base`] and repeats the per-level shift/mask/load chain implemented by
//! [`walk_raw`]. Published pages are never moved or freed before the table is disposed, and
//! page pointers are published with release stores so such lock-free readers observe either
//! null ("not compiled yet") or a fully initialized page.

use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::alloc::{Allocator, NativeAllocator, PagePtr, MIN_ALIGN};
use crate::telemetry::PageAllocationObserver;
use crate::{Error, Result};

/// One radix digit of a guest address: `length` bits starting at bit `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Level {
    index: u32,
    length: u32,
}

impl Level {
    pub const fn new(index: u32, length: u32) -> Self {
        Self { index, length }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn length(self) -> u32 {
        self.length
    }

    /// Number of slots in a page of this level.
    pub const fn count(self) -> usize {
        1usize << self.length
    }

    pub const fn mask(self) -> u64 {
        if self.length == 0 || self.length > 64 || self.index >= 64 {
            return 0;
        }
        (u64::MAX >> (64 - self.length)) << self.index
    }

    #[inline]
    pub const fn digit(self, address: u64) -> usize {
        ((address & self.mask()) >> self.index) as usize
    }

    const fn is_well_formed(self) -> bool {
        self.length != 0 && self.length < usize::BITS && self.index <= 64 - self.length
    }
}

/// Level layout for 64-bit ARM guests: 48-bit virtual addresses, 4-byte instructions.
pub const LEVELS_64BIT: [Level; 5] = [
    Level::new(31, 17),
    Level::new(23, 8),
    Level::new(15, 8),
    Level::new(7, 8),
    Level::new(2, 5),
];

/// Level layout for 32-bit ARM guests: 2-byte (Thumb) instruction granularity.
pub const LEVELS_32BIT: [Level; 5] = [
    Level::new(31, 17),
    Level::new(23, 8),
    Level::new(15, 8),
    Level::new(7, 8),
    Level::new(1, 6),
];

/// Walks a table's pointer chain without locking, exactly as generated dispatch code does.
///
/// Returns `None` when a page on the path has not been published yet.
///
/// # Safety
/// `base` must be null or the root returned by [`AddressTable::base`] of a live
/// `AddressTable<T>` constructed with `levels`, and `address` must satisfy
/// [`AddressTable::is_valid`].
#[inline]
pub unsafe fn walk_raw<T: Copy>(base: *const u8, levels: &[Level], address: u64) -> Option<T> {
    let (leaf, walk) = levels.split_last()?;
    let mut page = base.cast_mut();
    for level in walk {
        if page.is_null() {
            return None;
        }
        // Safety: non-leaf pages are arrays of `level.count()` pointers and the digit is below
        // that count.
        let slot = unsafe { &*page.cast::<AtomicPtr<u8>>().add(level.digit(address)) };
        page = slot.load(Ordering::Acquire);
    }
    if page.is_null() {
        return None;
    }
    // Safety: leaf pages are arrays of `leaf.count()` initialized entries.
    Some(unsafe { page.cast::<T>().add(leaf.digit(address)).read_volatile() })
}

struct State<T> {
    fill: T,
    pages: Vec<PagePtr>,
    disposed: bool,
}

/// Sparse table of `T` entries indexed by guest address.
///
/// Entries of untouched subtrees read as the table's fill value (typically the address of the
/// "translate this function" stub).
pub struct AddressTable<T: Copy, A: Allocator = NativeAllocator> {
    levels: Box<[Level]>,
    mask: u64,
    allocator: A,
    observer: Option<Arc<dyn PageAllocationObserver>>,
    root: AtomicPtr<u8>,
    state: Mutex<State<T>>,
}

impl<T: Copy> AddressTable<T> {
    pub fn new(levels: &[Level], fill: T) -> Result<Self> {
        Self::new_in(levels, fill, NativeAllocator)
    }
}

impl<T: Copy, A: Allocator> AddressTable<T, A> {
    /// Creates a table over `levels` (most significant first) drawing pages from `allocator`.
    pub fn new_in(levels: &[Level], fill: T, allocator: A) -> Result<Self> {
        if levels.len() < 2 {
            return Err(Error::TooFewLevels {
                count: levels.len(),
            });
        }
        if core::mem::size_of::<T>() == 0 {
            return Err(Error::ZeroSizedEntry);
        }
        if core::mem::align_of::<T>() > MIN_ALIGN {
            return Err(Error::UnsupportedAlignment {
                align: core::mem::align_of::<T>(),
            });
        }

        let mut mask = 0u64;
        for (depth, &level) in levels.iter().enumerate() {
            let invalid = Error::InvalidLevel {
                index: level.index,
                length: level.length,
            };
            if !level.is_well_formed() {
                return Err(invalid);
            }
            let slot_size = if depth == levels.len() - 1 {
                core::mem::size_of::<T>()
            } else {
                core::mem::size_of::<AtomicPtr<u8>>()
            };
            if level.count().checked_mul(slot_size).is_none() {
                return Err(invalid);
            }
            if mask & level.mask() != 0 {
                return Err(Error::OverlappingLevels {
                    mask: mask | level.mask(),
                });
            }
            mask |= level.mask();
        }

        Ok(Self {
            levels: levels.into(),
            mask,
            allocator,
            observer: None,
            root: AtomicPtr::new(ptr::null_mut()),
            state: Mutex::new(State {
                fill,
                pages: Vec::new(),
                disposed: false,
            }),
        })
    }

    /// Reports every page allocation to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn PageAllocationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// OR of all level masks; the bits an address may have set.
    pub fn mask(&self) -> u64 {
        self.mask
    }

    #[inline]
    pub fn is_valid(&self, address: u64) -> bool {
        address & !self.mask == 0
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A panicking observer leaves the page tracked (it is freed on dispose) but unpublished.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fill(&self) -> T {
        self.lock().fill
    }

    /// Changes the value stamped into leaf pages created from now on. Existing pages keep
    /// their entries.
    pub fn set_fill(&self, fill: T) {
        self.lock().fill = fill;
    }

    /// Number of pages (root, intermediate and leaf) currently allocated.
    pub fn page_count(&self) -> usize {
        self.lock().pages.len()
    }

    fn allocate_page(&self, state: &mut State<T>, depth: usize) -> Result<NonNull<u8>> {
        let level = self.levels[depth];
        let leaf = depth == self.levels.len() - 1;
        let count = level.count();
        // Page sizes were overflow-checked at construction.
        let bytes = if leaf {
            count * core::mem::size_of::<T>()
        } else {
            count * core::mem::size_of::<AtomicPtr<u8>>()
        };

        let page = self.allocator.allocate(bytes)?;
        // Safety: `page` spans `bytes` bytes, suitably aligned for `T` and pointers.
        unsafe {
            if leaf {
                let entries = page.as_ptr().cast::<T>();
                for i in 0..count {
                    entries.add(i).write(state.fill);
                }
            } else {
                // All-zero is a null `AtomicPtr`.
                page.as_ptr().write_bytes(0, bytes);
            }
        }
        state.pages.push(PagePtr(page));

        trace!(bytes, leaf, depth, "address table page allocated");
        if let Some(observer) = &self.observer {
            observer.page_allocated(bytes, leaf);
        }
        Ok(page)
    }

    fn root_locked(&self, state: &mut State<T>) -> Result<NonNull<u8>> {
        if state.disposed {
            return Err(Error::Disposed {
                object: "AddressTable",
            });
        }
        if let Some(root) = NonNull::new(self.root.load(Ordering::Acquire)) {
            return Ok(root);
        }
        let root = self.allocate_page(state, 0)?;
        self.root.store(root.as_ptr(), Ordering::Release);
        Ok(root)
    }

    fn entry_locked(&self, state: &mut State<T>, address: u64) -> Result<NonNull<T>> {
        if !self.is_valid(address) {
            return Err(Error::AddressOutOfRange {
                address,
                mask: self.mask,
            });
        }

        let mut page = self.root_locked(state)?;
        let last = self.levels.len() - 1;
        for depth in 0..last {
            let digit = self.levels[depth].digit(address);
            // Safety: `page` is a live non-leaf page of `levels[depth].count()` pointers.
            let slot = unsafe { &*page.as_ptr().cast::<AtomicPtr<u8>>().add(digit) };
            page = match NonNull::new(slot.load(Ordering::Acquire)) {
                Some(next) => next,
                None => {
                    let next = self.allocate_page(state, depth + 1)?;
                    slot.store(next.as_ptr(), Ordering::Release);
                    next
                }
            };
        }

        let digit = self.levels[last].digit(address);
        // Safety: `page` is a live leaf page of `levels[last].count()` entries.
        Ok(unsafe { NonNull::new_unchecked(page.as_ptr().cast::<T>().add(digit)) })
    }

    /// Stable address of the entry for `address`, allocating missing pages on the way.
    ///
    /// The pointer stays valid until the table is disposed. Writes through it race with
    /// lock-free dispatch readers; entries should be updated with a single aligned store.
    pub fn get_value(&self, address: u64) -> Result<NonNull<T>> {
        let mut state = self.lock();
        self.entry_locked(&mut state, address)
    }

    pub fn read(&self, address: u64) -> Result<T> {
        let mut state = self.lock();
        let entry = self.entry_locked(&mut state, address)?;
        // Safety: the entry lives in a published page; volatile because generated code may
        // read it concurrently.
        Ok(unsafe { entry.as_ptr().read_volatile() })
    }

    pub fn write(&self, address: u64, value: T) -> Result<()> {
        let mut state = self.lock();
        let entry = self.entry_locked(&mut state, address)?;
        // Safety: see `read`.
        unsafe { entry.as_ptr().write_volatile(value) };
        Ok(())
    }

    /// Lock-free lookup following the same path as generated code.
    ///
    /// Returns `None` for invalid addresses and for addresses whose pages have not been
    /// published yet.
    #[inline]
    pub fn lookup(&self, address: u64) -> Option<T> {
        if !self.is_valid(address) {
            return None;
        }
        // Safety: the root is null or owned by this live table, built with `self.levels`.
        unsafe { walk_raw(self.root.load(Ordering::Acquire), &self.levels, address) }
    }

    /// Root page of the table, created on first use.
    ///
    /// Generated code embeds this pointer and walks the levels itself (see [`walk_raw`]). It
    /// remains valid until the table is disposed.
    pub fn base(&self) -> Result<NonNull<u8>> {
        let mut state = self.lock();
        self.root_locked(&mut state)
    }

    /// Frees every page. Idempotent; later lookups fail with [`Error::Disposed`].
    pub fn dispose(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.disposed {
            return;
        }
        state.disposed = true;
        self.root.store(ptr::null_mut(), Ordering::Release);

        let pages = state.pages.len();
        for page in state.pages.drain(..) {
            // Safety: every page was allocated by `self.allocator` and is tracked exactly once.
            unsafe { self.allocator.free(page.0) };
        }
        debug!(pages, "address table disposed");
    }
}

impl<T: Copy, A: Allocator> Drop for AddressTable<T, A> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: Copy, A: Allocator> core::fmt::Debug for AddressTable<T, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressTable")
            .field("levels", &self.levels)
            .field("mask", &format_args!("0x{:x}", self.mask))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mask_and_digit() {
        let level = Level::new(8, 8);
        assert_eq!(level.mask(), 0xFF00);
        assert_eq!(level.digit(0x00AA_BBCC), 0xBB);
        assert_eq!(level.count(), 256);
        assert_eq!(Level::new(0, 64).mask(), u64::MAX);
        assert_eq!(Level::new(63, 1).mask(), 1 << 63);
    }

    #[test]
    fn presets_cover_expected_bits() {
        let table = AddressTable::<u64>::new(&LEVELS_64BIT, 0).unwrap();
        assert_eq!(table.mask(), 0x0000_FFFF_FFFF_FFFC);
        let table = AddressTable::<u64>::new(&LEVELS_32BIT, 0).unwrap();
        assert_eq!(table.mask(), 0x0000_FFFF_FFFF_FFFE);
    }

    #[test]
    fn malformed_levels_are_rejected() {
        let err = AddressTable::<u64>::new(&[Level::new(0, 8)], 0).unwrap_err();
        assert_eq!(err, Error::TooFewLevels { count: 1 });

        let err = AddressTable::<u64>::new(&[Level::new(8, 0), Level::new(0, 8)], 0).unwrap_err();
        assert_eq!(err, Error::InvalidLevel { index: 8, length: 0 });

        let err =
            AddressTable::<u64>::new(&[Level::new(60, 8), Level::new(0, 8)], 0).unwrap_err();
        assert!(err.is_invalid_argument());

        let err = AddressTable::<u64>::new(&[Level::new(4, 8), Level::new(0, 8)], 0).unwrap_err();
        assert!(matches!(err, Error::OverlappingLevels { .. }));

        let err = AddressTable::<()>::new(&[Level::new(8, 8), Level::new(0, 8)], ()).unwrap_err();
        assert_eq!(err, Error::ZeroSizedEntry);
    }
}
