use core::cell::RefCell;
use core::ptr::NonNull;

use serde::Serialize;
use tracing::{debug, trace};

use super::{Allocator, NativeAllocator, MIN_ALIGN};
use crate::clock::{HostClock, StdHostClock};
use crate::{Error, Result};

/// Configuration for an [`ArenaAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaOptions {
    /// Size of each pooled page in bytes. Requests larger than this bypass the pool.
    pub page_size: usize,
    /// Minimum number of pages kept pooled across resets. Pages beyond this count are subject
    /// to decay.
    pub page_count: usize,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            page_count: 8,
        }
    }
}

/// Point-in-time view of an arena's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    pub page_size: usize,
    pub page_count: usize,
    pub pooled_pages: usize,
    pub extra_blocks: usize,
}

#[derive(Debug)]
struct ArenaPage {
    ptr: NonNull<u8>,
    /// Set by every reset, cleared when an allocation moves into the page.
    unused: bool,
    /// Consecutive resets during which the page stayed unused.
    unused_counter: u32,
}

#[derive(Debug)]
struct ArenaState {
    /// Index of the page currently bumped into, `None` right after a reset.
    page: Option<usize>,
    offset: usize,
    pages: Vec<ArenaPage>,
    /// Oversized blocks, freed unconditionally on the next reset.
    extras: Vec<NonNull<u8>>,
    last_reset_ns: u64,
}

/// Number of consecutive unused resets after which a surplus page is released, given the
/// time since the previous reset.
///
/// Frequent resets mean the arena is busy compiling and keeps its pages for a long time;
/// once resets become rare the pool is trimmed aggressively.
pub(crate) fn decay_threshold(elapsed_ms: u64) -> u32 {
    match elapsed_ms {
        0..=9 => 5000,
        10..=999 => 1500,
        1000..=2499 => 100,
        2500..=4999 => 50,
        _ => 0,
    }
}

#[inline]
fn round_up(size: usize) -> Result<usize> {
    size.checked_add(MIN_ALIGN - 1)
        .map(|s| s & !(MIN_ALIGN - 1))
        .ok_or(Error::OutOfMemory { size })
}

/// Bump allocator over pooled fixed-size pages.
///
/// Individual blocks are never freed; [`ArenaAllocator::reset`] discards everything handed out
/// since the previous reset. It is intended to be called once per compiled block. Pages are
/// pooled across resets and only returned to the backing allocator by the decay policy or when
/// the arena is dropped.
///
/// The arena is not synchronized (`!Sync`); compiler workers each own one.
pub struct ArenaAllocator<A: Allocator = NativeAllocator, C: HostClock = StdHostClock> {
    page_size: usize,
    /// Bytes actually reserved per pooled page: `page_size` rounded up to [`MIN_ALIGN`], so any
    /// request of at most `page_size` bytes still fits once rounded.
    page_bytes: usize,
    page_count: usize,
    allocator: A,
    clock: C,
    state: RefCell<ArenaState>,
}

// Safety: the arena exclusively owns every page it tracks; moving it to another thread moves
// that ownership along with it. `RefCell` keeps it `!Sync`.
unsafe impl<A: Allocator + Send, C: HostClock + Send> Send for ArenaAllocator<A, C> {}

impl ArenaAllocator {
    pub fn new(page_size: usize, page_count: usize) -> Result<Self> {
        Self::with_options(ArenaOptions {
            page_size,
            page_count,
        })
    }

    pub fn with_options(options: ArenaOptions) -> Result<Self> {
        Self::with_parts(options, NativeAllocator, StdHostClock::new())
    }
}

impl<A: Allocator, C: HostClock> ArenaAllocator<A, C> {
    /// Creates an arena drawing pages from `allocator` and timing resets with `clock`.
    pub fn with_parts(options: ArenaOptions, allocator: A, clock: C) -> Result<Self> {
        if options.page_size == 0 {
            return Err(Error::ZeroArenaPageSize);
        }
        let page_bytes = round_up(options.page_size)?;

        let last_reset_ns = clock.now_ns();
        Ok(Self {
            page_size: options.page_size,
            page_bytes,
            page_count: options.page_count,
            allocator,
            clock,
            state: RefCell::new(ArenaState {
                page: None,
                offset: 0,
                pages: Vec::with_capacity(options.page_count),
                extras: Vec::new(),
                last_reset_ns,
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn stats(&self) -> ArenaStats {
        let state = self.state.borrow();
        ArenaStats {
            page_size: self.page_size,
            page_count: self.page_count,
            pooled_pages: state.pages.len(),
            extra_blocks: state.extras.len(),
        }
    }

    fn allocate_extra(&self, state: &mut ArenaState, size: usize) -> Result<NonNull<u8>> {
        let block = self.allocator.allocate(size)?;
        trace!(size, "arena extra block");
        state.extras.push(block);
        Ok(block)
    }

    fn allocate_slow(&self, state: &mut ArenaState, size: usize) -> Result<NonNull<u8>> {
        let next = state.page.map_or(0, |page| page + 1);
        if let Some(page) = state.pages.get_mut(next) {
            page.unused = false;
        } else {
            let ptr = self.allocator.allocate(self.page_bytes)?;
            state.pages.push(ArenaPage {
                ptr,
                unused: false,
                unused_counter: 0,
            });
        }

        state.page = Some(next);
        state.offset = size;
        Ok(state.pages[next].ptr)
    }

    /// Discards every allocation made since the previous reset and applies the pool decay
    /// policy.
    ///
    /// Taking `&mut self` guarantees nothing borrowing the arena survives the reset.
    pub fn reset(&mut self) {
        let now_ns = self.clock.now_ns();
        let state = self.state.get_mut();

        state.page = None;
        state.offset = 0;

        for block in state.extras.drain(..) {
            // Safety: extras were allocated by `self.allocator` and are only freed here.
            unsafe { self.allocator.free(block) };
        }

        let elapsed_ms = now_ns.saturating_sub(state.last_reset_ns) / 1_000_000;
        let threshold = decay_threshold(elapsed_ms);

        for page in &mut state.pages {
            if page.unused {
                page.unused_counter = page.unused_counter.saturating_add(1);
            } else {
                page.unused_counter = 0;
            }
            page.unused = true;
        }

        // Surplus pages go from the tail so the hot pages at the front survive.
        let mut freed = 0usize;
        while state.pages.len() > self.page_count {
            let Some(last) = state.pages.last() else {
                break;
            };
            if last.unused_counter < threshold {
                break;
            }
            let ptr = last.ptr;
            state.pages.pop();
            // Safety: pooled pages were allocated by `self.allocator`; the page was just removed
            // from the pool so it cannot be handed out again.
            unsafe { self.allocator.free(ptr) };
            freed += 1;
        }

        if freed != 0 {
            debug!(
                freed,
                threshold,
                elapsed_ms,
                pooled = state.pages.len(),
                "arena released idle pages"
            );
        }

        state.last_reset_ns = now_ns;
    }
}

impl<A: Allocator, C: HostClock> Allocator for ArenaAllocator<A, C> {
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let mut state = self.state.borrow_mut();
        if size > self.page_size {
            return self.allocate_extra(&mut state, size);
        }
        // At most `page_bytes` after rounding.
        let size = round_up(size)?;

        if let Some(page) = state.page {
            // `offset <= page_bytes` always holds, so the subtraction cannot underflow.
            if size <= self.page_bytes - state.offset {
                let offset = state.offset;
                state.offset += size;
                // Safety: `offset + size <= page_bytes`, so the result stays inside the page.
                return Ok(unsafe {
                    NonNull::new_unchecked(state.pages[page].ptr.as_ptr().add(offset))
                });
            }
        }

        self.allocate_slow(&mut state, size)
    }

    #[inline]
    unsafe fn free(&self, _ptr: NonNull<u8>) {}
}

impl<A: Allocator, C: HostClock> Drop for ArenaAllocator<A, C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for block in state.extras.drain(..) {
            // Safety: owned by this arena, freed exactly once.
            unsafe { self.allocator.free(block) };
        }
        for page in state.pages.drain(..) {
            // Safety: owned by this arena, freed exactly once.
            unsafe { self.allocator.free(page.ptr) };
        }
    }
}

impl<A: Allocator, C: HostClock> core::fmt::Debug for ArenaAllocator<A, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
