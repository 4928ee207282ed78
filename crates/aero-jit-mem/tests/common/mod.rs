#![allow(dead_code)]

use aero_jit_mem::{Allocator, Error, NativeAllocator, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Forwards to the host heap while tracking live blocks, optionally failing after a budget of
/// successful allocations.
#[derive(Debug, Clone, Default)]
pub struct CountingAllocator {
    live: Arc<AtomicUsize>,
    allocations: Arc<AtomicUsize>,
    frees: Arc<AtomicUsize>,
    budget: Option<usize>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every allocation after the first `budget` ones.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            ..Self::default()
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if let Some(budget) = self.budget {
            if self.allocations.load(Ordering::SeqCst) >= budget {
                return Err(Error::OutOfMemory { size });
            }
        }
        let ptr = NativeAllocator.allocate(size)?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        unsafe { NativeAllocator.free(ptr) };
    }
}
