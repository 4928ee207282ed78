//! Page allocation telemetry for [`crate::AddressTable`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Hook invoked on every address table page allocation.
///
/// Implementations must be cheap and must not call back into the table: the hook runs while
/// the table lock is held.
pub trait PageAllocationObserver: Send + Sync {
    fn page_allocated(&self, bytes: usize, leaf: bool);
}

/// Atomic page allocation counters.
#[derive(Debug, Default)]
pub struct PageAllocationMetrics {
    leaf_pages: AtomicU64,
    leaf_bytes: AtomicU64,
    intermediate_pages: AtomicU64,
    intermediate_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageAllocationTotals {
    pub leaf_pages: u64,
    pub leaf_bytes: u64,
    pub intermediate_pages: u64,
    pub intermediate_bytes: u64,
}

impl PageAllocationTotals {
    pub fn total_bytes(&self) -> u64 {
        self.leaf_bytes + self.intermediate_bytes
    }
}

impl PageAllocationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_totals(&self) -> PageAllocationTotals {
        PageAllocationTotals {
            leaf_pages: self.leaf_pages.load(Ordering::Relaxed),
            leaf_bytes: self.leaf_bytes.load(Ordering::Relaxed),
            intermediate_pages: self.intermediate_pages.load(Ordering::Relaxed),
            intermediate_bytes: self.intermediate_bytes.load(Ordering::Relaxed),
        }
    }
}

impl PageAllocationObserver for PageAllocationMetrics {
    fn page_allocated(&self, bytes: usize, leaf: bool) {
        let (pages, total) = if leaf {
            (&self.leaf_pages, &self.leaf_bytes)
        } else {
            (&self.intermediate_pages, &self.intermediate_bytes)
        };
        pages.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
