//! Host time sources used by the arena decay policy.
//!
//! Production code reads a monotonic host clock; unit tests drive the arena deterministically
//! through [`FakeHostClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic host time in nanoseconds.
pub trait HostClock {
    fn now_ns(&self) -> u64;
}

impl<C: HostClock + ?Sized> HostClock for &C {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

impl<C: HostClock + ?Sized> HostClock for Arc<C> {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// [`HostClock`] backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        // Saturates after ~584 years of uptime.
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for tests.
///
/// Clones share the same time value, so a test can keep one handle while the arena owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeHostClock {
    now_ns: Arc<AtomicU64>,
}

impl FakeHostClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let ns = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let mut cur = self.now_ns.load(Ordering::Relaxed);
        while let Err(actual) = self.now_ns.compare_exchange_weak(
            cur,
            cur.saturating_add(ns),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            cur = actual;
        }
    }

    pub fn set_ns(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::Relaxed);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }
}
