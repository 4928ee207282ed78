//! Native memory and address-translation substrate for the JIT.
//!
//! Generated code needs memory it can reach without calling back into Rust:
//! - [`AddressTable`] maps sparse guest addresses to entries (compiled block entry points)
//!   through a lazily populated radix tree whose root pointer is baked into emitted code.
//! - [`EntryTable`] and [`Counter`] hand out small records with permanently stable addresses
//!   (e.g. call counters incremented by generated code).
//!
//! Compilation itself allocates its short-lived data from an [`ArenaAllocator`], reset once per
//! compiled block. All tables draw their pages from an injectable [`Allocator`], by default the
//! host heap via [`NativeAllocator`].

pub mod address_table;
pub mod alloc;
pub mod bitmap;
pub mod clock;
pub mod counter;
pub mod entry_table;
mod error;
pub mod telemetry;

pub use address_table::{walk_raw, AddressTable, Level, LEVELS_32BIT, LEVELS_64BIT};
pub use alloc::{
    Allocator, ArenaAllocator, ArenaOptions, ArenaStats, CompilerArenas, NativeAllocator,
    MIN_ALIGN,
};
pub use bitmap::BitMap;
pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use counter::{Counter, CounterValue};
pub use entry_table::EntryTable;
pub use error::{Error, Result};
pub use telemetry::{PageAllocationMetrics, PageAllocationObserver, PageAllocationTotals};
