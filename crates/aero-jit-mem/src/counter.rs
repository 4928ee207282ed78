//! Leased counter slots for JIT instrumentation.

use core::ptr::NonNull;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::warn;

use crate::alloc::{Allocator, NativeAllocator};
use crate::entry_table::EntryTable;
use crate::Result;

mod sealed {
    pub trait Sealed {}
}

/// Numeric types a [`Counter`] may hold.
pub trait CounterValue: Pod + sealed::Sealed {
    /// `self + 1`, wrapping on overflow.
    fn incremented(self) -> Self;
}

macro_rules! int_counter_value {
    ($($ty:ty),*) => {$(
        impl sealed::Sealed for $ty {}
        impl CounterValue for $ty {
            #[inline]
            fn incremented(self) -> Self {
                self.wrapping_add(1)
            }
        }
    )*};
}

macro_rules! float_counter_value {
    ($($ty:ty),*) => {$(
        impl sealed::Sealed for $ty {}
        impl CounterValue for $ty {
            #[inline]
            fn incremented(self) -> Self {
                self + 1.0
            }
        }
    )*};
}

int_counter_value!(u8, i8, u16, i16, u32, i32, u64, i64);
float_counter_value!(f32, f64);

/// One slot of a shared [`EntryTable`], released when the counter is dropped.
///
/// Generated code typically increments the slot through the address from
/// [`Counter::value`]. The table may be disposed before its counters (e.g. when a translator is
/// torn down); releasing a counter afterwards is silently accepted.
pub struct Counter<T: CounterValue, A: Allocator + Clone = NativeAllocator> {
    table: Arc<EntryTable<T, A>>,
    index: usize,
    released: bool,
}

impl<T: CounterValue, A: Allocator + Clone> Counter<T, A> {
    pub fn new(table: &Arc<EntryTable<T, A>>) -> Result<Self> {
        let index = table.allocate()?;
        Ok(Self {
            table: Arc::clone(table),
            index,
            released: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Stable address of the counter slot, suitable for embedding in generated code.
    pub fn value(&self) -> Result<NonNull<T>> {
        self.table.get_value(self.index)
    }

    pub fn get(&self) -> Result<T> {
        self.table.read(self.index)
    }

    pub fn set(&self, value: T) -> Result<()> {
        self.table.write(self.index, value)
    }

    /// Adds one to the counter, returning the previous value.
    pub fn increment(&self) -> Result<T> {
        self.table.update(self.index, CounterValue::incremented)
    }

    fn release(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        match self.table.free(self.index) {
            Err(err) if err.is_disposed() => Ok(()),
            other => other,
        }
    }

    /// Returns the slot to the table.
    pub fn dispose(mut self) -> Result<()> {
        self.release()
    }
}

impl<T: CounterValue, A: Allocator + Clone> Drop for Counter<T, A> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(index = self.index, "failed to release counter slot: {err}");
        }
    }
}

impl<T: CounterValue + core::fmt::Debug, A: Allocator + Clone> core::fmt::Debug for Counter<T, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Counter")
            .field("index", &self.index)
            .field("value", &self.get().ok())
            .finish()
    }
}
