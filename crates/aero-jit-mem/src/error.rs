use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the JIT memory substrate.
///
/// Variants fall into three classes: usage errors (bad arguments, see
/// [`Error::is_invalid_argument`]), lifecycle errors (an operation on a table that was already
/// torn down) and resource exhaustion from the backing allocator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("address table needs at least 2 levels, got {count}")]
    TooFewLevels { count: usize },

    #[error("invalid address table level: index={index} length={length}")]
    InvalidLevel { index: u32, length: u32 },

    #[error("address table levels overlap (mask=0x{mask:x})")]
    OverlappingLevels { mask: u64 },

    #[error("page size {page_size} cannot hold an entry of {entry_size} bytes")]
    InvalidPageSize { page_size: usize, entry_size: usize },

    #[error("arena page size must be non-zero")]
    ZeroArenaPageSize,

    #[error("entry type must not be zero-sized")]
    ZeroSizedEntry,

    #[error("entry alignment {align} exceeds the allocator alignment")]
    UnsupportedAlignment { align: usize },

    #[error("address 0x{address:x} is outside the table mask 0x{mask:x}")]
    AddressOutOfRange { address: u64, mask: u64 },

    #[error("entry {index} is not allocated")]
    EntryNotAllocated { index: usize },

    #[error("{object} has been disposed")]
    Disposed { object: &'static str },

    /// The backing allocator could not satisfy a request of `size` bytes.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
}

impl Error {
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Error::TooFewLevels { .. }
                | Error::InvalidLevel { .. }
                | Error::OverlappingLevels { .. }
                | Error::InvalidPageSize { .. }
                | Error::ZeroArenaPageSize
                | Error::ZeroSizedEntry
                | Error::UnsupportedAlignment { .. }
                | Error::AddressOutOfRange { .. }
                | Error::EntryNotAllocated { .. }
        )
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::Disposed { .. })
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
