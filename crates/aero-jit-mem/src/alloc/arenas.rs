use std::cell::RefCell;

use super::{ArenaAllocator, ArenaOptions};
use crate::Result;

const GENERAL: ArenaOptions = ArenaOptions {
    page_size: 256 * 1024,
    page_count: 4,
};

const IR: ArenaOptions = ArenaOptions {
    page_size: 64 * 1024,
    page_count: 8,
};

/// The arenas one compiler thread allocates its per-block data from.
///
/// Each kind of IR object gets its own arena so pools are sized for their own allocation
/// pattern. [`CompilerArenas::reset_all`] is called once a block has been emitted.
#[derive(Debug)]
pub struct CompilerArenas {
    pub general: ArenaAllocator,
    pub operands: ArenaAllocator,
    pub operations: ArenaAllocator,
    pub references: ArenaAllocator,
    pub live_ranges: ArenaAllocator,
    pub live_intervals: ArenaAllocator,
}

thread_local! {
    static CURRENT: RefCell<Option<CompilerArenas>> = const { RefCell::new(None) };
}

impl CompilerArenas {
    pub fn new() -> Result<Self> {
        Ok(Self {
            general: ArenaAllocator::with_options(GENERAL)?,
            operands: ArenaAllocator::with_options(IR)?,
            operations: ArenaAllocator::with_options(IR)?,
            references: ArenaAllocator::with_options(IR)?,
            live_ranges: ArenaAllocator::with_options(IR)?,
            live_intervals: ArenaAllocator::with_options(IR)?,
        })
    }

    pub fn reset_all(&mut self) {
        self.general.reset();
        self.operands.reset();
        self.operations.reset();
        self.references.reset();
        self.live_ranges.reset();
        self.live_intervals.reset();
    }

    /// Runs `f` with the calling thread's arenas, creating them on first use.
    ///
    /// Re-entrant calls from inside `f` panic.
    pub fn with_current<R>(f: impl FnOnce(&mut CompilerArenas) -> R) -> Result<R> {
        CURRENT.with(|cell| {
            let mut slot = cell.borrow_mut();
            let arenas = match &mut *slot {
                Some(arenas) => arenas,
                empty => empty.insert(CompilerArenas::new()?),
            };
            Ok(f(arenas))
        })
    }
}
