//! Growable bitset over 64-bit words.

use core::ptr::NonNull;

use crate::alloc::{allocate_array, Allocator, NativeAllocator};
use crate::Result;

const WORD_BITS: usize = u64::BITS as usize;

/// A growable set of bit indices whose words live in memory from an injected [`Allocator`].
///
/// Storage only ever grows. The map is not synchronized; owners that share it across threads
/// (e.g. [`crate::EntryTable`]) guard it with their own lock.
pub struct BitMap<A: Allocator = NativeAllocator> {
    allocator: A,
    words: Option<NonNull<u64>>,
    count: usize,
}

// Safety: the word array is exclusively owned by the map.
unsafe impl<A: Allocator + Send> Send for BitMap<A> {}
// Safety: `&BitMap` only reads the word array.
unsafe impl<A: Allocator + Sync> Sync for BitMap<A> {}

impl BitMap {
    pub fn new() -> Self {
        Self::new_in(NativeAllocator)
    }

    pub fn with_capacity(bits: usize) -> Result<Self> {
        Self::with_capacity_in(NativeAllocator, bits)
    }
}

impl Default for BitMap {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> BitMap<A> {
    pub fn new_in(allocator: A) -> Self {
        Self {
            allocator,
            words: None,
            count: 0,
        }
    }

    /// Creates a map with room for at least `bits` bits.
    pub fn with_capacity_in(allocator: A, bits: usize) -> Result<Self> {
        let mut map = Self::new_in(allocator);
        map.ensure_capacity(bits)?;
        Ok(map)
    }

    /// Number of bits currently backed by storage.
    pub fn capacity(&self) -> usize {
        self.count * WORD_BITS
    }

    pub fn is_empty(&self) -> bool {
        self.words().iter().all(|&w| w == 0)
    }

    #[inline]
    fn words(&self) -> &[u64] {
        match self.words {
            // Safety: `words` points at `count` initialized words owned by this map.
            Some(ptr) => unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.count) },
            None => &[],
        }
    }

    #[inline]
    fn words_mut(&mut self) -> &mut [u64] {
        match self.words {
            // Safety: as in `words`, plus `&mut self` gives exclusive access.
            Some(ptr) => unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), self.count) },
            None => &mut [],
        }
    }

    fn ensure_capacity(&mut self, bits: usize) -> Result<()> {
        let needed = bits.div_ceil(WORD_BITS);
        if needed <= self.count {
            return Ok(());
        }
        self.grow(needed.max(self.count * 2))
    }

    fn grow(&mut self, count: usize) -> Result<()> {
        let new = allocate_array::<u64, _>(&self.allocator, count)?;
        // Safety: `new` holds `count` words; the old contents (if any) are copied first and the
        // remainder zeroed, so every word is initialized.
        unsafe {
            let old = self.words();
            core::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old.len());
            core::ptr::write_bytes(new.as_ptr().add(old.len()), 0, count - old.len());
        }
        if let Some(old) = self.words.replace(new) {
            // Safety: allocated by `self.allocator` in a previous `grow`.
            unsafe { self.allocator.free(old.cast()) };
        }
        self.count = count;
        Ok(())
    }

    pub fn is_set(&self, bit: usize) -> bool {
        self.words()
            .get(bit / WORD_BITS)
            .is_some_and(|w| w & (1 << (bit % WORD_BITS)) != 0)
    }

    /// Sets `bit`, returning `true` if it was previously clear.
    pub fn set(&mut self, bit: usize) -> Result<bool> {
        self.ensure_capacity(bit.saturating_add(1))?;
        let word = &mut self.words_mut()[bit / WORD_BITS];
        let mask = 1u64 << (bit % WORD_BITS);
        let was_clear = *word & mask == 0;
        *word |= mask;
        Ok(was_clear)
    }

    pub fn clear(&mut self, bit: usize) -> Result<()> {
        self.ensure_capacity(bit.saturating_add(1))?;
        self.words_mut()[bit / WORD_BITS] &= !(1u64 << (bit % WORD_BITS));
        Ok(())
    }

    /// Clears every bit and ensures room for `bits` bits.
    pub fn reset(&mut self, bits: usize) -> Result<()> {
        self.words_mut().fill(0);
        self.ensure_capacity(bits)
    }

    /// Index of the lowest clear bit.
    ///
    /// Returns [`BitMap::capacity`] when every stored word is full; that index is not backed by
    /// storage until it is set.
    pub fn find_first_unset(&self) -> usize {
        self.words()
            .iter()
            .position(|&w| w != u64::MAX)
            .map_or(self.capacity(), |i| {
                i * WORD_BITS + (!self.words()[i]).trailing_zeros() as usize
            })
    }

    /// In-place union with `other`. Returns whether any bit changed.
    pub fn union_with<B: Allocator>(&mut self, other: &BitMap<B>) -> Result<bool> {
        self.ensure_capacity(other.capacity())?;
        let mut changed = false;
        for (dst, &src) in self.words_mut().iter_mut().zip(other.words()) {
            let merged = *dst | src;
            changed |= merged != *dst;
            *dst = merged;
        }
        Ok(changed)
    }

    /// In-place difference (`self & !other`). Returns whether any bit changed.
    pub fn difference_with<B: Allocator>(&mut self, other: &BitMap<B>) -> Result<bool> {
        self.ensure_capacity(other.capacity())?;
        let mut changed = false;
        for (dst, &src) in self.words_mut().iter_mut().zip(other.words()) {
            let kept = *dst & !src;
            changed |= kept != *dst;
            *dst = kept;
        }
        Ok(changed)
    }

    /// Set bits in ascending order.
    pub fn iter(&self) -> Iter<'_> {
        let words = self.words();
        Iter {
            words,
            index: 0,
            current: words.first().copied().unwrap_or(0),
        }
    }

    /// Releases the word array back to the allocator.
    pub fn dispose(self) {}
}

impl<A: Allocator> Drop for BitMap<A> {
    fn drop(&mut self) {
        if let Some(words) = self.words.take() {
            // Safety: allocated by `self.allocator` in `grow`; freed exactly once.
            unsafe { self.allocator.free(words.cast()) };
        }
        self.count = 0;
    }
}

impl<A: Allocator> core::fmt::Debug for BitMap<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a, A: Allocator> IntoIterator for &'a BitMap<A> {
    type Item = usize;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

/// Ascending iterator over the set bits of a [`BitMap`].
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    words: &'a [u64],
    index: usize,
    current: u64,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.current == 0 {
            self.index += 1;
            self.current = *self.words.get(self.index)?;
        }
        let bit = self.current.trailing_zeros() as usize;
        // Peel the lowest set bit.
        self.current &= self.current - 1;
        Some(self.index * WORD_BITS + bit)
    }
}
