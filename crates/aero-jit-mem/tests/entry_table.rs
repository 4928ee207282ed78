mod common;

use aero_jit_mem::{EntryTable, Error};
use common::CountingAllocator;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

#[test]
fn allocations_span_pages_and_reuse_freed_slots() {
    let table = EntryTable::<i32>::with_page_size(64).unwrap();
    assert_eq!(table.page_capacity(), 16);

    let indices: Vec<usize> = (0..20).map(|_| table.allocate().unwrap()).collect();
    let distinct: HashSet<_> = indices.iter().copied().collect();
    assert_eq!(distinct.len(), 20);
    assert_eq!(table.page_count(), 2);
    for &index in &indices {
        assert_eq!(table.read(index).unwrap(), 0);
        assert_eq!(unsafe { *table.get_value(index).unwrap().as_ptr() }, 0);
    }

    table.free(3).unwrap();
    assert!(!table.is_allocated(3));
    assert_eq!(table.allocate().unwrap(), 3);
    assert_eq!(table.page_count(), 2);
}

#[test]
fn reused_slots_are_zeroed() {
    let table = EntryTable::<u64>::new().unwrap();
    let index = table.allocate().unwrap();
    table.write(index, 0xFFFF).unwrap();
    table.free(index).unwrap();

    assert_eq!(table.allocate().unwrap(), index);
    assert_eq!(table.read(index).unwrap(), 0);
}

#[test]
fn page_capacity_rounds_down_to_a_power_of_two() {
    let table = EntryTable::<u32>::with_page_size(100).unwrap();
    assert_eq!(table.page_capacity(), 16, "25 entries fit, 16 are used");

    let table = EntryTable::<u64>::new().unwrap();
    assert_eq!(table.page_capacity(), 512);
}

#[test]
fn invalid_geometry_is_rejected() {
    assert_eq!(
        EntryTable::<u64>::with_page_size(4).unwrap_err(),
        Error::InvalidPageSize {
            page_size: 4,
            entry_size: 8
        }
    );
    assert!(EntryTable::<u32>::with_page_size(0)
        .unwrap_err()
        .is_invalid_argument());
    assert_eq!(EntryTable::<()>::new().unwrap_err(), Error::ZeroSizedEntry);
}

#[test]
fn unallocated_slots_cannot_be_accessed() {
    let table = EntryTable::<u32>::new().unwrap();
    assert_eq!(
        table.get_value(0).unwrap_err(),
        Error::EntryNotAllocated { index: 0 }
    );

    let index = table.allocate().unwrap();
    table.free(index).unwrap();
    assert!(table.get_value(index).is_err());
    assert!(table.read(index).is_err());
    assert!(table.write(index, 1).is_err());
}

#[test]
fn double_free_is_tolerated() {
    let table = EntryTable::<u32>::new().unwrap();
    let a = table.allocate().unwrap();
    let b = table.allocate().unwrap();
    table.free(a).unwrap();
    table.free(a).unwrap();
    table.free(10_000).unwrap();

    assert!(table.is_allocated(b));
    assert_eq!(table.allocate().unwrap(), a);
}

#[test]
fn addresses_are_stable_across_growth() {
    let table = EntryTable::<u32>::with_page_size(64).unwrap();
    let first = table.allocate().unwrap();
    let ptr = table.get_value(first).unwrap();
    unsafe { *ptr.as_ptr() = 99 };

    for _ in 0..500 {
        table.allocate().unwrap();
    }
    assert!(table.page_count() > 30);
    assert_eq!(table.get_value(first).unwrap(), ptr);
    assert_eq!(table.read(first).unwrap(), 99);
}

#[test]
fn update_returns_previous_value() {
    let table = EntryTable::<u32>::new().unwrap();
    let index = table.allocate().unwrap();
    assert_eq!(table.update(index, |v| v + 5).unwrap(), 0);
    assert_eq!(table.update(index, |v| v * 2).unwrap(), 5);
    assert_eq!(table.read(index).unwrap(), 10);
}

#[test]
fn concurrent_allocation_hands_out_unique_slots() {
    let table = Arc::new(EntryTable::<u64>::with_page_size(128).unwrap());

    let mut threads = Vec::new();
    for t in 0..8u64 {
        let table = table.clone();
        threads.push(std::thread::spawn(move || {
            let mut mine = Vec::new();
            for _ in 0..100 {
                let index = table.allocate().unwrap();
                table.write(index, t).unwrap();
                mine.push(index);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for (t, handle) in threads.into_iter().enumerate() {
        for index in handle.join().expect("thread panicked") {
            assert!(seen.insert(index), "slot {index} handed out twice");
            assert_eq!(table.read(index).unwrap(), t as u64);
        }
    }
    assert_eq!(seen.len(), 800);
}

#[test]
fn dispose_releases_pages_and_fails_later_calls() {
    let alloc = CountingAllocator::new();
    let table = EntryTable::<u32, _>::with_page_size_in(64, alloc.clone()).unwrap();
    for _ in 0..40 {
        table.allocate().unwrap();
    }
    // Three pages plus the slot bitmap.
    assert_eq!(alloc.live(), 4);

    table.dispose();
    assert!(table.is_disposed());
    assert_eq!(alloc.live(), 0);

    assert!(table.allocate().unwrap_err().is_disposed());
    assert!(table.get_value(0).unwrap_err().is_disposed());
    assert!(table.free(0).unwrap_err().is_disposed());
    assert!(!table.is_allocated(0));

    table.dispose();
    drop(table);
    assert_eq!(alloc.frees(), 4);
}

#[test]
fn page_allocation_failure_propagates() {
    // Budget covers the first page and the slot bitmap only.
    let alloc = CountingAllocator::with_budget(2);
    let table = EntryTable::<u32, _>::with_page_size_in(64, alloc.clone()).unwrap();
    for _ in 0..16 {
        table.allocate().unwrap();
    }
    assert!(table.allocate().unwrap_err().is_out_of_memory());
    assert_eq!(table.page_count(), 1);

    drop(table);
    assert_eq!(alloc.live(), 0);
}

#[test]
fn table_stays_usable_after_a_panicking_update() {
    let alloc = CountingAllocator::new();
    let table = EntryTable::<u64, _>::with_page_size_in(64, alloc.clone()).unwrap();
    let index = table.allocate().unwrap();
    table.write(index, 9).unwrap();

    let result = catch_unwind(AssertUnwindSafe(|| {
        table.update(index, |_| panic!("update callback failed"))
    }));
    assert!(result.is_err());

    assert_eq!(table.read(index).unwrap(), 9);
    let other = table.allocate().unwrap();
    assert_ne!(other, index);
    table.free(other).unwrap();

    // Drop still releases every page and the slot bitmap.
    drop(table);
    assert_eq!(alloc.live(), 0);
}
