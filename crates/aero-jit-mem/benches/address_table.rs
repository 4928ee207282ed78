use std::sync::Arc;
use std::time::Duration;

use aero_jit_mem::{
    walk_raw, AddressTable, Allocator, ArenaAllocator, Counter, EntryTable, LEVELS_64BIT,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn criterion_config() -> Criterion {
    match std::env::var("AERO_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

#[derive(Clone)]
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

const BLOCKS: usize = 10_000;
const QUERY_COUNT: usize = 8_192; // power-of-two for cheap wrapping
const RNG_SEED: u64 = 0x5EED_0A11_0CA7_0001;
const STUB: u64 = 0xDEAD_0000;

/// Guest code addresses clustered in four regions, 16-byte aligned.
fn guest_addresses() -> Vec<u64> {
    let mut rng = SplitMix64::new(RNG_SEED);
    (0..QUERY_COUNT)
        .map(|_| {
            let region = (rng.next_u64() % 4) << 32;
            let offset = (rng.next_u64() % BLOCKS as u64) << 4;
            0x4000_0000 | region | offset
        })
        .collect()
}

fn bench_address_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_table");
    group.throughput(Throughput::Elements(1));

    let table = AddressTable::new(&LEVELS_64BIT, STUB).unwrap();
    let queries = guest_addresses();
    for &address in &queries {
        table.write(address, address).unwrap();
    }

    group.bench_function("get_value", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            let address = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            black_box(table.get_value(black_box(address)).unwrap());
        });
    });

    group.bench_function("lookup", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            let address = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            black_box(table.lookup(black_box(address)));
        });
    });

    let base = table.base().unwrap();
    group.bench_function("walk_raw", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            let address = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            // Safety: `table` outlives the benchmark and is never disposed.
            let entry = unsafe { walk_raw::<u64>(base.as_ptr(), &LEVELS_64BIT, black_box(address)) };
            black_box(entry);
        });
    });

    group.finish();
}

fn bench_arena(c: &mut Criterion) {
    const OPS: usize = 1_024;

    let mut group = c.benchmark_group("arena");
    group.throughput(Throughput::Elements(OPS as u64));

    group.bench_function("allocate_reset", |b| {
        let mut arena = ArenaAllocator::new(64 * 1024, 8).unwrap();
        b.iter(|| {
            for i in 0..OPS {
                black_box(arena.allocate(16 + (i & 0x3F)).unwrap());
            }
            arena.reset();
        });
    });

    group.finish();
}

fn bench_counters(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter");
    group.throughput(Throughput::Elements(1));

    let table = Arc::new(EntryTable::<u32>::new().unwrap());
    let counter = Counter::new(&table).unwrap();
    group.bench_function("increment", |b| {
        b.iter(|| black_box(counter.increment().unwrap()));
    });

    group.bench_function("create_release", |b| {
        b.iter(|| black_box(Counter::new(&table).unwrap().index()));
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_address_table, bench_arena, bench_counters
}
criterion_main!(benches);
