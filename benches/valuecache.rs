//! Benchmarks for value cache hot paths.
//!
//! - Time and count requests answered from the cache
//! - Write-through appends to cached items
//!
//! Run with: cargo bench --bench valuecache

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use valuecache::{
    HistoryRecord, HistoryStore, HistoryValue, ItemValue, ManualClock, MemoryHistory, StoreError,
    Timespec, ValueCache, ValueType,
};

const NOW: i64 = 1_700_000_000;

/// Store that keeps nothing, so long write runs do not grow memory.
struct NullStore;

impl HistoryStore for NullStore {
    fn read(
        &self,
        _itemid: u64,
        _value_type: ValueType,
        _start: i64,
        _count: usize,
        _end: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(Vec::new())
    }

    fn append(&self, _values: &[ItemValue]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A cache holding `items` items with one value per minute over a day.
fn populated(items: u64) -> ValueCache<MemoryHistory> {
    let cache = ValueCache::<MemoryHistory>::builder()
        .size(256 * 1024 * 1024)
        .clock(ManualClock::new(NOW))
        .build(MemoryHistory::new())
        .unwrap();

    for itemid in 0..items {
        cache.store().insert(
            itemid,
            (0..1440).map(|i| {
                HistoryRecord::new(Timespec::new(NOW - i * 60, 0), HistoryValue::Float(i as f64))
            }),
        );
        cache
            .get_values(itemid, ValueType::Float, 24 * 3600, 0, Timespec::new(NOW, 0))
            .unwrap();
    }
    cache
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("valuecache/get");

    for items in [100, 1000] {
        let cache = populated(items);
        let ts = Timespec::new(NOW, 0);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("last_hour", items), &items, |b, &items| {
            let mut itemid = 0;
            b.iter(|| {
                let values = cache
                    .get_values(black_box(itemid), ValueType::Float, 3600, 0, ts)
                    .unwrap();
                black_box(values);
                itemid = (itemid + 1) % items;
            });
        });
        group.bench_with_input(BenchmarkId::new("last_value", items), &items, |b, &items| {
            let mut itemid = 0;
            b.iter(|| {
                let value = cache.get_value(black_box(itemid), ValueType::Float, ts).unwrap();
                black_box(value);
                itemid = (itemid + 1) % items;
            });
        });
    }

    group.finish();
}

fn bench_add_values(c: &mut Criterion) {
    let mut group = c.benchmark_group("valuecache/add_values");

    for batch in [1usize, 100] {
        let clock = ManualClock::new(NOW);
        let cache = ValueCache::<NullStore>::builder()
            .size(64 * 1024 * 1024)
            .clock(clock.clone())
            .build(NullStore)
            .unwrap();
        let items: Vec<_> = (0..batch as u64).map(|id| (id, ValueType::Float)).collect();
        cache.add_new_items(&items).unwrap();
        for &(itemid, _) in &items {
            // Sets a one minute active range so old chunks get trimmed.
            cache
                .get_values(itemid, ValueType::Float, 60, 0, Timespec::new(NOW, 0))
                .unwrap();
        }

        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, _| {
            let mut sec = NOW;
            b.iter(|| {
                sec += 1;
                clock.set(sec);
                let values: Vec<_> = items
                    .iter()
                    .map(|&(itemid, _)| {
                        ItemValue::new(itemid, Timespec::new(sec, 0), HistoryValue::Float(1.0))
                    })
                    .collect();
                cache.add_values(black_box(&values)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_batch_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("valuecache/lock");
    let cache = populated(100);
    let ts = Timespec::new(NOW, 0);

    group.throughput(Throughput::Elements(100));
    group.bench_function("per_request", |b| {
        b.iter(|| {
            for itemid in 0..100 {
                black_box(cache.get_value(itemid, ValueType::Float, ts).unwrap());
            }
        });
    });
    group.bench_function("batched", |b| {
        b.iter(|| {
            cache.lock().unwrap();
            for itemid in 0..100 {
                black_box(cache.get_value(itemid, ValueType::Float, ts).unwrap());
            }
            cache.unlock().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_get, bench_add_values, bench_batch_lock);
criterion_main!(benches);
