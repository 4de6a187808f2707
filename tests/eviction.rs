//! Space reclamation and low memory mode.

mod common;

use common::{at, cache, record};
use valuecache::{CacheMode, MIN_SIZE, MemoryHistory, ValueCache, ValueType};

const NOW: i64 = 100_000;
const DAY: i64 = 24 * 3600;

/// 100 values over the hour before `now`.
fn insert_hour(cache: &ValueCache<MemoryHistory>, itemid: u64, now: i64) {
    cache
        .store()
        .insert(itemid, (1..=100).map(|i| record(now - 3600 + i * 36, 0, i as f64)));
}

fn read_hour(cache: &ValueCache<MemoryHistory>, itemid: u64, now: i64) -> usize {
    cache
        .get_values(itemid, ValueType::Float, 3600, 0, at(now))
        .unwrap()
        .len()
}

#[test]
fn test_low_memory_mode_stops_admission() {
    let (cache, clock) = cache(MIN_SIZE, NOW);
    for itemid in 1..=300 {
        insert_hour(&cache, itemid, NOW);
        assert_eq!(read_hour(&cache, itemid, NOW), 100);
    }

    let stats = cache.stats().unwrap();
    assert_eq!(stats.mode, CacheMode::LowMemory);
    assert!(cache.diag_stats().unwrap().items_num < 300);

    // Requests are still answered, just not cached.
    insert_hour(&cache, 1000, NOW);
    assert_eq!(read_hour(&cache, 1000, NOW), 100);
    assert_eq!(cache.item_state(1000).unwrap(), None);

    clock.advance(DAY + 1);
    assert_eq!(read_hour(&cache, 1000, NOW), 100);
    assert_eq!(cache.stats().unwrap().mode, CacheMode::Normal);
    assert_eq!(cache.item_state(1000).unwrap().unwrap().values_total, 100);
}

#[test]
fn test_idle_items_are_evicted_first() {
    let (cache, clock) = cache(MIN_SIZE, NOW);
    let initial = cache.mem_stats().unwrap().free_size;

    let mut itemid = 0;
    while cache.mem_stats().unwrap().free_size > initial * 4 / 10 {
        itemid += 1;
        insert_hour(&cache, itemid, NOW);
        assert_eq!(read_hour(&cache, itemid, NOW), 100);
    }
    let idle = itemid;

    let now = NOW + DAY + 60;
    clock.set(now);
    for fresh in idle + 1..=idle * 2 {
        insert_hour(&cache, fresh, now);
        assert_eq!(read_hour(&cache, fresh, now), 100);
    }

    assert_eq!(cache.stats().unwrap().mode, CacheMode::Normal);
    for old in 1..=idle {
        assert_eq!(cache.item_state(old).unwrap(), None, "item {old}");
    }
    for fresh in idle + 1..=idle * 2 {
        assert!(cache.item_state(fresh).unwrap().is_some(), "item {fresh}");
    }
}

#[test]
fn test_reset_empties_cache() {
    let (cache, _) = cache(MIN_SIZE, NOW);
    for itemid in 1..=300 {
        insert_hour(&cache, itemid, NOW);
        read_hour(&cache, itemid, NOW);
    }
    assert_eq!(cache.stats().unwrap().mode, CacheMode::LowMemory);
    let free = cache.mem_stats().unwrap().free_size;

    cache.reset().unwrap();

    let stats = cache.stats().unwrap();
    assert_eq!((stats.hits, stats.misses), (0, 0));
    assert_eq!(stats.mode, CacheMode::Normal);
    assert_eq!(cache.diag_stats().unwrap().items_num, 0);
    assert!(cache.mem_stats().unwrap().free_size > free);

    // Admission works again.
    assert_eq!(read_hour(&cache, 1, NOW), 100);
    assert!(cache.item_state(1).unwrap().is_some());
}

#[test]
fn test_mem_stats_account_for_values() {
    let (cache, _) = cache(MIN_SIZE * 8, NOW);
    let before = cache.mem_stats().unwrap();
    assert_eq!(before.total, before.free_size + before.used_size);

    insert_hour(&cache, 1, NOW);
    read_hour(&cache, 1, NOW);
    let after = cache.mem_stats().unwrap();
    assert!(after.used_size > before.used_size);
    assert!(after.used_chunks > before.used_chunks);
    assert_eq!(after.total, before.total);

    cache.remove_items(&[1]).unwrap();
    assert_eq!(cache.mem_stats().unwrap().used_size, before.used_size);
}
