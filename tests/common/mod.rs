//! Shared helpers for the integration tests.

#![allow(dead_code)]

use valuecache::{
    HistoryRecord, HistoryValue, ItemValue, ManualClock, MemoryHistory, Timespec, ValueCache,
};

/// A cache over an empty in-memory store, with a clock reading `now`.
pub fn cache(size: usize, now: i64) -> (ValueCache<MemoryHistory>, ManualClock) {
    let clock = ManualClock::new(now);
    let cache = ValueCache::<MemoryHistory>::builder()
        .size(size)
        .clock(clock.clone())
        .build(MemoryHistory::new())
        .expect("failed to create cache");
    (cache, clock)
}

pub fn float(itemid: u64, sec: i64, value: f64) -> ItemValue {
    ItemValue::new(itemid, Timespec::new(sec, 0), HistoryValue::Float(value))
}

pub fn record(sec: i64, ns: i32, value: f64) -> HistoryRecord {
    HistoryRecord::new(Timespec::new(sec, ns), HistoryValue::Float(value))
}

/// Seconds of the returned values, in the order returned.
pub fn secs(values: &[HistoryRecord]) -> Vec<i64> {
    values.iter().map(|v| v.timestamp.sec).collect()
}

pub fn at(sec: i64) -> Timespec {
    Timespec::new(sec, 0)
}
