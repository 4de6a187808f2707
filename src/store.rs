//! Backing history store interface and read helpers.
//!
//! Stores work at second resolution: a read covers whole seconds and the
//! helpers here widen or trim the results so the cache never holds part of
//! a second.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::metrics;
use crate::value::{HistoryRecord, ItemValue, Timespec, ValueType, compare_desc};

/// Durable history the cache reads through to.
pub trait HistoryStore: Send + Sync {
    /// Values with `start < sec <= end`, newest first.
    ///
    /// With `count > 0` at most `count` of the newest matching values are
    /// returned. `start == 0` reads from the beginning of history.
    fn read(
        &self,
        itemid: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Persist a batch of values.
    fn append(&self, values: &[ItemValue]) -> Result<(), StoreError>;
}

impl<S: HistoryStore + ?Sized> HistoryStore for Arc<S> {
    fn read(
        &self,
        itemid: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        (**self).read(itemid, value_type, start, count, end)
    }

    fn append(&self, values: &[ItemValue]) -> Result<(), StoreError> {
        (**self).append(values)
    }
}

fn read(
    store: &dyn HistoryStore,
    itemid: u64,
    value_type: ValueType,
    start: i64,
    count: usize,
    end: i64,
) -> Result<Vec<HistoryRecord>, StoreError> {
    metrics::STORE_READS.increment();
    store.read(itemid, value_type, start, count, end)
}

/// All values in seconds `[range_start, range_end]`.
pub(crate) fn read_by_time(
    store: &dyn HistoryStore,
    itemid: u64,
    value_type: ValueType,
    range_start: i64,
    range_end: i64,
) -> Result<Vec<HistoryRecord>, StoreError> {
    // The store excludes the start second.
    let start = if range_start > 0 { range_start - 1 } else { 0 };
    read(store, itemid, value_type, start, 0, range_end)
}

/// Append to `values` at least `count` values at or before `ts` from seconds
/// `[range_start, range_end]`, covering whole seconds only.
///
/// Asks for one value more than needed. When the oldest second returned may
/// be incomplete it is dropped, and if that leaves too few values it is read
/// again in full.
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_by_time_and_count(
    store: &dyn HistoryStore,
    itemid: u64,
    value_type: ValueType,
    values: &mut Vec<HistoryRecord>,
    range_start: i64,
    count: usize,
    range_end: i64,
    ts: Timespec,
) -> Result<(), StoreError> {
    let values_start = values.len();
    let range_start = if range_start > 0 { range_start - 1 } else { 0 };

    let wanted = count.saturating_add(1);
    values.extend(read(store, itemid, value_type, range_start, wanted, range_end)?);

    // Fewer than requested: everything is read.
    if count > values.len() - values_start {
        return Ok(());
    }

    let mut first_sec = values[values.len() - 1].timestamp.sec;
    let last_sec = values[values_start].timestamp.sec;

    // Values of the newest second past `ts` do not count towards the request.
    let mut left = values[values_start..]
        .iter()
        .take_while(|v| v.timestamp.sec == last_sec)
        .filter(|v| v.timestamp > ts)
        .count();

    if left != 0 {
        while values.len() > values_start && values[values.len() - 1].timestamp.sec == first_sec {
            values.pop();
            left += 1;
        }

        let offset = values.len();
        values.extend(read(store, itemid, value_type, range_start, left, first_sec)?);
        if left > values.len() - offset {
            return Ok(());
        }
        first_sec = values[values.len() - 1].timestamp.sec;
    }

    while values.len() > values_start && values[values.len() - 1].timestamp.sec == first_sec {
        values.pop();
    }

    let matching = values[values_start..]
        .iter()
        .filter(|v| v.timestamp <= ts)
        .count();
    if matching >= count {
        return Ok(());
    }

    values.extend(read(store, itemid, value_type, first_sec - 1, 0, first_sec)?);
    Ok(())
}

/// Answer a request straight from the store, newest first.
///
/// Time mode (`count == 0`) returns values in `(ts - seconds, ts]`. Count mode
/// returns up to `count` values at or before `ts`, limited to the window when
/// `seconds` is set.
pub(crate) fn get_values_direct(
    store: &dyn HistoryStore,
    itemid: u64,
    value_type: ValueType,
    seconds: i64,
    count: usize,
    ts: Timespec,
) -> Result<Vec<HistoryRecord>, StoreError> {
    let mut values = if count == 0 {
        // One more second covers nanosecond shifts.
        read_by_time(store, itemid, value_type, ts.sec - seconds, ts.sec)?
    } else {
        let range_start = if seconds == 0 { 0 } else { ts.sec - seconds };
        let mut values = Vec::new();
        read_by_time_and_count(
            store,
            itemid,
            value_type,
            &mut values,
            range_start,
            count,
            ts.sec,
            ts,
        )?;
        values
    };

    values.sort_by(compare_desc);

    let Some(first) = values.iter().position(|v| v.timestamp <= ts) else {
        return Ok(Vec::new());
    };
    values.drain(..first);

    if count != 0 {
        values.truncate(count);
    }
    if seconds != 0 {
        let start = Timespec::new(ts.sec - seconds, ts.ns);
        while values.last().is_some_and(|v| v.timestamp <= start) {
            values.pop();
        }
    }
    Ok(values)
}

type ReadHook = Box<dyn Fn(u64) + Send + Sync>;

/// In-memory history, one series per item and value type.
///
/// Counts reads and can be told to fail, which is what the tests and
/// benchmarks need from a store.
#[derive(Default)]
pub struct MemoryHistory {
    series: RwLock<HashMap<(u64, ValueType), Vec<HistoryRecord>>>,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_appends: AtomicBool,
    read_hook: RwLock<Option<ReadHook>>,
}

impl MemoryHistory {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add values for `itemid` directly, bypassing any cache.
    pub fn insert(&self, itemid: u64, records: impl IntoIterator<Item = HistoryRecord>) {
        let mut series = self.series.write();
        for record in records {
            let values = series
                .entry((itemid, record.value.value_type()))
                .or_default();
            let at = values.partition_point(|v| v.timestamp <= record.timestamp);
            values.insert(at, record);
        }
    }

    /// Reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Zero the read counter.
    pub fn reset_reads(&self) {
        self.reads.store(0, Ordering::Relaxed);
    }

    /// Make reads fail until turned off again.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make appends fail until turned off again.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::Relaxed);
    }

    /// Run `hook` with the item id at the start of every read.
    pub fn set_read_hook(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.read_hook.write() = Some(Box::new(hook));
    }

    /// Values stored for `itemid` of type `value_type`.
    pub fn len(&self, itemid: u64, value_type: ValueType) -> usize {
        self.series
            .read()
            .get(&(itemid, value_type))
            .map_or(0, Vec::len)
    }
}

impl HistoryStore for MemoryHistory {
    fn read(
        &self,
        itemid: u64,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        if let Some(hook) = self.read_hook.read().as_ref() {
            hook(itemid);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StoreError::new("read failure injected"));
        }

        let series = self.series.read();
        let Some(values) = series.get(&(itemid, value_type)) else {
            return Ok(Vec::new());
        };
        let matching = values
            .iter()
            .rev()
            .filter(|v| v.timestamp.sec > start && v.timestamp.sec <= end)
            .cloned();
        Ok(if count == 0 {
            matching.collect()
        } else {
            matching.take(count).collect()
        })
    }

    fn append(&self, values: &[ItemValue]) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::Relaxed) {
            return Err(StoreError::new("append failure injected"));
        }
        let mut series = self.series.write();
        for value in values {
            let records = series
                .entry((value.itemid, value.value.value_type()))
                .or_default();
            let record = value.record();
            let at = records.partition_point(|v| v.timestamp <= record.timestamp);
            records.insert(at, record);
        }
        Ok(())
    }
}
