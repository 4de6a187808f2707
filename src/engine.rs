//! Read-through and write-through paths for a single item.
//!
//! A request first makes sure the cache covers the requested range,
//! backfilling older history from the store with the segment lock released,
//! then answers from the chunk list. The item is referenced for the whole
//! request so it survives the unlocked part.

use crate::error::{CacheResult, StoreError};
use crate::item::{ItemGuard, ItemRecord, REMOVE_PENDING, STATUS_CACHED_ALL};
use crate::lock::LockGuard;
use crate::segment::{NULL, Offset};
use crate::shared::Shared;
use crate::store::{self, HistoryStore};
use crate::value::{HistoryRecord, ItemValue, Timespec, compare_asc};

/// Upper bound for reads covering everything newer than a point.
const END_OF_TIME: i64 = i64::MAX;

impl Shared<'_> {
    /// Lower the completeness boundary to `timestamp`.
    fn update_db_cached_from(item: &mut ItemRecord, timestamp: i64) {
        if item.db_cached_from == 0 || timestamp < item.db_cached_from {
            item.db_cached_from = timestamp;
        }
    }

    /// Whether every value from second `range_start` on is already cached.
    fn covers(item: &ItemRecord, range_start: i64) -> bool {
        item.status == STATUS_CACHED_ALL
            || (item.db_cached_from != 0 && range_start >= item.db_cached_from)
    }

    /// Re-read the item after the lock was released for a store read.
    ///
    /// `None` when the item was invalidated in the meantime or its oldest
    /// value moved, in which case backfilled values would not line up.
    fn reload_after_read(&self, off: Offset, tail: Option<Timespec>) -> Option<ItemRecord> {
        let item = self.read_item(off);
        if item.state & REMOVE_PENDING != 0 {
            return None;
        }
        if self.tail_first(&item) != tail {
            self.update_item(off, |item| item.state |= REMOVE_PENDING);
            return None;
        }
        Some(item)
    }

    /// Prepend backfilled values, dropping the item if they do not fit.
    fn store_backfill(&self, item: &mut ItemRecord, off: Offset, records: &[HistoryRecord]) -> bool {
        if records.is_empty() {
            return true;
        }
        if let Err(e) = self.add_values_at_tail(item, off, records) {
            tracing::debug!(itemid = item.itemid, "cannot cache history values: {e}");
            item.state |= REMOVE_PENDING;
            self.write_item(off, item);
            return false;
        }
        true
    }

    /// Make sure every value from second `range_start` on is cached.
    ///
    /// Returns the number of values read from the store, or `None` if the
    /// item can no longer be used for this request.
    fn cache_values_by_time(
        &self,
        lock: &LockGuard,
        store: &dyn HistoryStore,
        off: Offset,
        range_start: i64,
    ) -> CacheResult<Option<usize>> {
        let item = self.read_item(off);
        if Self::covers(&item, range_start) {
            return Ok(Some(0));
        }

        let tail = self.tail_first(&item);
        // Everything before the oldest cached value, but not its second.
        let range_end = tail.map_or(END_OF_TIME, |first| first.sec - 1);
        if range_start > range_end {
            return Ok(Some(0));
        }

        let (itemid, value_type) = (item.itemid, item.value_type());
        let mut records = lock.unlocked(|| {
            store::read_by_time(store, itemid, value_type, range_start, range_end)
        })??;
        records.sort_by(compare_asc);

        let Some(mut item) = self.reload_after_read(off, tail) else {
            return Ok(None);
        };

        // A time based read settles the status even when it found nothing.
        item.status = 0;
        if !self.store_backfill(&mut item, off, &records) {
            return Ok(None);
        }
        Self::update_db_cached_from(&mut item, range_start);
        self.write_item(off, &item);
        Ok(Some(records.len()))
    }

    /// Make sure `count` values at or before `ts` are cached, looking no
    /// further back than `range_start` unless it is `0`.
    fn cache_values_by_time_and_count(
        &self,
        lock: &LockGuard,
        store: &dyn HistoryStore,
        off: Offset,
        range_start: i64,
        count: usize,
        ts: Timespec,
    ) -> CacheResult<Option<usize>> {
        let item = self.read_item(off);
        if Self::covers(&item, range_start) {
            return Ok(Some(0));
        }

        let mut cached = 0;
        if let Some((chunk, index)) = self.last_value_before(&item, ts) {
            let header = self.chunk(chunk);
            cached = (index - header.first_value + 1) as usize;
            let mut prev = header.prev;
            while prev != NULL && cached < count {
                let header = self.chunk(prev);
                cached += (header.last_value - header.first_value + 1) as usize;
                prev = header.prev;
            }
        }
        if cached >= count {
            return Ok(Some(0));
        }

        let tail = self.tail_first(&item);
        let range_end = tail.map_or(END_OF_TIME, |first| first.sec - 1);
        let needed = count - cached;
        let (itemid, value_type) = (item.itemid, item.value_type());

        let (records, offset) = lock.unlocked(|| -> Result<_, StoreError> {
            let mut records = Vec::new();
            let mut end = range_end;
            // Values after `ts` that are not cached yet must come along so
            // the cache stays contiguous.
            if end > ts.sec {
                records = store::read_by_time(store, itemid, value_type, ts.sec + 1, end)?;
                end = ts.sec;
            }
            let offset = records.len();
            store::read_by_time_and_count(
                store,
                itemid,
                value_type,
                &mut records,
                range_start,
                needed,
                end,
                ts,
            )?;
            records.sort_by(compare_asc);
            Ok((records, offset))
        })??;

        let Some(mut item) = self.reload_after_read(off, tail) else {
            return Ok(None);
        };
        if !self.store_backfill(&mut item, off, &records) {
            return Ok(None);
        }

        let read = records.len();
        let fetched = read - offset;
        if range_start == 0 && needed > fetched {
            // The store ran out of history: nothing older exists.
            item.active_range = 0;
            item.daily_range = 0;
            item.status = STATUS_CACHED_ALL;
        }

        // Only a full count read bounds the covered range by its oldest second.
        if (needed <= fetched || range_start == 0) && read != 0 {
            if let Some(first) = self.tail_first(&item) {
                Self::update_db_cached_from(&mut item, first.sec);
            }
        } else if range_start != 0 {
            Self::update_db_cached_from(&mut item, range_start);
        }

        self.write_item(off, &item);
        Ok(Some(read))
    }

    /// Cached values in `(ts - seconds, ts]`, newest first.
    fn values_by_time(&self, off: Offset, seconds: i64, ts: Timespec) -> Vec<HistoryRecord> {
        let now = self.now();
        let mut item = self.read_item(off);
        let last = self.head_last(&item).map(|last| last.sec);
        // One more second covers nanosecond shifts.
        item.update_range(seconds + now - ts.sec + 1, last, now);
        self.write_item(off, &item);

        let start = Timespec::new(ts.sec - seconds, ts.ns);
        self.collect_values(&item, start, ts, None)
    }

    /// Up to `count` cached values at or before `ts`, newest first.
    fn values_by_time_and_count(
        &self,
        off: Offset,
        seconds: i64,
        count: usize,
        ts: Timespec,
    ) -> Vec<HistoryRecord> {
        let start = if seconds != 0 {
            Timespec::new(ts.sec - seconds, ts.ns)
        } else {
            Timespec::default()
        };
        let mut item = self.read_item(off);
        let values = self.collect_values(&item, start, ts, Some(count));

        let range_timestamp = match values.last() {
            Some(oldest) if values.len() >= count => oldest.timestamp.sec - 1,
            _ if seconds == 0 => return values,
            _ => ts.sec - seconds,
        };

        let now = self.now();
        let last = self.head_last(&item).map(|last| last.sec);
        item.update_range(now - range_timestamp, last, now);
        self.write_item(off, &item);
        values
    }

    /// Answer a request for the item at `off` from the cache.
    ///
    /// `count == 0` selects time mode. Returns `None` when the item had to
    /// be dropped during the request and the store must answer instead.
    pub(crate) fn item_get_values(
        &self,
        lock: &LockGuard,
        store: &dyn HistoryStore,
        off: Offset,
        seconds: i64,
        count: usize,
        ts: Timespec,
    ) -> CacheResult<Option<Vec<HistoryRecord>>> {
        let (read, values) = if count == 0 {
            // Second 0 would leave the boundary unknown.
            let range_start = (ts.sec - seconds).max(1);
            let Some(read) = self.cache_values_by_time(lock, store, off, range_start)? else {
                return Ok(None);
            };
            (read, self.values_by_time(off, seconds, ts))
        } else {
            let range_start = if seconds == 0 { 0 } else { ts.sec - seconds };
            let Some(read) =
                self.cache_values_by_time_and_count(lock, store, off, range_start, count, ts)?
            else {
                return Ok(None);
            };
            (read, self.values_by_time_and_count(off, seconds, count, ts))
        };

        let misses = read.min(values.len());
        let hits = values.len() - misses;
        self.update_statistics(Some(off), hits as u64, misses as u64);
        Ok(Some(values))
    }

    /// Add a freshly written value to the cached item at `off`.
    ///
    /// Items whose completeness boundary is not known yet are left alone.
    /// A value of another type, or one that cannot be stored, drops the item.
    pub(crate) fn write_through(&self, off: Offset, value: &ItemValue) {
        let guard = ItemGuard::new(*self, off);
        let mut item = self.read_item(guard.offset());

        if item.state & REMOVE_PENDING != 0 {
            return;
        }
        if item.status != STATUS_CACHED_ALL && item.db_cached_from == 0 {
            if item.refcount > 1 {
                // A backfill is reading from the store right now and may
                // have missed this value.
                item.state |= REMOVE_PENDING;
                self.write_item(off, &item);
            }
            return;
        }

        let found = value.value.value_type();
        if item.value_type() != found {
            tracing::debug!(
                itemid = item.itemid,
                expected = %item.value_type(),
                %found,
                "value type changed, dropping cached item"
            );
            item.state |= REMOVE_PENDING;
        } else if let Err(e) = self.add_value_at_head(&mut item, off, &value.record()) {
            tracing::debug!(itemid = item.itemid, "cannot cache new value: {e}");
            item.state |= REMOVE_PENDING;
        }
        self.write_item(off, &item);
    }
}
