//! Per-item records and the item table.

use crate::arena::{Alloc, Arena};
use crate::metrics;
use crate::segment::{ITEMS_HEADER, NULL, Offset, Pod, Segment};
use crate::shared::{CacheMode, Shared};
use crate::table::{Table, hash_u64};
use crate::value::ValueType;

/// Item status: the store holds no history older than the cached values.
pub(crate) const STATUS_CACHED_ALL: u8 = 1;

/// Item state: trim stale chunks once the item is no longer referenced.
pub(crate) const CLEAN_PENDING: u8 = 1;
/// Item state: drop the item once it is no longer referenced.
pub(crate) const REMOVE_PENDING: u8 = 2;

/// Smallest active range kept for an item, in seconds.
const MIN_RANGE: i64 = 60;
/// Hours between active range promotions.
const RANGE_SYNC_PERIOD: i64 = 24;
const SEC_PER_HOUR: i64 = 3600;

const ITEM_SIZE: usize = size_of::<ItemRecord>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ItemRecord {
    // Key; must stay the first field.
    pub(crate) itemid: u64,
    value_type: u8,
    pub(crate) status: u8,
    pub(crate) state: u8,
    range_sync_hour: u8,
    pub(crate) refcount: u32,
    pub(crate) values_total: u64,
    pub(crate) active_range: i64,
    pub(crate) daily_range: i64,
    pub(crate) db_cached_from: i64,
    pub(crate) last_accessed: i64,
    pub(crate) hits: u64,
    hour: i64,
    hourly_num: u32,
    last_hourly_num: u32,
    /// Newest chunk.
    pub(crate) head: Offset,
    /// Oldest chunk.
    pub(crate) tail: Offset,
}

unsafe impl Pod for ItemRecord {}

impl ItemRecord {
    pub(crate) fn new(itemid: u64, value_type: ValueType) -> Self {
        Self {
            itemid,
            value_type: value_type.as_u8(),
            ..Self::default()
        }
    }

    pub(crate) fn value_type(&self) -> ValueType {
        ValueType::try_from(self.value_type).unwrap_or(ValueType::Float)
    }

    /// Record the request range and promote it to the active range when due.
    ///
    /// The active range only grows immediately. Shrinking happens once per
    /// sync period, to the largest range requested since the last sync, and
    /// not at all while the item receives no new values.
    pub(crate) fn update_range(&mut self, range: i64, last_value: Option<i64>, now: i64) {
        let range = range.max(MIN_RANGE);
        if self.daily_range < range {
            self.daily_range = range;
        }

        let hour = ((now / SEC_PER_HOUR) & 0xff) as u8;
        let mut diff = hour as i64 - self.range_sync_hour as i64;
        if diff < 0 {
            diff += 0xff;
        }
        let last_value = last_value.unwrap_or(now);

        if self.active_range < self.daily_range
            || (diff > RANGE_SYNC_PERIOD && (now - last_value) / SEC_PER_HOUR < RANGE_SYNC_PERIOD)
        {
            self.active_range = self.daily_range;
            self.daily_range = range;
            self.range_sync_hour = hour;
        }
    }

    /// Account a request that served `hits + misses` values.
    pub(crate) fn record_access(&mut self, hits: u64, misses: u64, now: i64) {
        self.hits += hits;
        self.last_accessed = now;

        let hour = now / SEC_PER_HOUR;
        if hour != self.hour {
            self.last_hourly_num = self.hourly_num;
            self.hourly_num = 0;
            self.hour = hour;
        }
        let served = u32::try_from(hits + misses).unwrap_or(u32::MAX);
        self.hourly_num = self.hourly_num.max(served);
    }

    /// Eviction weight; items with fewer hits per cached value go first.
    pub(crate) fn weight(&self) -> f64 {
        if self.values_total == 0 {
            0.0
        } else {
            self.hits as f64 / self.values_total as f64
        }
    }
}

/// Handle to the item table.
#[derive(Clone, Copy)]
pub(crate) struct Items<'a> {
    seg: &'a Segment,
    table: Table<'a>,
}

impl<'a> Items<'a> {
    pub(crate) fn new(seg: &'a Segment) -> Self {
        Self {
            seg,
            table: Table::new(seg, ITEMS_HEADER),
        }
    }

    pub(crate) fn create(&self, alloc: &impl Alloc, capacity: usize) -> bool {
        self.table.create(alloc, capacity)
    }

    pub(crate) fn find(&self, itemid: u64) -> Option<Offset> {
        self.table
            .find(hash_u64(itemid), |off| self.seg.read::<u64>(off) == itemid)
    }

    /// Store `item` in a new record and index it.
    pub(crate) fn insert(&self, alloc: &impl Alloc, item: &ItemRecord) -> Option<Offset> {
        let off = alloc.alloc(ITEM_SIZE)?;
        self.seg.write(off, *item);
        if !self.table.insert(alloc, hash_u64(item.itemid), off) {
            Arena::new(self.seg).free(off);
            return None;
        }
        Some(off)
    }

    /// Unindex the record at `off`. The record itself is not freed.
    pub(crate) fn remove(&self, off: Offset) -> bool {
        let itemid: u64 = self.seg.read(off);
        self.table.remove(hash_u64(itemid), off)
    }

    pub(crate) fn offsets(&self) -> Vec<Offset> {
        self.table.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn record_size() -> usize {
        ITEM_SIZE
    }
}

impl<'a> Shared<'a> {
    /// Find the item or create an empty one.
    ///
    /// Unknown items are not admitted in low memory mode.
    pub(crate) fn get_or_create(&self, itemid: u64, value_type: ValueType) -> Option<Offset> {
        if let Some(off) = self.items().find(itemid) {
            return Some(off);
        }
        if self.mode() != CacheMode::Normal {
            return None;
        }
        self.items()
            .insert(&self.reclaim(NULL), &ItemRecord::new(itemid, value_type))
    }

    /// Drop the item now, or once the operations using it let go.
    pub(crate) fn invalidate(&self, off: Offset) {
        if self.read_item(off).refcount == 0 {
            self.remove_item(off);
        } else {
            self.update_item(off, |item| item.state |= REMOVE_PENDING);
        }
    }

    pub(crate) fn addref(&self, off: Offset) {
        self.update_item(off, |item| item.refcount += 1);
    }

    /// Drop a reference and run the deferred state actions on the last one.
    pub(crate) fn release(&self, off: Offset) {
        let mut item = self.read_item(off);
        item.refcount = item.refcount.saturating_sub(1);
        if item.refcount == 0 {
            if item.state & REMOVE_PENDING != 0 {
                self.write_item(off, &item);
                self.remove_item(off);
                return;
            }
            if item.state & CLEAN_PENDING != 0
                && let Some(last) = self.head_last(&item)
            {
                self.clean_cache(&mut item, last.sec);
            }
            item.state = 0;
        }
        self.write_item(off, &item);
    }

    /// Update hit counters for `item` (if any) and the whole cache.
    pub(crate) fn update_statistics(&self, item: Option<Offset>, hits: u64, misses: u64) {
        let now = self.now();
        if let Some(off) = item {
            self.update_item(off, |item| item.record_access(hits, misses, now));
        }
        self.update_header(|h| {
            h.hits += hits;
            h.misses += misses;
        });
        metrics::HITS.add(hits);
        metrics::MISSES.add(misses);
    }

    pub(crate) fn snapshot(&self, off: Offset) -> ItemSnapshot {
        let item = self.read_item(off);
        ItemSnapshot {
            itemid: item.itemid,
            value_type: item.value_type(),
            cached_all: item.status == STATUS_CACHED_ALL,
            clean_pending: item.state & CLEAN_PENDING != 0,
            remove_pending: item.state & REMOVE_PENDING != 0,
            refcount: item.refcount,
            active_range: item.active_range,
            daily_range: item.daily_range,
            db_cached_from: item.db_cached_from,
            last_accessed: item.last_accessed,
            hits: item.hits,
            values_total: item.values_total,
            chunks: self.chunk_count(&item),
        }
    }

    pub(crate) fn item_stats(&self, off: Offset) -> ItemStats {
        let item = self.read_item(off);
        ItemStats {
            itemid: item.itemid,
            values_num: item.values_total,
            hits: item.hits,
            active_range: item.active_range,
            hourly_num: item.last_hourly_num,
        }
    }
}

/// Holds a reference on an item for the duration of an operation.
///
/// The item cannot be evicted while the guard lives, even with the segment
/// lock released. Removal and trimming requested in the meantime happen when
/// the last guard drops. The lock must be held when the guard is created and
/// dropped.
pub(crate) struct ItemGuard<'a> {
    shared: Shared<'a>,
    off: Offset,
}

impl<'a> ItemGuard<'a> {
    pub(crate) fn new(shared: Shared<'a>, off: Offset) -> Self {
        shared.addref(off);
        Self { shared, off }
    }

    #[inline]
    pub(crate) fn offset(&self) -> Offset {
        self.off
    }
}

impl Drop for ItemGuard<'_> {
    fn drop(&mut self) {
        self.shared.release(self.off);
    }
}

/// Metadata of one cached item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSnapshot {
    /// Item id.
    pub itemid: u64,
    /// Type of the cached values.
    pub value_type: ValueType,
    /// The store has nothing older than the cached values.
    pub cached_all: bool,
    /// Stale chunks will be trimmed when the item is released.
    pub clean_pending: bool,
    /// The item will be dropped when released.
    pub remove_pending: bool,
    /// Operations currently holding the item.
    pub refcount: u32,
    /// Seconds of history kept cached.
    pub active_range: i64,
    /// Largest range requested since the last range sync.
    pub daily_range: i64,
    /// Second from which the cache is complete, `0` when unknown.
    pub db_cached_from: i64,
    /// Time of the last request, `0` if never requested.
    pub last_accessed: i64,
    /// Values served from the cache.
    pub hits: u64,
    /// Cached values.
    pub values_total: u64,
    /// Chunks in the item's list.
    pub chunks: usize,
}

/// Usage summary of one cached item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemStats {
    /// Item id.
    pub itemid: u64,
    /// Cached values.
    pub values_num: u64,
    /// Values served from the cache.
    pub hits: u64,
    /// Seconds of history kept cached.
    pub active_range: i64,
    /// Most values served by one request during the previous hour.
    pub hourly_num: u32,
}
