//! Per-item chunk lists.
//!
//! Each item owns a doubly linked list of chunks ordered from the oldest
//! (`tail`) to the newest (`head`). A chunk is a fixed array of [`Slot`]s of
//! which `first_value..=last_value` are populated, sorted by timestamp.
//!
//! ```text
//!  item.tail                                          item.head
//!  +--------------+ next  +--------------+ next  +--------------+
//!  | ..[f .... l] | ----> | [f ...... l] | ----> | [f .... l].. |
//!  +--------------+ <---- +--------------+ <---- +--------------+
//!                   prev                   prev
//! ```
//!
//! Tail chunks fill right to left as older history is backfilled. Head chunks
//! fill left to right as new values arrive.

use crate::arena::Alloc;
use crate::error::{CacheError, CacheResult};
use crate::item::{CLEAN_PENDING, ItemRecord, REMOVE_PENDING, STATUS_CACHED_ALL};
use crate::record::Slot;
use crate::segment::{NULL, Offset, Pod};
use crate::shared::Shared;
use crate::value::{HistoryRecord, Timespec};

const CHUNK_HEADER: u64 = size_of::<ChunkHeader>() as u64;
const SLOT_SIZE: u64 = size_of::<Slot>() as u64;

/// Fewest slots in a chunk.
pub(crate) const MIN_CHUNK_RECORDS: u32 = 2;
/// Most slots in a chunk, keeping a chunk within 64 KiB.
pub(crate) const MAX_CHUNK_RECORDS: u32 = ((64 * 1024 - CHUNK_HEADER) / SLOT_SIZE) as u32;
/// Preferred upper bound on the number of chunks per item.
const TARGET_CHUNKS: u64 = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChunkHeader {
    /// Older neighbour, `NULL` at the tail.
    pub(crate) prev: Offset,
    /// Newer neighbour, `NULL` at the head.
    pub(crate) next: Offset,
    pub(crate) first_value: u32,
    pub(crate) last_value: u32,
    pub(crate) slots_num: u32,
    _pad: u32,
}

unsafe impl Pod for ChunkHeader {}

/// Slot count for a new chunk given the item's size after adding
/// `values_new` values.
///
/// Roughly the square root of the value count, raised so that an item does
/// not need more than about 32 chunks.
pub(crate) fn slot_count(item: &ItemRecord, values_new: usize) -> u32 {
    let values = (item.values_total + values_new as u64).max(1);
    let mut nslots = values.isqrt();
    if values.div_ceil(nslots) + 1 > TARGET_CHUNKS {
        nslots = values / TARGET_CHUNKS;
    }
    nslots.clamp(MIN_CHUNK_RECORDS as u64, MAX_CHUNK_RECORDS as u64) as u32
}

impl Shared<'_> {
    #[inline]
    pub(crate) fn chunk(&self, off: Offset) -> ChunkHeader {
        self.seg.read(off)
    }

    #[inline]
    fn set_chunk(&self, off: Offset, chunk: &ChunkHeader) {
        self.seg.write(off, *chunk)
    }

    #[inline]
    fn slot_offset(chunk: Offset, index: u32) -> Offset {
        chunk + CHUNK_HEADER + index as u64 * SLOT_SIZE
    }

    #[inline]
    pub(crate) fn slot(&self, chunk: Offset, index: u32) -> Slot {
        self.seg.read(Self::slot_offset(chunk, index))
    }

    #[inline]
    fn set_slot(&self, chunk: Offset, index: u32, slot: Slot) {
        self.seg.write(Self::slot_offset(chunk, index), slot)
    }

    /// Timestamp of the newest cached value.
    pub(crate) fn head_last(&self, item: &ItemRecord) -> Option<Timespec> {
        if item.head == NULL {
            return None;
        }
        let head = self.chunk(item.head);
        Some(self.slot(item.head, head.last_value).timestamp())
    }

    /// Timestamp of the oldest cached value.
    pub(crate) fn tail_first(&self, item: &ItemRecord) -> Option<Timespec> {
        if item.tail == NULL {
            return None;
        }
        let tail = self.chunk(item.tail);
        Some(self.slot(item.tail, tail.first_value).timestamp())
    }

    pub(crate) fn chunk_count(&self, item: &ItemRecord) -> usize {
        let mut count = 0;
        let mut chunk = item.tail;
        while chunk != NULL {
            count += 1;
            chunk = self.chunk(chunk).next;
        }
        count
    }

    /// Link a new empty chunk of `nslots` before `insert_before`, or at the
    /// head when `insert_before` is `NULL`.
    fn add_chunk(
        &self,
        item: &mut ItemRecord,
        source: Offset,
        nslots: u32,
        insert_before: Offset,
    ) -> Option<Offset> {
        let size = CHUNK_HEADER + nslots as u64 * SLOT_SIZE;
        let off = self.reclaim(source).alloc(size as usize)?;

        let mut chunk = ChunkHeader {
            slots_num: nslots,
            next: insert_before,
            ..ChunkHeader::default()
        };

        if insert_before == NULL {
            chunk.prev = item.head;
            if item.head != NULL {
                let mut head = self.chunk(item.head);
                head.next = off;
                self.set_chunk(item.head, &head);
            } else {
                item.tail = off;
            }
            item.head = off;
        } else {
            let mut before = self.chunk(insert_before);
            chunk.prev = before.prev;
            before.prev = off;
            self.set_chunk(insert_before, &before);
            if item.tail == insert_before {
                item.tail = off;
            } else {
                let mut prev = self.chunk(chunk.prev);
                prev.next = off;
                self.set_chunk(chunk.prev, &prev);
            }
        }

        self.set_chunk(off, &chunk);
        Some(off)
    }

    /// Chunk and index of the newest value at or before `ts`.
    ///
    /// `None` when every cached value is newer than `ts`.
    pub(crate) fn last_value_before(&self, item: &ItemRecord, ts: Timespec) -> Option<(Offset, u32)> {
        let mut chunk = item.head;
        while chunk != NULL {
            let header = self.chunk(chunk);
            if self.slot(chunk, header.first_value).timestamp() <= ts {
                // Count the prefix of slots not newer than `ts`.
                let (mut lo, mut hi) = (header.first_value, header.last_value + 1);
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    if self.slot(chunk, mid).timestamp() <= ts {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                return Some((chunk, lo - 1));
            }
            chunk = header.prev;
        }
        None
    }

    fn free_values(&self, item: &mut ItemRecord, chunk: Offset, first: u32, last: u32) -> usize {
        if first > last {
            return 0;
        }
        let vt = item.value_type();
        let freed = if vt.is_pooled() {
            (first..=last)
                .map(|i| self.free_value(vt, self.slot(chunk, i).value))
                .sum()
        } else {
            0
        };
        item.values_total -= (last - first + 1) as u64;
        freed
    }

    fn free_chunk(&self, item: &mut ItemRecord, chunk: Offset) -> usize {
        let header = self.chunk(chunk);
        let mut freed = (CHUNK_HEADER + header.slots_num as u64 * SLOT_SIZE) as usize;
        freed += self.free_values(item, chunk, header.first_value, header.last_value);
        self.arena().free(chunk);
        freed
    }

    fn remove_chunk(&self, item: &mut ItemRecord, chunk: Offset) {
        let header = self.chunk(chunk);
        if header.next != NULL {
            let mut next = self.chunk(header.next);
            next.prev = header.prev;
            self.set_chunk(header.next, &next);
        }
        if header.prev != NULL {
            let mut prev = self.chunk(header.prev);
            prev.next = header.next;
            self.set_chunk(header.prev, &prev);
        }
        if chunk == item.head {
            item.head = header.prev;
        }
        if chunk == item.tail {
            item.tail = header.next;
        }
        self.free_chunk(item, chunk);
    }

    /// Free every chunk of the item. Returns the bytes released.
    pub(crate) fn free_cache(&self, item: &mut ItemRecord) -> usize {
        let mut freed = 0;
        let mut chunk = item.tail;
        while chunk != NULL {
            let next = self.chunk(chunk).next;
            freed += self.free_chunk(item, chunk);
            chunk = next;
        }
        item.values_total = 0;
        item.head = NULL;
        item.tail = NULL;
        freed
    }

    /// Drop tail chunks whose values all fall before `timestamp - active_range`.
    ///
    /// The head chunk is always kept and values sharing a second are kept or
    /// dropped together. `db_cached_from` moves past the newest dropped second.
    pub(crate) fn clean_cache(&self, item: &mut ItemRecord, timestamp: i64) {
        if item.active_range == 0 {
            return;
        }
        let Some(head_last) = self.head_last(item) else {
            return;
        };
        let old_tail = item.tail;
        let limit = timestamp - item.active_range;

        let mut chunk = item.tail;
        while chunk != NULL {
            let header = self.chunk(chunk);
            let last_sec = self.slot(chunk, header.last_value).sec;
            if last_sec >= limit || last_sec == head_last.sec {
                break;
            }
            let next = header.next;
            if next == NULL {
                break;
            }

            let mut next_header = self.chunk(next);
            if self.slot(next, next_header.last_value).sec == last_sec {
                // The whole next chunk belongs to the same second.
                break;
            }
            while self.slot(next, next_header.first_value).sec == last_sec {
                let first = next_header.first_value;
                self.free_values(item, next, first, first);
                next_header.first_value += 1;
            }
            self.set_chunk(next, &next_header);

            item.db_cached_from = last_sec + 1;
            self.remove_chunk(item, chunk);
            chunk = next;
        }

        if old_tail != item.tail {
            item.status = 0;
        }
    }

    /// Drop every cached value older than second `timestamp`.
    fn remove_values(&self, item: &mut ItemRecord, timestamp: i64) {
        if item.status == STATUS_CACHED_ALL {
            item.status = 0;
        }
        let mut chunk = item.tail;
        while chunk != NULL {
            let mut header = self.chunk(chunk);
            if self.slot(chunk, header.first_value).sec >= timestamp {
                break;
            }
            if self.slot(chunk, header.last_value).sec >= timestamp {
                while self.slot(chunk, header.first_value).sec < timestamp {
                    let first = header.first_value;
                    self.free_values(item, chunk, first, first);
                    header.first_value += 1;
                }
                self.set_chunk(chunk, &header);
                break;
            }
            let next = header.next;
            self.remove_chunk(item, chunk);
            chunk = next;
        }
    }

    /// Insert a freshly written value.
    ///
    /// Values newer than the head are appended. Older values are shifted
    /// into place. A value not newer than the oldest cached one cannot be
    /// placed: its second is dropped from the cache and `db_cached_from`
    /// moves past it instead.
    pub(crate) fn add_value_at_head(
        &self,
        item: &mut ItemRecord,
        source: Offset,
        value: &HistoryRecord,
    ) -> CacheResult<()> {
        let ts = value.timestamp;

        if item.head == NULL && item.status != STATUS_CACHED_ALL && ts.sec < item.db_cached_from {
            // Older than the covered range, the store answers for it.
            return Ok(());
        }

        let out_of_order = self.head_last(item).is_some_and(|last| last > ts);
        if out_of_order && self.tail_first(item).is_some_and(|first| first >= ts) {
            self.remove_values(item, ts.sec + 1);
            if item.head == NULL {
                // Later values of this second would be cached without their
                // predecessors.
                item.state |= REMOVE_PENDING;
                return Ok(());
            }
            if item.db_cached_from <= ts.sec {
                item.db_cached_from = ts.sec + 1;
            }
            return Ok(());
        }

        let vt = item.value_type();
        let raw = self.store_value(&self.reclaim(source), vt, &value.value)?;

        let old_head = item.head;
        let head_full = old_head == NULL || {
            let head = self.chunk(old_head);
            head.last_value + 1 >= head.slots_num
        };
        if head_full {
            let nslots = slot_count(item, 1);
            if self.add_chunk(item, source, nslots, NULL).is_none() {
                self.free_value(vt, raw);
                return Err(CacheError::OutOfMemory);
            }
        } else {
            let mut head = self.chunk(old_head);
            head.last_value += 1;
            self.set_chunk(old_head, &head);
        }
        item.values_total += 1;

        let mut chunk = item.head;
        let mut index = self.chunk(chunk).last_value;

        if out_of_order {
            // Shift newer values one slot towards the head.
            let (mut schunk, mut sindex) = (chunk, index);
            loop {
                let sheader = self.chunk(schunk);
                if sindex == sheader.first_value {
                    if sheader.prev == NULL {
                        break;
                    }
                    schunk = sheader.prev;
                    sindex = self.chunk(schunk).last_value;
                } else {
                    sindex -= 1;
                }
                let slot = self.slot(schunk, sindex);
                if slot.timestamp() <= ts {
                    break;
                }
                self.set_slot(chunk, index, slot);
                chunk = schunk;
                index = sindex;
            }
        }

        self.set_slot(chunk, index, Slot::new(ts, raw));
        if old_head != item.head {
            item.state |= CLEAN_PENDING;
        }
        Ok(())
    }

    /// Prepend backfilled values sorted oldest first.
    ///
    /// Values in seconds already present at the tail are skipped, so a
    /// repeated backfill over the same range is harmless.
    pub(crate) fn add_values_at_tail(
        &self,
        item: &mut ItemRecord,
        source: Offset,
        values: &[HistoryRecord],
    ) -> CacheResult<()> {
        let mut count = match self.tail_first(item) {
            Some(first) => values.partition_point(|v| v.timestamp.sec < first.sec),
            None => values.len(),
        };
        let vt = item.value_type();

        while count > 0 {
            let mut free = if item.tail == NULL {
                0
            } else {
                self.chunk(item.tail).first_value
            };

            if free == 0 {
                free = slot_count(item, count);
                if self.add_chunk(item, source, free, item.tail).is_none() {
                    return Err(CacheError::OutOfMemory);
                }
                let tail = item.tail;
                let mut header = self.chunk(tail);
                header.first_value = free;
                header.last_value = free - 1;
                self.set_chunk(tail, &header);
            }

            let copy = (free as usize).min(count);
            for value in values[count - copy..count].iter().rev() {
                let raw = match self.store_value(&self.reclaim(source), vt, &value.value) {
                    Ok(raw) => raw,
                    Err(e) => {
                        self.drop_empty_tail(item);
                        return Err(e);
                    }
                };
                let tail = item.tail;
                let mut header = self.chunk(tail);
                header.first_value -= 1;
                self.set_slot(tail, header.first_value, Slot::new(value.timestamp, raw));
                self.set_chunk(tail, &header);
                item.values_total += 1;
            }
            count -= copy;
        }
        Ok(())
    }

    fn drop_empty_tail(&self, item: &mut ItemRecord) {
        if item.tail != NULL {
            let header = self.chunk(item.tail);
            if header.first_value > header.last_value {
                let tail = item.tail;
                self.remove_chunk(item, tail);
            }
        }
    }

    /// Cached values in `(start, end]`, newest first, up to `limit` values.
    pub(crate) fn collect_values(
        &self,
        item: &ItemRecord,
        start: Timespec,
        end: Timespec,
        limit: Option<usize>,
    ) -> Vec<HistoryRecord> {
        let mut out = Vec::new();
        let Some((mut chunk, mut index)) = self.last_value_before(item, end) else {
            return out;
        };
        let vt = item.value_type();

        loop {
            let header = self.chunk(chunk);
            if self.slot(chunk, header.last_value).timestamp() <= start {
                break;
            }
            loop {
                let slot = self.slot(chunk, index);
                if slot.timestamp() <= start {
                    break;
                }
                out.push(self.load_record(vt, &slot));
                if limit.is_some_and(|limit| out.len() >= limit) {
                    return out;
                }
                if index == header.first_value {
                    break;
                }
                index -= 1;
            }
            if header.prev == NULL {
                break;
            }
            chunk = header.prev;
            index = self.chunk(chunk).last_value;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::segment::{MIN_SIZE, Segment};
    use crate::value::{HistoryValue, ValueType};

    fn rec(sec: i64, ns: i32, v: u64) -> HistoryRecord {
        HistoryRecord::new(Timespec::new(sec, ns), HistoryValue::Uint(v))
    }

    fn new_item(shared: &Shared<'_>, itemid: u64, vt: ValueType) -> Offset {
        shared.items().insert(&shared.arena(), &ItemRecord::new(itemid, vt)).unwrap()
    }

    /// Cached timestamps, oldest first.
    fn timestamps(shared: &Shared<'_>, item: &ItemRecord) -> Vec<(i64, i32)> {
        let mut out = Vec::new();
        let mut chunk = item.tail;
        while chunk != NULL {
            let header = shared.chunk(chunk);
            for i in header.first_value..=header.last_value {
                let slot = shared.slot(chunk, i);
                out.push((slot.sec, slot.ns));
            }
            chunk = header.next;
        }
        out
    }

    #[test]
    fn test_slot_count() {
        let mut item = ItemRecord::new(1, ValueType::Uint);
        assert_eq!(slot_count(&item, 1), MIN_CHUNK_RECORDS);
        item.values_total = 99;
        assert_eq!(slot_count(&item, 1), 10);
        // sqrt(10000) = 100 would need 101 chunks, so grow the chunks instead.
        item.values_total = 10_000;
        assert_eq!(slot_count(&item, 0), 312);
        item.values_total = 100_000_000;
        assert_eq!(slot_count(&item, 0), MAX_CHUNK_RECORDS);
    }

    #[test]
    fn test_append_and_shift() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 1, ValueType::Uint);
        let mut item = shared.read_item(off);

        for sec in [10, 20, 30, 40, 50] {
            shared.add_value_at_head(&mut item, off, &rec(sec, 0, sec as u64)).unwrap();
        }
        assert_eq!(item.values_total, 5);
        assert!(shared.chunk_count(&item) > 1);

        // Older than the head but newer than the tail: shifted into place.
        shared.add_value_at_head(&mut item, off, &rec(25, 0, 25)).unwrap();
        shared.add_value_at_head(&mut item, off, &rec(30, 5, 31)).unwrap();
        assert_eq!(
            timestamps(&shared, &item),
            vec![(10, 0), (20, 0), (25, 0), (30, 0), (30, 5), (40, 0), (50, 0)]
        );
        assert_eq!(item.values_total, 7);
    }

    #[test]
    fn test_value_older_than_tail_sets_write_boundary() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 7, ValueType::Uint);
        let mut item = shared.read_item(off);

        shared.add_values_at_tail(&mut item, off, &[rec(50, 5, 1), rec(100, 0, 2)]).unwrap();
        item.db_cached_from = 40;

        shared.add_value_at_head(&mut item, off, &rec(50, 1, 3)).unwrap();
        assert_eq!(timestamps(&shared, &item), vec![(100, 0)]);
        assert_eq!(item.db_cached_from, 51);
        assert_eq!(item.values_total, 1);
        assert_eq!(item.state & REMOVE_PENDING, 0);
    }

    #[test]
    fn test_boundary_that_empties_item_schedules_removal() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 8, ValueType::Uint);
        let mut item = shared.read_item(off);

        shared.add_value_at_head(&mut item, off, &rec(100, 5, 1)).unwrap();
        shared.add_value_at_head(&mut item, off, &rec(100, 2, 2)).unwrap();
        assert_eq!(item.head, NULL);
        assert_eq!(item.values_total, 0);
        assert_ne!(item.state & REMOVE_PENDING, 0);
    }

    #[test]
    fn test_empty_item_ignores_value_before_boundary() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 9, ValueType::Uint);
        let mut item = shared.read_item(off);
        item.db_cached_from = 900;

        shared.add_value_at_head(&mut item, off, &rec(800, 0, 1)).unwrap();
        assert_eq!(item.head, NULL);
        assert_eq!(item.db_cached_from, 900);

        shared.add_value_at_head(&mut item, off, &rec(900, 0, 2)).unwrap();
        assert_eq!(timestamps(&shared, &item), vec![(900, 0)]);
    }

    #[test]
    fn test_tail_skips_cached_seconds() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 1, ValueType::Uint);
        let mut item = shared.read_item(off);

        shared.add_values_at_tail(&mut item, off, &[rec(20, 0, 1), rec(30, 0, 2)]).unwrap();
        shared
            .add_values_at_tail(
                &mut item,
                off,
                &[rec(5, 0, 0), rec(10, 0, 0), rec(20, 0, 1), rec(20, 7, 9), rec(30, 0, 2)],
            )
            .unwrap();
        assert_eq!(
            timestamps(&shared, &item),
            vec![(5, 0), (10, 0), (20, 0), (30, 0)]
        );
        assert_eq!(item.values_total, 4);
    }

    #[test]
    fn test_last_value_before_and_collect() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 1, ValueType::Uint);
        let mut item = shared.read_item(off);

        let values: Vec<_> = (1..=20).map(|s| rec(s * 10, 0, s as u64)).collect();
        shared.add_values_at_tail(&mut item, off, &values).unwrap();

        assert!(shared.last_value_before(&item, Timespec::new(9, 0)).is_none());
        let (chunk, index) = shared.last_value_before(&item, Timespec::new(55, 0)).unwrap();
        assert_eq!(shared.slot(chunk, index).sec, 50);
        let (chunk, index) = shared.last_value_before(&item, Timespec::new(500, 0)).unwrap();
        assert_eq!(shared.slot(chunk, index).sec, 200);

        let got = shared.collect_values(&item, Timespec::new(50, 0), Timespec::new(100, 0), None);
        let secs: Vec<i64> = got.iter().map(|r| r.timestamp.sec).collect();
        assert_eq!(secs, vec![100, 90, 80, 70, 60]);

        let got = shared.collect_values(&item, Timespec::default(), Timespec::new(100, 0), Some(3));
        let secs: Vec<i64> = got.iter().map(|r| r.timestamp.sec).collect();
        assert_eq!(secs, vec![100, 90, 80]);
    }

    #[test]
    fn test_last_value_before_within_second() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 1, ValueType::Uint);
        let mut item = shared.read_item(off);

        let values = [rec(10, 0, 0), rec(10, 5, 1), rec(10, 9, 2), rec(20, 0, 3)];
        shared.add_values_at_tail(&mut item, off, &values).unwrap();

        let cases = [((10, 0), (10, 0)), ((10, 6), (10, 5)), ((19, 0), (10, 9)), ((20, 0), (20, 0))];
        for ((sec, ns), expected) in cases {
            let ts = Timespec::new(sec, ns);
            let (chunk, index) = shared.last_value_before(&item, ts).unwrap();
            let found = shared.slot(chunk, index).timestamp();
            assert_eq!((found.sec, found.ns), expected, "at {ts}");
        }
    }

    #[test]
    fn test_clean_cache_keeps_second_groups_together() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 1, ValueType::Uint);
        let mut item = shared.read_item(off);

        // Two-slot chunks: [10.0 10.1] [10.2 20.0] [30.0 40.0] ...
        for (sec, ns) in [(10, 0), (10, 1), (10, 2), (20, 0), (30, 0), (40, 0)] {
            shared.add_value_at_head(&mut item, off, &rec(sec, ns, 0)).unwrap();
        }
        item.active_range = 25;
        shared.clean_cache(&mut item, 40);

        assert_eq!(timestamps(&shared, &item), vec![(20, 0), (30, 0), (40, 0)]);
        assert_eq!(item.db_cached_from, 11);
    }

    #[test]
    fn test_clean_cache_stops_at_whole_second_chunk() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 1, ValueType::Uint);
        let mut item = shared.read_item(off);

        // [5.0 10.0] [10.1 10.2] [10.3 ...]
        for (sec, ns) in [(5, 0), (10, 0), (10, 1), (10, 2), (10, 3), (90, 0)] {
            shared.add_value_at_head(&mut item, off, &rec(sec, ns, 0)).unwrap();
        }
        item.active_range = 10;
        shared.clean_cache(&mut item, 90);

        let secs: Vec<i64> = timestamps(&shared, &item).iter().map(|t| t.0).collect();
        assert_eq!(secs.iter().filter(|&&s| s == 10).count(), 4);
    }

    #[test]
    fn test_free_cache_releases_strings() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let off = new_item(&shared, 1, ValueType::Str);
        let mut item = shared.read_item(off);
        let used = shared.arena().stats().used_chunks;

        for sec in 1..10 {
            let value = HistoryRecord::new(Timespec::new(sec, 0), HistoryValue::Str(format!("v{sec}")));
            shared.add_value_at_head(&mut item, off, &value).unwrap();
        }
        assert_eq!(shared.strpool().len(), 9);
        assert!(shared.free_cache(&mut item) > 0);
        assert_eq!(shared.strpool().len(), 0);
        assert_eq!(item.values_total, 0);
        assert_eq!(shared.arena().stats().used_chunks, used);
    }
}
