//! The value cache handle.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::arena::MemStats;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::item::{ItemGuard, ItemRecord, ItemSnapshot, ItemStats, REMOVE_PENDING, STATUS_CACHED_ALL};
use crate::lock::LockGuard;
use crate::metrics;
use crate::segment::{Segment, format_bytes};
use crate::shared::{CacheMode, Shared};
use crate::store::{self, HistoryStore};
use crate::value::{HistoryRecord, ItemValue, Timespec, ValueType};

/// Cache-wide counters as reported by [`ValueCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Values served from the cache.
    pub hits: u64,
    /// Values read from the history store.
    pub misses: u64,
    /// Current operating mode.
    pub mode: CacheMode,
    /// Arena size in bytes.
    pub total_size: u64,
    /// Free arena bytes.
    pub free_size: u64,
}

/// Summary for diagnostics endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagStats {
    /// Cached items.
    pub items_num: u64,
    /// Cached values over all items.
    pub values_num: u64,
    /// Operating mode, `None` when the handle is disabled.
    pub mode: Option<CacheMode>,
}

/// Builder for [`ValueCache`].
pub struct ValueCacheBuilder {
    size: usize,
    enabled: bool,
    clock: Arc<dyn Clock>,
}

impl Default for ValueCacheBuilder {
    fn default() -> Self {
        let config = CacheConfig::default();
        Self {
            size: config.size,
            enabled: config.enabled,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ValueCacheBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the segment size in bytes (default 8MB).
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set whether the handle starts enabled (default true).
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the time source (default [`SystemClock`]).
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Map the segment and lay out an empty cache in it.
    pub fn build<S: HistoryStore>(self, store: S) -> CacheResult<ValueCache<S>> {
        let segment = Segment::create(self.size)?;
        Shared::init(&segment, &*self.clock)?;
        info!(
            size = %format_bytes(segment.size()),
            enabled = self.enabled,
            "value cache initialized"
        );

        Ok(ValueCache {
            segment: Arc::new(segment),
            store: Arc::new(store),
            clock: self.clock,
            enabled: Cell::new(self.enabled),
            enabled_default: self.enabled,
            locked: Cell::new(false),
        })
    }
}

/// A per-process handle to the shared value cache.
///
/// The segment is shared with every handle made by [`attach`](Self::attach)
/// and with forked children. Each handle carries its own enable flag and
/// batch lock state, so a handle is not shared between threads: attach one
/// per worker instead.
///
/// Every operation takes the segment lock for its duration unless the
/// handle holds the batch lock taken with [`lock`](Self::lock).
pub struct ValueCache<S> {
    segment: Arc<Segment>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    enabled: Cell<bool>,
    enabled_default: bool,
    locked: Cell<bool>,
}

impl<S: HistoryStore> ValueCache<S> {
    /// Create a builder.
    pub fn builder() -> ValueCacheBuilder {
        ValueCacheBuilder::new()
    }

    /// Create a cache sized and enabled according to `config`.
    pub fn new(config: &CacheConfig, store: S) -> CacheResult<Self> {
        ValueCacheBuilder::new()
            .size(config.size)
            .enabled(config.enabled)
            .build(store)
    }

    /// Another handle to the same cache, unlocked and enabled as configured.
    pub fn attach(&self) -> Self {
        Self {
            segment: Arc::clone(&self.segment),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            enabled: Cell::new(self.enabled_default),
            enabled_default: self.enabled_default,
            locked: Cell::new(false),
        }
    }

    /// Release this handle. The segment is unmapped with the last handle and
    /// its lock destroyed by the process that created it.
    pub fn destroy(self) {
        info!("value cache handle destroyed");
    }

    /// The backing history store.
    pub fn store(&self) -> &S {
        &self.store
    }

    #[inline]
    fn shared(&self) -> Shared<'_> {
        Shared::new(&self.segment, &*self.clock)
    }

    #[inline]
    fn guard(&self) -> CacheResult<LockGuard> {
        LockGuard::acquire(self.segment.mutex(), self.locked.get())
    }

    /// Drop every item, zero the counters and return to normal mode.
    pub fn reset(&self) -> CacheResult<()> {
        let _lock = self.guard()?;
        self.shared().reset();
        info!("value cache reset");
        Ok(())
    }

    /// Use the cache for requests made through this handle.
    pub fn enable(&self) {
        self.enabled.set(true);
    }

    /// Send requests made through this handle straight to the store.
    pub fn disable(&self) {
        self.enabled.set(false);
    }

    /// Whether requests through this handle use the cache.
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Take the segment lock until [`unlock`](Self::unlock).
    ///
    /// Operations on this handle run inside the batch without locking again,
    /// and store reads happen with the lock held.
    pub fn lock(&self) -> CacheResult<()> {
        if self.locked.get() {
            return Ok(());
        }
        self.segment.mutex().lock()?;
        self.locked.set(true);
        Ok(())
    }

    /// Release the batch lock.
    pub fn unlock(&self) -> CacheResult<()> {
        if !self.locked.replace(false) {
            return Ok(());
        }
        self.segment.mutex().unlock()
    }

    /// Write values to the store, then to the cached items they belong to.
    ///
    /// A store failure fails the whole batch before anything is cached.
    pub fn add_values(&self, values: &[ItemValue]) -> CacheResult<()> {
        self.store.append(values)?;

        if !self.enabled.get() || values.is_empty() {
            return Ok(());
        }

        let _lock = self.guard()?;
        let shared = self.shared();
        for value in values {
            if let Some(off) = shared.items().find(value.itemid) {
                shared.write_through(off, value);
            }
        }
        debug!(values = values.len(), "values added");
        Ok(())
    }

    /// History of `itemid`, newest first.
    ///
    /// With `count == 0` returns the values in `(ts - seconds, ts]`.
    /// Otherwise returns up to `count` values at or before `ts`, no older
    /// than `ts - seconds` when `seconds` is not `0`.
    pub fn get_values(
        &self,
        itemid: u64,
        value_type: ValueType,
        seconds: i64,
        count: usize,
        ts: Timespec,
    ) -> CacheResult<Vec<HistoryRecord>> {
        debug!(itemid, %value_type, count, seconds, end = %ts, "get values");

        if !self.enabled.get() {
            let values = store::get_values_direct(&*self.store, itemid, value_type, seconds, count, ts)?;
            debug!(itemid, values = values.len(), cached = false, "values read");
            return Ok(values);
        }

        let lock = self.guard()?;
        let shared = self.shared();
        if shared.mode() == CacheMode::LowMemory {
            shared.warn_low_memory();
        }

        let cached = self.cached_values(&lock, shared, itemid, value_type, seconds, count, ts)?;
        let used = cached.is_some();
        let values = match cached {
            Some(values) => values,
            None => {
                let values = lock.unlocked(|| {
                    store::get_values_direct(&*self.store, itemid, value_type, seconds, count, ts)
                })??;
                shared.update_statistics(None, 0, values.len() as u64);
                values
            }
        };

        debug!(itemid, values = values.len(), cached = used, "values read");
        Ok(values)
    }

    /// Answer from the cache, or `None` when the store must answer.
    #[allow(clippy::too_many_arguments)]
    fn cached_values(
        &self,
        lock: &LockGuard,
        shared: Shared<'_>,
        itemid: u64,
        value_type: ValueType,
        seconds: i64,
        count: usize,
        ts: Timespec,
    ) -> CacheResult<Option<Vec<HistoryRecord>>> {
        let (off, created) = match shared.items().find(itemid) {
            Some(off) => {
                let item = shared.read_item(off);
                if item.value_type() != value_type {
                    debug!(itemid, cached = %item.value_type(), requested = %value_type, "value type changed");
                    shared.invalidate(off);
                    return Ok(None);
                }
                if item.state & REMOVE_PENDING != 0 {
                    return Ok(None);
                }
                (off, false)
            }
            None => match shared.get_or_create(itemid, value_type) {
                Some(off) => (off, true),
                None => return Ok(None),
            },
        };

        let item = ItemGuard::new(shared, off);
        let result = shared.item_get_values(lock, &*self.store, item.offset(), seconds, count, ts);
        if result.is_err() && created {
            // Nothing was cached for it.
            shared.update_item(off, |item| item.state |= REMOVE_PENDING);
        }
        result
    }

    /// The newest value at or before `ts`.
    pub fn get_value(
        &self,
        itemid: u64,
        value_type: ValueType,
        ts: Timespec,
    ) -> CacheResult<Option<HistoryRecord>> {
        Ok(self
            .get_values(itemid, value_type, ts.sec, 1, ts)?
            .into_iter()
            .next())
    }

    /// Drop the listed items. Items in use go once released.
    pub fn remove_items(&self, itemids: &[u64]) -> CacheResult<()> {
        if !self.enabled.get() || itemids.is_empty() {
            return Ok(());
        }

        let _lock = self.guard()?;
        let shared = self.shared();
        for &itemid in itemids {
            if let Some(off) = shared.items().find(itemid) {
                shared.invalidate(off);
            }
        }
        Ok(())
    }

    /// Register items that have no history yet. Returns how many were added.
    ///
    /// Nothing is added in low memory mode. Stops at the first item that
    /// does not fit.
    pub fn add_new_items(&self, items: &[(u64, ValueType)]) -> CacheResult<usize> {
        if !self.enabled.get() {
            return Ok(0);
        }

        let _lock = self.guard()?;
        let shared = self.shared();
        if shared.mode() != CacheMode::Normal {
            return Ok(0);
        }

        let now = shared.now();
        let mut added = 0;
        for &(itemid, value_type) in items {
            if shared.items().find(itemid).is_some() {
                continue;
            }
            let mut item = ItemRecord::new(itemid, value_type);
            item.status = STATUS_CACHED_ALL;
            item.last_accessed = now;
            if shared.items().insert(&shared.arena(), &item).is_none() {
                debug!(itemid, "no space for new item");
                break;
            }
            added += 1;
        }
        Ok(added)
    }

    /// Cache-wide counters. Fails when the handle is disabled.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        if !self.enabled.get() {
            return Err(CacheError::Disabled);
        }

        let _lock = self.guard()?;
        let shared = self.shared();
        let header = shared.header();
        let mem = shared.arena().stats();
        metrics::ITEMS.set(shared.items().len() as i64);

        Ok(CacheStats {
            hits: header.hits,
            misses: header.misses,
            mode: header.mode(),
            total_size: mem.total,
            free_size: mem.free_size,
        })
    }

    /// Item and value totals. Zeroed when the handle is disabled.
    pub fn diag_stats(&self) -> CacheResult<DiagStats> {
        if !self.enabled.get() {
            return Ok(DiagStats::default());
        }

        let _lock = self.guard()?;
        let shared = self.shared();
        let items = shared.items();
        let values_num = items
            .offsets()
            .into_iter()
            .map(|off| shared.read_item(off).values_total)
            .sum();
        metrics::ITEMS.set(items.len() as i64);

        Ok(DiagStats {
            items_num: items.len() as u64,
            values_num,
            mode: Some(shared.mode()),
        })
    }

    /// Arena statistics. Zeroed when the handle is disabled.
    pub fn mem_stats(&self) -> CacheResult<MemStats> {
        if !self.enabled.get() {
            return Ok(MemStats::default());
        }
        let _lock = self.guard()?;
        Ok(self.shared().arena().stats())
    }

    /// Usage of every cached item, in no particular order.
    pub fn item_stats(&self) -> CacheResult<Vec<ItemStats>> {
        if !self.enabled.get() {
            return Ok(Vec::new());
        }
        let _lock = self.guard()?;
        let shared = self.shared();
        Ok(shared
            .items()
            .offsets()
            .into_iter()
            .map(|off| shared.item_stats(off))
            .collect())
    }

    /// The `limit` items holding the most values.
    pub fn top_items(&self, limit: usize) -> CacheResult<Vec<ItemStats>> {
        let mut stats = self.item_stats()?;
        stats.sort_by(|a, b| b.values_num.cmp(&a.values_num));
        stats.truncate(limit);
        Ok(stats)
    }

    /// Metadata of a cached item.
    pub fn item_state(&self, itemid: u64) -> CacheResult<Option<ItemSnapshot>> {
        let _lock = self.guard()?;
        let shared = self.shared();
        Ok(shared.items().find(itemid).map(|off| shared.snapshot(off)))
    }
}

impl<S> Drop for ValueCache<S> {
    fn drop(&mut self) {
        if self.locked.get()
            && let Err(e) = self.segment.mutex().unlock()
        {
            error!("failed to release value cache batch lock: {e}");
        }
    }
}

impl<S> fmt::Debug for ValueCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCache")
            .field("size", &self.segment.size())
            .field("enabled", &self.enabled.get())
            .field("locked", &self.locked.get())
            .finish()
    }
}
