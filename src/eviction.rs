//! Space reclamation and low memory mode.
//!
//! When an allocation fails the cache first drops items nobody asked for in
//! a day. If that does not free enough it switches to low memory mode and
//! drops the items with the fewest hits per cached value until the request
//! is covered. Items in use are never dropped.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::arena::Alloc;
use crate::item::Items;
use crate::metrics;
use crate::segment::Offset;
use crate::shared::{CacheMode, Shared};

/// Items idle for longer than this are dropped first.
const ITEM_EXPIRE_PERIOD: i64 = 24 * 3600;
/// Seconds between low memory warnings.
const LOW_MEMORY_WARNING_PERIOD: i64 = 5 * 60;
/// Seconds after the last shortage before normal mode resumes.
const LOW_MEMORY_RESET_PERIOD: i64 = 24 * 3600;
/// Items listed in the low memory report.
const LOW_MEMORY_ITEM_PRINT_LIMIT: usize = 25;

impl Shared<'_> {
    /// Free the item at `off` with all of its values. Returns the bytes freed.
    pub(crate) fn remove_item(&self, off: Offset) -> usize {
        let mut item = self.read_item(off);
        let freed = self.free_cache(&mut item) + Items::record_size();
        self.items().remove(off);
        self.arena().free(off);
        freed
    }

    /// Drop items idle for a day. `source` and referenced items are kept.
    fn release_unused_items(&self, source: Offset) -> usize {
        let expire = self.now() - ITEM_EXPIRE_PERIOD;
        let mut freed = 0;
        for off in self.items().offsets() {
            if off == source {
                continue;
            }
            let item = self.read_item(off);
            if item.refcount == 0 && item.last_accessed != 0 && item.last_accessed < expire {
                freed += self.remove_item(off);
                metrics::ITEMS_EVICTED.increment();
            }
        }
        freed
    }

    /// Free at least `space` bytes, or `min_free_request` if larger.
    ///
    /// `source` is the item being modified and is never dropped.
    pub(crate) fn release_space(&self, source: Offset, space: usize) {
        let space = (space as u64).max(self.header().min_free_request) as usize;

        let mut freed = self.release_unused_items(source);
        if freed >= space {
            debug!(freed, "released idle value cache items");
            return;
        }

        let now = self.now();
        if self.mode() == CacheMode::Normal {
            metrics::LOW_MEMORY_ENTERED.increment();
            warn!("value cache switched to low memory mode");
        }
        self.update_header(|h| {
            h.set_mode(CacheMode::LowMemory);
            h.mode_time = now;
        });
        self.warn_low_memory();

        let mut candidates: Vec<(f64, Offset)> = self
            .items()
            .offsets()
            .into_iter()
            .filter(|&off| off != source)
            .filter_map(|off| {
                let item = self.read_item(off);
                (item.refcount == 0).then(|| (item.weight(), off))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        for (_, off) in candidates {
            if freed >= space {
                break;
            }
            freed += self.remove_item(off);
            metrics::ITEMS_EVICTED.increment();
        }
        debug!(freed, requested = space, "released value cache space");
    }

    /// Throttled low memory report, or the switch back to normal mode once
    /// no shortage happened for a day.
    pub(crate) fn warn_low_memory(&self) {
        let now = self.now();
        let header = self.header();

        if now - header.mode_time > LOW_MEMORY_RESET_PERIOD {
            self.update_header(|h| {
                h.set_mode(CacheMode::Normal);
                h.mode_time = now;
            });
            warn!("value cache has been switched from low memory to normal operation mode");
        } else if now - header.last_warning_time > LOW_MEMORY_WARNING_PERIOD {
            self.update_header(|h| h.last_warning_time = now);
            self.dump_items_statistics();
            self.arena().dump_stats();
            warn!("value cache is fully used: please increase the value cache size");
        }
    }

    /// Log the items holding the most values.
    fn dump_items_statistics(&self) {
        warn!("=== most used items statistics for value cache ===");

        let mut items: Vec<_> = self
            .items()
            .offsets()
            .into_iter()
            .map(|off| self.read_item(off))
            .collect();
        let total: u64 = items.iter().map(|item| item.values_total).sum();
        items.sort_by(|a, b| b.values_total.cmp(&a.values_total));

        for item in items.iter().take(LOW_MEMORY_ITEM_PRINT_LIMIT) {
            let perc = if total == 0 {
                0.0
            } else {
                100.0 * item.values_total as f64 / total as f64
            };
            warn!(
                "itemid:{} active range:{} hits:{} count:{} perc:{:.6}%",
                item.itemid, item.active_range, item.hits, item.values_total, perc
            );
        }

        warn!("==================================================");
    }
}
