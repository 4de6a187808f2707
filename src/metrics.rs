//! Process-local value cache metrics.
//!
//! These mirror the counters kept in the shared segment for the calling
//! process only. Render them with [`prometheus_text`].

use std::fmt::Write;

use metriken::{Counter, Gauge, metric};

/// Values served from the cache.
#[metric(name = "valuecache_hits")]
pub static HITS: Counter = Counter::new();

/// Values read from the history store.
#[metric(name = "valuecache_misses")]
pub static MISSES: Counter = Counter::new();

/// History store reads issued by the cache.
#[metric(name = "valuecache_store_reads")]
pub static STORE_READS: Counter = Counter::new();

/// Items dropped to reclaim space.
#[metric(name = "valuecache_items_evicted")]
pub static ITEMS_EVICTED: Counter = Counter::new();

/// Transitions into low memory mode.
#[metric(name = "valuecache_low_memory_entered")]
pub static LOW_MEMORY_ENTERED: Counter = Counter::new();

/// Cached items, refreshed by diagnostics calls.
#[metric(name = "valuecache_items")]
pub static ITEMS: Gauge = Gauge::new();

/// Prometheus text exposition of every registered counter and gauge.
pub fn prometheus_text() -> String {
    let mut output = String::with_capacity(1024);

    for metric in metriken::metrics().iter() {
        let name = metric.name();
        if name.is_empty() {
            continue;
        }
        let Some(value) = metric.value() else {
            continue;
        };

        let prom_name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        // Writing to a String cannot fail.
        let _ = match value {
            metriken::Value::Counter(v) => {
                writeln!(output, "# TYPE {prom_name} counter\n{prom_name} {v}")
            }
            metriken::Value::Gauge(v) => {
                writeln!(output, "# TYPE {prom_name} gauge\n{prom_name} {v}")
            }
            _ => Ok(()),
        };
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_text_lists_cache_metrics() {
        STORE_READS.increment();
        ITEMS.set(3);
        let text = prometheus_text();
        assert!(text.contains("# TYPE valuecache_store_reads counter"));
        assert!(text.contains("# TYPE valuecache_items gauge"));
        assert!(text.contains("valuecache_hits "));
    }
}
