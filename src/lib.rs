//! Shared-memory cache of recent item history with read-through backfill.
//!
//! Worker processes share one memory segment holding the most recent values
//! of monitored items. Requests are answered from the segment when it covers
//! them. Otherwise the missing range is read from the [`HistoryStore`],
//! stored, and served. New values are written to the store and then appended
//! to the items already cached.
//!
//! # Architecture
//!
//! ```text
//! +----------------------------------------------+
//! |  Segment (MAP_SHARED, inherited over fork)   |
//! |                                              |
//! |  +----------------------------------------+  |
//! |  | process-shared mutex | cache header    |  |
//! |  +----------------------------------------+  |
//! |  | Arena (boundary-tag free lists)        |  |
//! |  |                                        |  |
//! |  |  Items: itemid -> ItemRecord           |  |
//! |  |     |                                  |  |
//! |  |     v                                  |  |
//! |  |  tail chunk <-> ... <-> head chunk     |  |
//! |  |  (oldest)                  (newest)    |  |
//! |  |                                        |  |
//! |  |  StrPool: refcounted string/log data   |  |
//! |  +----------------------------------------+  |
//! +----------------------------------------------+
//! ```
//!
//! When the arena runs out of space, items that were not requested within
//! the last day are evicted first. If that is not enough the cache enters
//! low memory mode and stops admitting new items for a day.
//!
//! # Example
//!
//! ```ignore
//! use valuecache::{HistoryValue, ItemValue, MemoryHistory, Timespec, ValueCache, ValueType};
//!
//! let cache = ValueCache::<MemoryHistory>::builder()
//!     .size(64 * 1024 * 1024)
//!     .build(MemoryHistory::new())?;
//!
//! let ts = Timespec::new(1_700_000_000, 0);
//! cache.add_values(&[ItemValue::new(42, ts, HistoryValue::Float(0.5))])?;
//!
//! // Last hour of item 42, newest first.
//! let values = cache.get_values(42, ValueType::Float, 3600, 0, ts)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod arena;
mod cache;
mod chunk;
mod clock;
mod config;
mod engine;
mod error;
mod eviction;
mod item;
mod lock;
mod record;
mod segment;
mod shared;
mod store;
mod strpool;
mod table;
mod value;

pub mod logging;
pub mod metrics;

pub use arena::MemStats;
pub use cache::{CacheStats, DiagStats, ValueCache, ValueCacheBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, Config, LogFormat, LoggingConfig, parse_size};
pub use error::{CacheError, CacheResult, ConfigError, StoreError};
pub use item::{ItemSnapshot, ItemStats};
pub use segment::{MAX_SIZE, MIN_SIZE};
pub use shared::CacheMode;
pub use store::{HistoryStore, MemoryHistory};
pub use value::{HistoryRecord, HistoryValue, ItemValue, LogValue, Timespec, ValueType};
