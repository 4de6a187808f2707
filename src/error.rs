//! Error types for value cache operations.
//!
//! Internal degradation (eviction, low-memory mode, per-item removal) is not
//! reported through these types. Callers only see an error when the request
//! itself cannot be answered.

use crate::value::ValueType;

/// Errors that can occur during value cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The requested segment size is outside the supported range.
    #[error("invalid cache size {size}: must be between {min} and {max} bytes")]
    InvalidSize {
        /// The requested size.
        size: usize,
        /// Smallest accepted size.
        min: usize,
        /// Largest accepted size.
        max: usize,
    },

    /// Mapping the shared memory segment failed.
    #[error("cannot map shared memory segment: {0}")]
    Mmap(#[source] std::io::Error),

    /// A pthread call on the process-shared mutex failed.
    #[error("process mutex error: {}", os_error(.0))]
    Lock(i32),

    /// The arena is exhausted even after releasing space.
    #[error("value cache is out of memory")]
    OutOfMemory,

    /// A value of a different type than the cached item was supplied.
    #[error("value type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Value type of the cached item.
        expected: ValueType,
        /// Value type of the offending value.
        found: ValueType,
    },

    /// Raw value type tag is not a known [`ValueType`].
    #[error("unsupported value type {0}")]
    UnsupportedValueType(u8),

    /// The cache is disabled for this process.
    #[error("value cache is disabled")]
    Disabled,

    /// The backing history store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn os_error(code: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*code)
}

/// Result type for value cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Failure reported by a [`HistoryStore`](crate::HistoryStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("history store error: {message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    /// Create a store error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Configuration loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML for [`Config`](crate::Config).
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value parsed but is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}
