//! History value types shared by the cache and the backing store.

use std::cmp::Ordering;
use std::fmt;

use crate::error::CacheError;

/// Nanoseconds per second, and the exclusive upper bound of [`Timespec::ns`].
pub const NANOS_PER_SEC: i32 = 1_000_000_000;

/// Value type of a monitored item.
///
/// The discriminants match the numbering used by the history tables.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Floating point number.
    Float = 0,
    /// Short character string.
    Str = 1,
    /// Structured log entry.
    Log = 2,
    /// Unsigned 64-bit integer.
    Uint = 3,
    /// Long text.
    Text = 4,
}

impl ValueType {
    /// Raw tag stored in the shared segment.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether values of this type reference the string pool.
    #[inline]
    pub(crate) fn is_pooled(self) -> bool {
        !matches!(self, ValueType::Float | ValueType::Uint)
    }
}

impl TryFrom<u8> for ValueType {
    type Error = CacheError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ValueType::Float),
            1 => Ok(ValueType::Str),
            2 => Ok(ValueType::Log),
            3 => Ok(ValueType::Uint),
            4 => Ok(ValueType::Text),
            other => Err(CacheError::UnsupportedValueType(other)),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Float => "float",
            ValueType::Str => "str",
            ValueType::Log => "log",
            ValueType::Uint => "uint",
            ValueType::Text => "text",
        };
        f.write_str(name)
    }
}

/// A timestamp with nanosecond resolution.
///
/// Ordering compares seconds first, then nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timespec {
    /// Seconds since the Unix epoch.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub ns: i32,
}

impl Timespec {
    /// Create a timestamp.
    pub const fn new(sec: i64, ns: i32) -> Self {
        Self { sec, ns }
    }

    /// Timestamp at the last nanosecond of `sec`.
    pub const fn end_of(sec: i64) -> Self {
        Self {
            sec,
            ns: NANOS_PER_SEC - 1,
        }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.ns)
    }
}

/// A structured log entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogValue {
    /// Timestamp reported by the log source.
    pub timestamp: i32,
    /// Event identifier (Windows event log).
    pub logeventid: i32,
    /// Severity reported by the source.
    pub severity: i32,
    /// Source label, if any.
    pub source: Option<String>,
    /// Message body.
    pub value: String,
}

/// A history value of any supported type.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryValue {
    /// Floating point value.
    Float(f64),
    /// Unsigned integer value.
    Uint(u64),
    /// Short string value.
    Str(String),
    /// Long text value.
    Text(String),
    /// Structured log value.
    Log(LogValue),
}

impl HistoryValue {
    /// The value type this value belongs to.
    pub fn value_type(&self) -> ValueType {
        match self {
            HistoryValue::Float(_) => ValueType::Float,
            HistoryValue::Uint(_) => ValueType::Uint,
            HistoryValue::Str(_) => ValueType::Str,
            HistoryValue::Text(_) => ValueType::Text,
            HistoryValue::Log(_) => ValueType::Log,
        }
    }
}

impl fmt::Display for HistoryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryValue::Float(v) => write!(f, "{v:.6}"),
            HistoryValue::Uint(v) => write!(f, "{v}"),
            HistoryValue::Str(s) | HistoryValue::Text(s) => f.write_str(s),
            HistoryValue::Log(log) => f.write_str(&log.value),
        }
    }
}

/// A timestamped history value.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    /// When the value was collected.
    pub timestamp: Timespec,
    /// The value.
    pub value: HistoryValue,
}

impl HistoryRecord {
    /// Create a record.
    pub fn new(timestamp: Timespec, value: HistoryValue) -> Self {
        Self { timestamp, value }
    }
}

/// A value produced for an item, as passed to the write path.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemValue {
    /// Item identifier.
    pub itemid: u64,
    /// When the value was collected.
    pub timestamp: Timespec,
    /// The value.
    pub value: HistoryValue,
}

impl ItemValue {
    /// Create an item value.
    pub fn new(itemid: u64, timestamp: Timespec, value: HistoryValue) -> Self {
        Self {
            itemid,
            timestamp,
            value,
        }
    }

    /// The history record carried by this value.
    pub fn record(&self) -> HistoryRecord {
        HistoryRecord::new(self.timestamp, self.value.clone())
    }
}

/// Order records newest first.
pub(crate) fn compare_desc(a: &HistoryRecord, b: &HistoryRecord) -> Ordering {
    b.timestamp.cmp(&a.timestamp)
}

/// Order records oldest first.
pub(crate) fn compare_asc(a: &HistoryRecord, b: &HistoryRecord) -> Ordering {
    a.timestamp.cmp(&b.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_roundtrip() {
        for vt in [
            ValueType::Float,
            ValueType::Str,
            ValueType::Log,
            ValueType::Uint,
            ValueType::Text,
        ] {
            assert_eq!(ValueType::try_from(vt.as_u8()).unwrap(), vt);
        }
        assert!(matches!(
            ValueType::try_from(5),
            Err(CacheError::UnsupportedValueType(5))
        ));
    }

    #[test]
    fn test_timespec_ordering() {
        let a = Timespec::new(10, 500);
        let b = Timespec::new(10, 501);
        let c = Timespec::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(Timespec::end_of(10) < c);
        assert_eq!(a.to_string(), "10.000000500");
    }

    #[test]
    fn test_value_type_of_value() {
        assert_eq!(HistoryValue::Float(1.5).value_type(), ValueType::Float);
        assert_eq!(HistoryValue::Text("x".into()).value_type(), ValueType::Text);
        assert_eq!(
            HistoryValue::Log(LogValue::default()).value_type(),
            ValueType::Log
        );
    }

    #[test]
    fn test_float_precision_is_kept() {
        let v = HistoryValue::Float(0.1 + 0.2);
        match v {
            HistoryValue::Float(f) => assert_eq!(f.to_bits(), (0.1f64 + 0.2).to_bits()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_record_sort_helpers() {
        let mut records = vec![
            HistoryRecord::new(Timespec::new(2, 0), HistoryValue::Uint(2)),
            HistoryRecord::new(Timespec::new(1, 5), HistoryValue::Uint(1)),
            HistoryRecord::new(Timespec::new(3, 0), HistoryValue::Uint(3)),
        ];
        records.sort_by(compare_asc);
        assert_eq!(records[0].timestamp, Timespec::new(1, 5));
        records.sort_by(compare_desc);
        assert_eq!(records[0].timestamp, Timespec::new(3, 0));
    }
}
