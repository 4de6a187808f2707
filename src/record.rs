//! Encoding of history values into chunk slots.
//!
//! A slot keeps the timestamp and one 64-bit word. Numeric values are stored
//! inline (floats as their IEEE bits, so no precision is lost). Strings are
//! string pool offsets and log values point at a [`LogRecord`] whose text
//! fields are pooled independently.

use crate::arena::Alloc;
use crate::error::{CacheError, CacheResult};
use crate::segment::{NULL, Offset, Pod};
use crate::shared::Shared;
use crate::value::{HistoryRecord, HistoryValue, LogValue, Timespec, ValueType};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Slot {
    pub(crate) sec: i64,
    pub(crate) ns: i32,
    _pad: u32,
    pub(crate) value: u64,
}

unsafe impl Pod for Slot {}

impl Slot {
    pub(crate) fn new(ts: Timespec, value: u64) -> Self {
        Self {
            sec: ts.sec,
            ns: ts.ns,
            _pad: 0,
            value,
        }
    }

    #[inline]
    pub(crate) fn timestamp(&self) -> Timespec {
        Timespec::new(self.sec, self.ns)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct LogRecord {
    timestamp: i32,
    logeventid: i32,
    severity: i32,
    _pad: u32,
    source: Offset,
    value: Offset,
}

unsafe impl Pod for LogRecord {}

const LOG_RECORD_SIZE: usize = size_of::<LogRecord>();

impl Shared<'_> {
    /// Encode `value` for an item of type `vt`.
    pub(crate) fn store_value(
        &self,
        alloc: &impl Alloc,
        vt: ValueType,
        value: &HistoryValue,
    ) -> CacheResult<u64> {
        let strpool = self.strpool();
        match (vt, value) {
            (ValueType::Float, HistoryValue::Float(v)) => Ok(v.to_bits()),
            (ValueType::Uint, HistoryValue::Uint(v)) => Ok(*v),
            (ValueType::Str, HistoryValue::Str(s)) | (ValueType::Text, HistoryValue::Text(s)) => {
                strpool
                    .intern(alloc, s.as_bytes())
                    .ok_or(CacheError::OutOfMemory)
            }
            (ValueType::Log, HistoryValue::Log(log)) => {
                let source = match &log.source {
                    Some(source) => strpool
                        .intern(alloc, source.as_bytes())
                        .ok_or(CacheError::OutOfMemory)?,
                    None => NULL,
                };
                let Some(text) = strpool.intern(alloc, log.value.as_bytes()) else {
                    strpool.release(source);
                    return Err(CacheError::OutOfMemory);
                };
                let Some(off) = alloc.alloc(LOG_RECORD_SIZE) else {
                    strpool.release(source);
                    strpool.release(text);
                    return Err(CacheError::OutOfMemory);
                };
                self.seg.write(
                    off,
                    LogRecord {
                        timestamp: log.timestamp,
                        logeventid: log.logeventid,
                        severity: log.severity,
                        _pad: 0,
                        source,
                        value: text,
                    },
                );
                Ok(off)
            }
            (expected, value) => Err(CacheError::TypeMismatch {
                expected,
                found: value.value_type(),
            }),
        }
    }

    /// Decode a slot word of type `vt`.
    pub(crate) fn load_value(&self, vt: ValueType, raw: u64) -> HistoryValue {
        let strpool = self.strpool();
        match vt {
            ValueType::Float => HistoryValue::Float(f64::from_bits(raw)),
            ValueType::Uint => HistoryValue::Uint(raw),
            ValueType::Str => HistoryValue::Str(strpool.get(raw)),
            ValueType::Text => HistoryValue::Text(strpool.get(raw)),
            ValueType::Log => {
                let log: LogRecord = self.seg.read(raw);
                HistoryValue::Log(LogValue {
                    timestamp: log.timestamp,
                    logeventid: log.logeventid,
                    severity: log.severity,
                    source: (log.source != NULL).then(|| strpool.get(log.source)),
                    value: strpool.get(log.value),
                })
            }
        }
    }

    pub(crate) fn load_record(&self, vt: ValueType, slot: &Slot) -> HistoryRecord {
        HistoryRecord::new(slot.timestamp(), self.load_value(vt, slot.value))
    }

    /// Release whatever a slot word owns. Returns the bytes freed.
    pub(crate) fn free_value(&self, vt: ValueType, raw: u64) -> usize {
        let strpool = self.strpool();
        match vt {
            ValueType::Float | ValueType::Uint => 0,
            ValueType::Str | ValueType::Text => strpool.release(raw),
            ValueType::Log => {
                if raw == NULL {
                    return 0;
                }
                let log: LogRecord = self.seg.read(raw);
                let freed = strpool.release(log.source) + strpool.release(log.value);
                self.arena().free(raw);
                freed + LOG_RECORD_SIZE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::segment::{MIN_SIZE, Segment};

    fn log(source: Option<&str>, value: &str) -> HistoryValue {
        HistoryValue::Log(LogValue {
            timestamp: 10,
            logeventid: 3,
            severity: 4,
            source: source.map(str::to_owned),
            value: value.to_owned(),
        })
    }

    #[test]
    fn test_numeric_values_are_inline() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let arena = shared.arena();
        let used = arena.stats().used_chunks;

        let raw = shared
            .store_value(&arena, ValueType::Float, &HistoryValue::Float(0.1 + 0.2))
            .unwrap();
        assert_eq!(
            shared.load_value(ValueType::Float, raw),
            HistoryValue::Float(0.1 + 0.2)
        );
        let raw = shared
            .store_value(&arena, ValueType::Uint, &HistoryValue::Uint(u64::MAX))
            .unwrap();
        assert_eq!(shared.load_value(ValueType::Uint, raw), HistoryValue::Uint(u64::MAX));
        assert_eq!(arena.stats().used_chunks, used);
    }

    #[test]
    fn test_strings_share_pool_entries() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let arena = shared.arena();

        let value = HistoryValue::Text("up".into());
        let a = shared.store_value(&arena, ValueType::Text, &value).unwrap();
        let b = shared.store_value(&arena, ValueType::Text, &value).unwrap();
        assert_eq!(a, b);
        assert_eq!(shared.load_value(ValueType::Text, a), value);
        assert_eq!(shared.free_value(ValueType::Text, a), 0);
        assert!(shared.free_value(ValueType::Text, b) > 0);
        assert_eq!(shared.strpool().len(), 0);
    }

    #[test]
    fn test_log_fields_are_pooled_independently() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let arena = shared.arena();
        let used = arena.stats().used_chunks;

        let a = shared
            .store_value(&arena, ValueType::Log, &log(Some("app"), "started"))
            .unwrap();
        let b = shared
            .store_value(&arena, ValueType::Log, &log(None, "started"))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(shared.strpool().len(), 2);
        assert_eq!(shared.load_value(ValueType::Log, a), log(Some("app"), "started"));
        assert_eq!(shared.load_value(ValueType::Log, b), log(None, "started"));

        shared.free_value(ValueType::Log, a);
        assert_eq!(shared.strpool().len(), 1);
        shared.free_value(ValueType::Log, b);
        assert_eq!(shared.strpool().len(), 0);
        assert_eq!(arena.stats().used_chunks, used);
    }

    #[test]
    fn test_type_mismatch() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let clock = ManualClock::new(0);
        let shared = Shared::init(&seg, &clock).unwrap();
        let err = shared
            .store_value(&shared.arena(), ValueType::Uint, &HistoryValue::Str("x".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::TypeMismatch {
                expected: ValueType::Uint,
                found: ValueType::Str
            }
        ));
    }
}
