//! Cache-wide state living in the segment header.

use std::fmt;

use crate::arena::{Alloc, Arena};
use crate::clock::Clock;
use crate::error::{CacheError, CacheResult};
use crate::item::{ItemRecord, Items};
use crate::segment::{CACHE_HEADER, Offset, Pod, Segment};
use crate::strpool::StrPool;

const STRPOOL_INIT_SIZE: usize = 1000;
const ITEMS_INIT_SIZE: usize = 1000;
const MAX_FREE_REQUEST: u64 = 128 * 1024;

/// Operating mode of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// New items are admitted.
    #[default]
    Normal,
    /// Idle eviction could not satisfy an allocation. No new items are
    /// admitted until the mode resets.
    LowMemory,
}

impl CacheMode {
    fn from_raw(raw: u32) -> Self {
        if raw == 1 {
            CacheMode::LowMemory
        } else {
            CacheMode::Normal
        }
    }

    fn as_raw(self) -> u32 {
        match self {
            CacheMode::Normal => 0,
            CacheMode::LowMemory => 1,
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMode::Normal => f.write_str("normal"),
            CacheMode::LowMemory => f.write_str("low memory"),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CacheHeader {
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    mode: u32,
    _pad: u32,
    pub(crate) mode_time: i64,
    pub(crate) last_warning_time: i64,
    pub(crate) min_free_request: u64,
}

unsafe impl Pod for CacheHeader {}

impl CacheHeader {
    pub(crate) fn mode(&self) -> CacheMode {
        CacheMode::from_raw(self.mode)
    }

    pub(crate) fn set_mode(&mut self, mode: CacheMode) {
        self.mode = mode.as_raw();
    }
}

/// Everything needed to operate on the cache structures.
///
/// Only constructed while the segment mutex is held.
#[derive(Clone, Copy)]
pub(crate) struct Shared<'a> {
    pub(crate) seg: &'a Segment,
    clock: &'a dyn Clock,
}

impl<'a> Shared<'a> {
    pub(crate) fn new(seg: &'a Segment, clock: &'a dyn Clock) -> Self {
        Self { seg, clock }
    }

    /// Lay out the arena, both tables and the counters in a fresh segment.
    pub(crate) fn init(seg: &'a Segment, clock: &'a dyn Clock) -> CacheResult<Self> {
        let shared = Self::new(seg, clock);
        let arena = Arena::init(seg);
        if !shared.strpool().create(&arena, STRPOOL_INIT_SIZE)
            || !shared.items().create(&arena, ITEMS_INIT_SIZE)
        {
            return Err(CacheError::OutOfMemory);
        }

        let min_free_request = ((seg.size() as u64) * 5 / 100).min(MAX_FREE_REQUEST);
        shared.seg.write(
            CACHE_HEADER,
            CacheHeader {
                min_free_request,
                ..CacheHeader::default()
            },
        );
        Ok(shared)
    }

    #[inline]
    pub(crate) fn now(&self) -> i64 {
        self.clock.now()
    }

    #[inline]
    pub(crate) fn arena(&self) -> Arena<'a> {
        Arena::new(self.seg)
    }

    #[inline]
    pub(crate) fn items(&self) -> Items<'a> {
        Items::new(self.seg)
    }

    #[inline]
    pub(crate) fn strpool(&self) -> StrPool<'a> {
        StrPool::new(self.seg)
    }

    #[inline]
    pub(crate) fn header(&self) -> CacheHeader {
        self.seg.read(CACHE_HEADER)
    }

    pub(crate) fn update_header(&self, f: impl FnOnce(&mut CacheHeader)) {
        let mut h = self.header();
        f(&mut h);
        self.seg.write(CACHE_HEADER, h);
    }

    #[inline]
    pub(crate) fn mode(&self) -> CacheMode {
        self.header().mode()
    }

    #[inline]
    pub(crate) fn read_item(&self, off: Offset) -> ItemRecord {
        self.seg.read(off)
    }

    #[inline]
    pub(crate) fn write_item(&self, off: Offset, item: &ItemRecord) {
        self.seg.write(off, *item)
    }

    pub(crate) fn update_item<T>(&self, off: Offset, f: impl FnOnce(&mut ItemRecord) -> T) -> T {
        let mut item = self.read_item(off);
        let out = f(&mut item);
        self.write_item(off, &item);
        out
    }

    /// Drop every item and string and zero the counters.
    ///
    /// Items still referenced by an in-flight operation are only flagged
    /// for removal and disappear when that operation lets go of them.
    pub(crate) fn reset(&self) {
        for off in self.items().offsets() {
            self.invalidate(off);
        }
        self.update_header(|h| {
            h.hits = 0;
            h.misses = 0;
            h.set_mode(CacheMode::Normal);
            h.mode_time = 0;
            h.last_warning_time = 0;
        });
    }

    /// Arena allocation that frees other items' data when the heap is full.
    #[inline]
    pub(crate) fn reclaim(&self, source: Offset) -> Reclaim<'_, 'a> {
        Reclaim {
            shared: self,
            source,
        }
    }
}

/// Allocator that falls back to [`Shared::release_space`] once per request.
///
/// `source` is the item being modified; it is never evicted to satisfy its
/// own allocation.
pub(crate) struct Reclaim<'s, 'a> {
    shared: &'s Shared<'a>,
    source: Offset,
}

impl Alloc for Reclaim<'_, '_> {
    fn alloc(&self, size: usize) -> Option<Offset> {
        let arena = self.shared.arena();
        arena.alloc(size).or_else(|| {
            self.shared.release_space(self.source, size);
            arena.alloc(size)
        })
    }

    fn realloc(&self, off: Offset, size: usize) -> Option<Offset> {
        let arena = self.shared.arena();
        arena.realloc(off, size).or_else(|| {
            self.shared.release_space(self.source, size);
            arena.realloc(off, size)
        })
    }

    fn free(&self, off: Offset) {
        self.shared.arena().free(off)
    }
}
