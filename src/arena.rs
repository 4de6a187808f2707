//! First-fit allocator over the segment heap.
//!
//! Blocks carry a size word at both ends (boundary tags) so neighbours can be
//! coalesced on free in constant time. Free blocks are threaded on a doubly
//! linked list stored in their payload.
//!
//! ```text
//! used:  [size|1][ payload ............ ][size|1]
//! free:  [size|0][next][prev][ ........ ][size|0]
//! ```
//!
//! All sizes are multiples of 8 and include both tags.

use tracing::warn;

use crate::segment::{ARENA_HEADER, HEADER_SIZE, NULL, Offset, Pod, Segment, format_bytes, round_up};

const WORD: u64 = 8;
const TAGS: u64 = 2 * WORD;
const MIN_BLOCK: u64 = 4 * WORD;
const USED: u64 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ArenaHeader {
    heap_start: u64,
    heap_end: u64,
    free_head: u64,
    free_size: u64,
    used_size: u64,
    free_chunks: u64,
    used_chunks: u64,
}

unsafe impl Pod for ArenaHeader {}

/// Arena memory statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    /// Heap bytes managed by the arena (`free_size + used_size`).
    pub total: u64,
    /// Bytes in free blocks.
    pub free_size: u64,
    /// Bytes in allocated blocks.
    pub used_size: u64,
    /// Number of free blocks.
    pub free_chunks: u64,
    /// Number of allocated blocks.
    pub used_chunks: u64,
    /// Largest single free block.
    pub max_free_chunk: u64,
    /// Bytes spent on boundary tags.
    pub overhead: u64,
}

/// Allocation interface used by the cache structures.
///
/// Offsets returned point at the block payload and are never [`NULL`].
pub(crate) trait Alloc {
    fn alloc(&self, size: usize) -> Option<Offset>;
    fn realloc(&self, off: Offset, size: usize) -> Option<Offset>;
    fn free(&self, off: Offset);
}

/// View of the arena inside a segment.
#[derive(Clone, Copy)]
pub(crate) struct Arena<'a> {
    seg: &'a Segment,
}

impl<'a> Arena<'a> {
    pub(crate) fn new(seg: &'a Segment) -> Self {
        Self { seg }
    }

    /// Bytes reserved at the start of the segment before the heap.
    pub(crate) fn required_size() -> usize {
        HEADER_SIZE
    }

    /// Format the heap as a single free block.
    pub(crate) fn init(seg: &'a Segment) -> Self {
        let arena = Self { seg };
        let heap_start = round_up(HEADER_SIZE, WORD as usize) as u64;
        let heap_end = (seg.size() as u64) & !(WORD - 1);
        let size = heap_end - heap_start;

        let mut h = ArenaHeader {
            heap_start,
            heap_end,
            free_head: NULL,
            free_size: size,
            used_size: 0,
            free_chunks: 1,
            used_chunks: 0,
        };
        arena.set_tags(heap_start, size, false);
        arena.push_free(&mut h, heap_start);
        arena.store(&h);
        arena
    }

    #[inline]
    fn load(&self) -> ArenaHeader {
        self.seg.read(ARENA_HEADER)
    }

    #[inline]
    fn store(&self, h: &ArenaHeader) {
        self.seg.write(ARENA_HEADER, *h)
    }

    #[inline]
    fn tag(&self, at: Offset) -> (u64, bool) {
        let word: u64 = self.seg.read(at);
        (word & !USED, word & USED != 0)
    }

    fn set_tags(&self, block: Offset, size: u64, used: bool) {
        let word = size | if used { USED } else { 0 };
        self.seg.write(block, word);
        self.seg.write(block + size - WORD, word);
    }

    #[inline]
    fn next_free(&self, block: Offset) -> Offset {
        self.seg.read(block + WORD)
    }

    #[inline]
    fn prev_free(&self, block: Offset) -> Offset {
        self.seg.read(block + 2 * WORD)
    }

    fn push_free(&self, h: &mut ArenaHeader, block: Offset) {
        self.seg.write(block + WORD, h.free_head);
        self.seg.write(block + 2 * WORD, NULL);
        if h.free_head != NULL {
            self.seg.write(h.free_head + 2 * WORD, block);
        }
        h.free_head = block;
    }

    fn unlink_free(&self, h: &mut ArenaHeader, block: Offset) {
        let next = self.next_free(block);
        let prev = self.prev_free(block);
        if prev == NULL {
            h.free_head = next;
        } else {
            self.seg.write(prev + WORD, next);
        }
        if next != NULL {
            self.seg.write(next + 2 * WORD, prev);
        }
    }

    #[inline]
    fn block_size_for(size: usize) -> u64 {
        (round_up(size, WORD as usize) as u64 + TAGS).max(MIN_BLOCK)
    }

    /// Usable payload bytes of an allocated block.
    pub(crate) fn capacity(&self, off: Offset) -> usize {
        let (size, _) = self.tag(off - WORD);
        (size - TAGS) as usize
    }

    pub(crate) fn stats(&self) -> MemStats {
        let h = self.load();
        let mut max_free_chunk = 0;
        let mut block = h.free_head;
        while block != NULL {
            let (size, _) = self.tag(block);
            max_free_chunk = max_free_chunk.max(size);
            block = self.next_free(block);
        }
        MemStats {
            total: h.heap_end - h.heap_start,
            free_size: h.free_size,
            used_size: h.used_size,
            free_chunks: h.free_chunks,
            used_chunks: h.used_chunks,
            max_free_chunk,
            overhead: TAGS * (h.free_chunks + h.used_chunks),
        }
    }

    pub(crate) fn dump_stats(&self) {
        let stats = self.stats();
        warn!(
            "value cache memory: total {} free {} ({} chunks, largest {}) used {} ({} chunks) overhead {}",
            format_bytes(stats.total as usize),
            format_bytes(stats.free_size as usize),
            stats.free_chunks,
            format_bytes(stats.max_free_chunk as usize),
            format_bytes(stats.used_size as usize),
            stats.used_chunks,
            format_bytes(stats.overhead as usize),
        );
    }
}

impl Alloc for Arena<'_> {
    fn alloc(&self, size: usize) -> Option<Offset> {
        let need = Self::block_size_for(size);
        let mut h = self.load();

        let mut block = h.free_head;
        while block != NULL {
            let (bsize, _) = self.tag(block);
            if bsize >= need {
                break;
            }
            block = self.next_free(block);
        }
        if block == NULL {
            return None;
        }

        let (bsize, _) = self.tag(block);
        self.unlink_free(&mut h, block);

        let taken = if bsize - need >= MIN_BLOCK {
            let rest = block + need;
            self.set_tags(rest, bsize - need, false);
            self.push_free(&mut h, rest);
            need
        } else {
            h.free_chunks -= 1;
            bsize
        };

        self.set_tags(block, taken, true);
        h.free_size -= taken;
        h.used_size += taken;
        h.used_chunks += 1;
        self.store(&h);

        Some(block + WORD)
    }

    fn realloc(&self, off: Offset, size: usize) -> Option<Offset> {
        if off == NULL {
            return self.alloc(size);
        }
        let capacity = self.capacity(off);
        if capacity >= size {
            return Some(off);
        }
        let new = self.alloc(size)?;
        self.seg.copy(off, new, capacity);
        self.free(off);
        Some(new)
    }

    fn free(&self, off: Offset) {
        if off == NULL {
            return;
        }
        let mut h = self.load();
        let mut block = off - WORD;
        let (mut size, used) = self.tag(block);
        debug_assert!(used, "double free at offset {off}");

        h.used_size -= size;
        h.used_chunks -= 1;

        let next = block + size;
        if next < h.heap_end {
            let (nsize, nused) = self.tag(next);
            if !nused {
                self.unlink_free(&mut h, next);
                h.free_size -= nsize;
                h.free_chunks -= 1;
                size += nsize;
            }
        }

        if block > h.heap_start {
            let (psize, pused) = self.tag(block - WORD);
            if !pused {
                let prev = block - psize;
                self.unlink_free(&mut h, prev);
                h.free_size -= psize;
                h.free_chunks -= 1;
                size += psize;
                block = prev;
            }
        }

        self.set_tags(block, size, false);
        self.push_free(&mut h, block);
        h.free_size += size;
        h.free_chunks += 1;
        self.store(&h);
    }
}
