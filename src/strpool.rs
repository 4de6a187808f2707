//! Deduplicated, reference counted byte strings.
//!
//! An entry is `[refcount: u32][len: u32][bytes]`. The table maps the content
//! hash to the entry offset; interning an existing string only bumps its
//! reference count.

use crate::arena::{Alloc, Arena};
use crate::segment::{NULL, Offset, STRPOOL_HEADER, Segment};
use crate::table::{Table, hash_bytes};

const ENTRY_HEADER: u64 = 8;

#[derive(Clone, Copy)]
pub(crate) struct StrPool<'a> {
    seg: &'a Segment,
    table: Table<'a>,
}

impl<'a> StrPool<'a> {
    pub(crate) fn new(seg: &'a Segment) -> Self {
        Self {
            seg,
            table: Table::new(seg, STRPOOL_HEADER),
        }
    }

    pub(crate) fn create(&self, alloc: &impl Alloc, capacity: usize) -> bool {
        self.table.create(alloc, capacity)
    }

    #[inline]
    fn entry_len(&self, off: Offset) -> usize {
        self.seg.read::<u32>(off + 4) as usize
    }

    fn matches(&self, off: Offset, bytes: &[u8]) -> bool {
        self.entry_len(off) == bytes.len() && self.seg.bytes_eq(off + ENTRY_HEADER, bytes)
    }

    /// Intern `bytes`, returning the shared entry with one more reference.
    pub(crate) fn intern(&self, alloc: &impl Alloc, bytes: &[u8]) -> Option<Offset> {
        let hash = hash_bytes(bytes);
        if let Some(off) = self.table.find(hash, |off| self.matches(off, bytes)) {
            let refcount: u32 = self.seg.read(off);
            self.seg.write(off, refcount + 1);
            return Some(off);
        }

        let len = u32::try_from(bytes.len()).ok()?;
        let off = alloc.alloc(ENTRY_HEADER as usize + bytes.len())?;
        self.seg.write(off, 1u32);
        self.seg.write(off + 4, len);
        self.seg.write_bytes(off + ENTRY_HEADER, bytes);

        if !self.table.insert(alloc, hash, off) {
            Arena::new(self.seg).free(off);
            return None;
        }
        Some(off)
    }

    /// Drop one reference. Returns the bytes freed, `0` while still shared.
    pub(crate) fn release(&self, off: Offset) -> usize {
        if off == NULL {
            return 0;
        }
        let refcount: u32 = self.seg.read(off);
        if refcount > 1 {
            self.seg.write(off, refcount - 1);
            return 0;
        }

        let len = self.entry_len(off);
        let hash = hash_bytes(&self.seg.read_bytes(off + ENTRY_HEADER, len));
        self.table.remove(hash, off);
        Arena::new(self.seg).free(off);
        ENTRY_HEADER as usize + len
    }

    pub(crate) fn get(&self, off: Offset) -> String {
        let bytes = self.seg.read_bytes(off + ENTRY_HEADER, self.entry_len(off));
        match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, off: Offset) -> u32 {
        self.seg.read(off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::MIN_SIZE;

    #[test]
    fn test_intern_dedups() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let arena = Arena::init(&seg);
        let pool = StrPool::new(&seg);
        assert!(pool.create(&arena, 16));

        let a = pool.intern(&arena, b"hello").unwrap();
        let b = pool.intern(&arena, b"hello").unwrap();
        let c = pool.intern(&arena, b"world").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.refcount(a), 2);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(a), "hello");
    }

    #[test]
    fn test_release_frees_on_last_reference() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let arena = Arena::init(&seg);
        let pool = StrPool::new(&seg);
        assert!(pool.create(&arena, 16));
        let used = arena.stats().used_chunks;

        let a = pool.intern(&arena, b"value").unwrap();
        pool.intern(&arena, b"value").unwrap();
        assert_eq!(pool.release(a), 0);
        assert_eq!(pool.release(a), 8 + 5);
        assert_eq!(pool.len(), 0);
        assert_eq!(arena.stats().used_chunks, used);
        assert_eq!(pool.release(NULL), 0);
    }

    #[test]
    fn test_empty_and_prefix_strings_are_distinct() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let arena = Arena::init(&seg);
        let pool = StrPool::new(&seg);
        assert!(pool.create(&arena, 16));

        let empty = pool.intern(&arena, b"").unwrap();
        let ab = pool.intern(&arena, b"ab").unwrap();
        let abc = pool.intern(&arena, b"abc").unwrap();
        assert_ne!(ab, abc);
        assert_eq!(pool.get(empty), "");
        assert_eq!(pool.get(abc), "abc");
    }

    #[test]
    fn test_intern_fails_when_full() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let arena = Arena::init(&seg);
        let pool = StrPool::new(&seg);
        assert!(pool.create(&arena, 16));
        let big = vec![b'x'; MIN_SIZE];
        assert!(pool.intern(&arena, &big).is_none());
        assert_eq!(pool.len(), 0);
    }
}
