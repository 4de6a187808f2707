//! Open addressing hash table stored in the segment.
//!
//! Slots hold a 64-bit hash and an [`Offset`] to the entry. Keys live in the
//! entries themselves, so lookups take an `eq` callback that inspects the
//! candidate entry. Collisions use linear probing and deletion shifts the
//! following run back, so there are no tombstones.
//!
//! A hash of `0` marks an empty slot. Real hashes of `0` are folded to `1`.

use std::sync::LazyLock;

use ahash::RandomState;

use crate::arena::Alloc;
use crate::segment::{NULL, Offset, Pod, Segment};

const SLOT_SIZE: u64 = size_of::<Slot>() as u64;

static HASHER: LazyLock<RandomState> = LazyLock::new(|| {
    // Fixed seeds: every process attached to a segment must agree on hashes.
    RandomState::with_seeds(
        0xbb8c484891ec6c86,
        0x0522a25ae9c769f9,
        0xeed2797b9571bc75,
        0x4feb29c1fbbd59d0,
    )
});

#[inline]
pub(crate) fn hash_u64(value: u64) -> u64 {
    HASHER.hash_one(value)
}

#[inline]
pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    HASHER.hash_one(bytes)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TableHeader {
    slots: Offset,
    capacity: u64,
    len: u64,
}

unsafe impl Pod for TableHeader {}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    hash: u64,
    value: Offset,
}

unsafe impl Pod for Slot {}

#[inline]
fn normalize(hash: u64) -> u64 {
    if hash == 0 { 1 } else { hash }
}

/// Handle to a table whose header lives at a fixed offset.
#[derive(Clone, Copy)]
pub(crate) struct Table<'a> {
    seg: &'a Segment,
    header: Offset,
}

impl<'a> Table<'a> {
    pub(crate) fn new(seg: &'a Segment, header: Offset) -> Self {
        Self { seg, header }
    }

    /// Allocate the slot array with room for at least `min_capacity` entries.
    pub(crate) fn create(&self, alloc: &impl Alloc, min_capacity: usize) -> bool {
        let capacity = min_capacity.max(8).next_power_of_two() as u64;
        let Some(slots) = alloc.alloc((capacity * SLOT_SIZE) as usize) else {
            return false;
        };
        self.seg.fill(slots, (capacity * SLOT_SIZE) as usize, 0);
        self.store(&TableHeader {
            slots,
            capacity,
            len: 0,
        });
        true
    }

    #[inline]
    fn load(&self) -> TableHeader {
        self.seg.read(self.header)
    }

    #[inline]
    fn store(&self, h: &TableHeader) {
        self.seg.write(self.header, *h)
    }

    #[inline]
    fn slot_at(&self, h: &TableHeader, index: u64) -> Offset {
        h.slots + index * SLOT_SIZE
    }

    pub(crate) fn len(&self) -> usize {
        self.load().len as usize
    }

    pub(crate) fn find(&self, hash: u64, eq: impl Fn(Offset) -> bool) -> Option<Offset> {
        let h = self.load();
        let hash = normalize(hash);
        let mask = h.capacity - 1;
        let mut index = hash & mask;
        for _ in 0..h.capacity {
            let slot: Slot = self.seg.read(self.slot_at(&h, index));
            if slot.hash == 0 {
                return None;
            }
            if slot.hash == hash && eq(slot.value) {
                return Some(slot.value);
            }
            index = (index + 1) & mask;
        }
        None
    }

    /// Insert an entry. The caller guarantees the key is not present.
    pub(crate) fn insert(&self, alloc: &impl Alloc, hash: u64, value: Offset) -> bool {
        let h = self.load();
        if (h.len + 1) * 4 > h.capacity * 3 && !self.grow(alloc) && h.len + 1 >= h.capacity {
            return false;
        }
        // Growing may have released space, which removes entries.
        let mut h = self.load();
        self.place(&h, normalize(hash), value);
        h.len += 1;
        self.store(&h);
        true
    }

    fn place(&self, h: &TableHeader, hash: u64, value: Offset) {
        let mask = h.capacity - 1;
        let mut index = hash & mask;
        loop {
            let at = self.slot_at(h, index);
            let slot: Slot = self.seg.read(at);
            if slot.hash == 0 {
                self.seg.write(at, Slot { hash, value });
                return;
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&self, alloc: &impl Alloc) -> bool {
        let old = self.load();
        let capacity = old.capacity * 2;
        let Some(slots) = alloc.realloc(old.slots, (capacity * SLOT_SIZE) as usize) else {
            return false;
        };

        // Entries may have been removed while the allocator reclaimed space.
        let current = self.load();
        let entries: Vec<Slot> = (0..current.capacity)
            .map(|i| self.seg.read::<Slot>(slots + i * SLOT_SIZE))
            .filter(|slot| slot.hash != 0)
            .collect();

        self.seg.fill(slots, (capacity * SLOT_SIZE) as usize, 0);
        let h = TableHeader {
            slots,
            capacity,
            len: entries.len() as u64,
        };
        for slot in entries {
            self.place(&h, slot.hash, slot.value);
        }
        self.store(&h);
        true
    }

    /// Remove the entry `value` stored under `hash`.
    pub(crate) fn remove(&self, hash: u64, value: Offset) -> bool {
        let mut h = self.load();
        if h.capacity == 0 {
            return false;
        }
        let hash = normalize(hash);
        let mask = h.capacity - 1;

        let mut hole = hash & mask;
        loop {
            let slot: Slot = self.seg.read(self.slot_at(&h, hole));
            if slot.hash == 0 {
                return false;
            }
            if slot.hash == hash && slot.value == value {
                break;
            }
            hole = (hole + 1) & mask;
        }

        let mut next = hole;
        loop {
            next = (next + 1) & mask;
            let slot: Slot = self.seg.read(self.slot_at(&h, next));
            if slot.hash == 0 {
                break;
            }
            let home = slot.hash & mask;
            // Move the slot back unless its home lies cyclically in (hole, next].
            let stays = if hole <= next {
                hole < home && home <= next
            } else {
                hole < home || home <= next
            };
            if !stays {
                self.seg.write(self.slot_at(&h, hole), slot);
                hole = next;
            }
        }

        self.seg.write(self.slot_at(&h, hole), Slot::default());
        h.len -= 1;
        self.store(&h);
        true
    }

    /// Snapshot of every entry offset.
    pub(crate) fn values(&self) -> Vec<Offset> {
        let h = self.load();
        (0..h.capacity)
            .map(|i| self.seg.read::<Slot>(self.slot_at(&h, i)))
            .filter(|slot| slot.hash != 0)
            .map(|slot| slot.value)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::segment::{ITEMS_HEADER, MIN_SIZE};

    fn setup(seg: &Segment) -> (Arena<'_>, Table<'_>) {
        let arena = Arena::init(seg);
        let table = Table::new(seg, ITEMS_HEADER);
        assert!(table.create(&arena, 4));
        (arena, table)
    }

    /// Entries are single u64 keys allocated in the arena.
    fn put(seg: &Segment, arena: &Arena<'_>, table: &Table<'_>, key: u64, hash: u64) -> Offset {
        let off = arena.alloc(8).unwrap();
        seg.write(off, key);
        assert!(table.insert(arena, hash, off));
        off
    }

    fn get(seg: &Segment, table: &Table<'_>, key: u64, hash: u64) -> Option<Offset> {
        table.find(hash, |off| seg.read::<u64>(off) == key)
    }

    #[test]
    fn test_insert_find_remove() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let (arena, table) = setup(&seg);

        let a = put(&seg, &arena, &table, 1, hash_u64(1));
        let b = put(&seg, &arena, &table, 2, hash_u64(2));
        assert_eq!(table.len(), 2);
        assert_eq!(get(&seg, &table, 1, hash_u64(1)), Some(a));
        assert_eq!(get(&seg, &table, 2, hash_u64(2)), Some(b));
        assert_eq!(get(&seg, &table, 3, hash_u64(3)), None);

        assert!(table.remove(hash_u64(1), a));
        assert!(!table.remove(hash_u64(1), a));
        assert_eq!(get(&seg, &table, 1, hash_u64(1)), None);
        assert_eq!(get(&seg, &table, 2, hash_u64(2)), Some(b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_colliding_hashes_survive_removal() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let (arena, table) = setup(&seg);

        // Same hash for every key forces one long probe run.
        let offs: Vec<Offset> = (0..5).map(|k| put(&seg, &arena, &table, k, 42)).collect();
        assert!(table.remove(42, offs[1]));
        assert!(table.remove(42, offs[3]));
        for k in [0u64, 2, 4] {
            assert_eq!(get(&seg, &table, k, 42), Some(offs[k as usize]));
        }
        assert_eq!(get(&seg, &table, 1, 42), None);
    }

    #[test]
    fn test_zero_hash_is_usable() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let (arena, table) = setup(&seg);
        let a = put(&seg, &arena, &table, 9, 0);
        assert_eq!(get(&seg, &table, 9, 0), Some(a));
        assert!(table.remove(0, a));
    }

    #[test]
    fn test_growth_keeps_entries() {
        let seg = Segment::create(MIN_SIZE).unwrap();
        let (arena, table) = setup(&seg);

        let offs: Vec<Offset> = (0..100)
            .map(|k| put(&seg, &arena, &table, k, hash_u64(k)))
            .collect();
        assert_eq!(table.len(), 100);
        for (k, off) in offs.iter().enumerate() {
            assert_eq!(get(&seg, &table, k as u64, hash_u64(k as u64)), Some(*off));
        }
        let mut values = table.values();
        values.sort_unstable();
        let mut expected = offs.clone();
        expected.sort_unstable();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_hashes_are_stable() {
        assert_eq!(hash_u64(7), hash_u64(7));
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }
}
