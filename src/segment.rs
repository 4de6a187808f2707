//! Shared memory segment backing the cache.
//!
//! The segment is a single anonymous `MAP_SHARED` mapping. Forked workers
//! inherit it and see each other's writes. Everything inside is addressed by
//! byte [`Offset`] from the start of the mapping so no pointer ever lands in
//! shared memory.
//!
//! ```text
//! +----------------+--------------------------------------------+
//! | SegmentHeader  |  heap (boundary-tagged arena blocks) ...   |
//! | magic, mutex,  |                                            |
//! | arena, tables, |                                            |
//! | cache counters |                                            |
//! +----------------+--------------------------------------------+
//! 0                heap_start                          heap_end
//! ```

use std::mem::{offset_of, size_of};
use std::ptr::NonNull;

use tracing::{debug, info};

use crate::arena::ArenaHeader;
use crate::error::{CacheError, CacheResult};
use crate::lock::ProcessMutex;
use crate::shared::CacheHeader;
use crate::table::TableHeader;

/// Byte offset into the segment. `0` is the null offset.
pub(crate) type Offset = u64;

/// The null offset.
pub(crate) const NULL: Offset = 0;

const MAGIC: u64 = 0x5643_4143_4845_0001;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Smallest accepted segment size.
pub const MIN_SIZE: usize = 128 * KB;
/// Largest accepted segment size.
pub const MAX_SIZE: usize = 64 * GB;

/// Types that may be copied in and out of the segment bytewise.
///
/// # Safety
/// Every bit pattern must be a valid value and the type must not hold
/// pointers or references.
pub(crate) unsafe trait Pod: Copy + 'static {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl Pod for i64 {}

#[repr(C)]
pub(crate) struct SegmentHeader {
    magic: u64,
    size: u64,
    mutex: libc::pthread_mutex_t,
    pub(crate) arena: ArenaHeader,
    pub(crate) items: TableHeader,
    pub(crate) strpool: TableHeader,
    pub(crate) cache: CacheHeader,
}

pub(crate) const ARENA_HEADER: Offset = offset_of!(SegmentHeader, arena) as Offset;
pub(crate) const ITEMS_HEADER: Offset = offset_of!(SegmentHeader, items) as Offset;
pub(crate) const STRPOOL_HEADER: Offset = offset_of!(SegmentHeader, strpool) as Offset;
pub(crate) const CACHE_HEADER: Offset = offset_of!(SegmentHeader, cache) as Offset;

/// Space taken by the header before the heap starts.
pub(crate) const HEADER_SIZE: usize = round_up(size_of::<SegmentHeader>(), 16);

/// An owned view of the shared mapping.
pub(crate) struct Segment {
    ptr: NonNull<u8>,
    size: usize,
    /// Process that created the mutex and is responsible for destroying it.
    owner: libc::pid_t,
}

// Safety: the segment is raw shared memory. All mutation of cache structures
// happens under the process-shared mutex.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Map a new zeroed segment of `size` bytes and initialize its header.
    pub(crate) fn create(size: usize) -> CacheResult<Self> {
        if !(MIN_SIZE..=MAX_SIZE).contains(&size) {
            return Err(CacheError::InvalidSize {
                size,
                min: MIN_SIZE,
                max: MAX_SIZE,
            });
        }
        let size = size & !7;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(CacheError::Mmap(std::io::Error::last_os_error()));
        }

        let segment = Segment {
            // Safety: mmap never returns null on success.
            ptr: unsafe { NonNull::new_unchecked(ptr as *mut u8) },
            size,
            owner: unsafe { libc::getpid() },
        };

        // Safety: the header lies at the start of the fresh mapping.
        unsafe { ProcessMutex::init(segment.mutex_ptr())? };
        segment.write(offset_of!(SegmentHeader, size) as Offset, size as u64);
        segment.write(offset_of!(SegmentHeader, magic) as Offset, MAGIC);

        info!("mapped value cache segment of {}", format_bytes(size));
        Ok(segment)
    }

    /// Total mapped size in bytes.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn mutex(&self) -> ProcessMutex {
        // Safety: initialized in `create` before the segment is handed out.
        unsafe { ProcessMutex::from_raw(self.mutex_ptr()) }
    }

    fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        // Safety: the header is within the mapping and the mutex field is
        // aligned by the `repr(C)` layout at a page-aligned base.
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset_of!(SegmentHeader, mutex))
                .cast::<libc::pthread_mutex_t>()
        }
    }

    #[inline]
    fn at(&self, off: Offset, len: usize) -> *mut u8 {
        let start = off as usize;
        assert!(
            start.checked_add(len).is_some_and(|end| end <= self.size),
            "segment access out of bounds: offset {off} len {len}"
        );
        // Safety: bounds checked above.
        unsafe { self.ptr.as_ptr().add(start) }
    }

    /// Copy a value out of the segment.
    #[inline]
    pub(crate) fn read<T: Pod>(&self, off: Offset) -> T {
        // Safety: in bounds and `T: Pod` accepts any bit pattern.
        unsafe { self.at(off, size_of::<T>()).cast::<T>().read_unaligned() }
    }

    /// Copy a value into the segment.
    #[inline]
    pub(crate) fn write<T: Pod>(&self, off: Offset, value: T) {
        // Safety: in bounds.
        unsafe { self.at(off, size_of::<T>()).cast::<T>().write_unaligned(value) }
    }

    pub(crate) fn read_bytes(&self, off: Offset, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        let mut out = vec![0u8; len];
        // Safety: source in bounds, destination freshly allocated.
        unsafe { std::ptr::copy_nonoverlapping(self.at(off, len), out.as_mut_ptr(), len) };
        out
    }

    pub(crate) fn write_bytes(&self, off: Offset, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        // Safety: destination in bounds and disjoint from `bytes`.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.at(off, bytes.len()), bytes.len()) };
    }

    pub(crate) fn bytes_eq(&self, off: Offset, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        // Safety: in bounds; the slice does not outlive this call.
        let stored = unsafe { std::slice::from_raw_parts(self.at(off, bytes.len()), bytes.len()) };
        stored == bytes
    }

    /// Move `len` bytes from `src` to `dst`. The ranges may overlap.
    pub(crate) fn copy(&self, src: Offset, dst: Offset, len: usize) {
        if len == 0 || src == dst {
            return;
        }
        let from = self.at(src, len);
        let to = self.at(dst, len);
        // Safety: both ranges in bounds.
        unsafe { std::ptr::copy(from, to, len) };
    }

    pub(crate) fn fill(&self, off: Offset, len: usize, byte: u8) {
        if len == 0 {
            return;
        }
        // Safety: in bounds.
        unsafe { std::ptr::write_bytes(self.at(off, len), byte, len) };
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let initialized = self.read::<u64>(offset_of!(SegmentHeader, magic) as Offset) == MAGIC;
        // Forked children inherit this struct but must leave the mutex alone.
        if initialized && unsafe { libc::getpid() } == self.owner {
            // Safety: the owning process is tearing the cache down.
            unsafe { self.mutex().destroy() };
            debug!("destroyed value cache mutex");
        }
        unsafe {
            let result = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            debug_assert_eq!(result, 0, "munmap failed");
        }
    }
}

/// Round up to the nearest multiple of `align` (a power of two).
#[inline]
pub(crate) const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Format bytes as human-readable string.
pub(crate) fn format_bytes(bytes: usize) -> String {
    if bytes >= GB && bytes % GB == 0 {
        format!("{} GB", bytes / GB)
    } else if bytes >= MB && bytes % MB == 0 {
        format!("{} MB", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{} KB", bytes / KB)
    } else {
        format!("{} bytes", bytes)
    }
}
