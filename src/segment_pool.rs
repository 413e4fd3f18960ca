//! Segment buffer pool: bounded free-lists of page-aligned byte buffers in
//! three size classes, reused across flushes to avoid allocator pressure
//! on the hot ingestion path.

use std::sync::Arc;

use parking_lot::Mutex;

/// Which free-list a buffer was (or should be) allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

/// A page-aligned, reusable byte buffer checked out from a [`SegmentBufferPool`].
pub struct SegmentBuffer {
    data: Vec<u8>,
    len: usize,
    class: SizeClass,
}

impl SegmentBuffer {
    fn new(capacity: usize, align: usize, class: SizeClass) -> Self {
        let data = aligned_vec(capacity, align);
        Self { data, len: 0, class }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.data.len();
        &mut self.data[..len]
    }

    /// Stable base address, required by Direct/Raw disk backends.
    pub fn base_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len;
    }

    /// Resets position/limit and zero-fills the tail so a shorter next write
    /// never exposes stale bytes from a previous tenant.
    fn reset(&mut self) {
        self.data[self.len..].fill(0);
        self.len = 0;
    }
}

fn aligned_vec(capacity: usize, align: usize) -> Vec<u8> {
    // Over-allocate then round the base pointer up; simple and portable,
    // avoiding a dependency on an allocator API for aligned allocation.
    let mut raw = vec![0u8; capacity + align];
    let base = raw.as_ptr() as usize;
    let offset = (align - (base % align)) % align;
    raw.drain(..offset);
    raw.truncate(capacity);
    raw
}

struct FreeList {
    capacity: usize,
    align: usize,
    class: SizeClass,
    free: Vec<SegmentBuffer>,
    max_pooled: usize,
}

impl FreeList {
    fn get(&mut self) -> SegmentBuffer {
        self.free
            .pop()
            .unwrap_or_else(|| SegmentBuffer::new(self.capacity, self.align, self.class))
    }

    fn put(&mut self, mut buf: SegmentBuffer) {
        buf.reset();
        if self.free.len() < self.max_pooled {
            self.free.push(buf);
        }
    }
}

/// Three fixed free-lists sized to hold at most `small`/`medium`/`large`
/// buffers each; `get(len)` returns the smallest class whose capacity fits
/// `len`, allocating fresh if the list is empty.
pub struct SegmentBufferPool {
    small: Mutex<FreeList>,
    medium: Mutex<FreeList>,
    large: Mutex<FreeList>,
}

impl SegmentBufferPool {
    pub fn new(align: usize, small_cap: usize, medium_cap: usize, large_cap: usize, max_pooled_per_class: usize) -> Arc<Self> {
        Arc::new(Self {
            small: Mutex::new(FreeList {
                capacity: small_cap,
                align,
                class: SizeClass::Small,
                free: Vec::new(),
                max_pooled: max_pooled_per_class,
            }),
            medium: Mutex::new(FreeList {
                capacity: medium_cap,
                align,
                class: SizeClass::Medium,
                free: Vec::new(),
                max_pooled: max_pooled_per_class,
            }),
            large: Mutex::new(FreeList {
                capacity: large_cap,
                align,
                class: SizeClass::Large,
                free: Vec::new(),
                max_pooled: max_pooled_per_class,
            }),
        })
    }

    /// Pool sized for a flash-page-aligned log segment, scaled relative to
    /// the configured segment size.
    pub fn for_segment_size(flash_page_size: usize, log_segment_size: usize, max_pooled_per_class: usize) -> Arc<Self> {
        Self::new(
            flash_page_size,
            flash_page_size.max(log_segment_size / 8),
            (log_segment_size / 2).max(flash_page_size),
            log_segment_size,
            max_pooled_per_class,
        )
    }

    pub fn get(self: &Arc<Self>, len: usize) -> SegmentBuffer {
        let small_cap = self.small.lock().capacity;
        let medium_cap = self.medium.lock().capacity;
        let mut list = if len <= small_cap {
            self.small.lock()
        } else if len <= medium_cap {
            self.medium.lock()
        } else {
            self.large.lock()
        };
        list.get()
    }

    pub fn put(self: &Arc<Self>, buf: SegmentBuffer) {
        let mut list = match buf.class() {
            SizeClass::Small => self.small.lock(),
            SizeClass::Medium => self.medium.lock(),
            SizeClass::Large => self.large.lock(),
        };
        list.put(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_buffer_with_enough_capacity() {
        let pool = SegmentBufferPool::new(4096, 4096, 65536, 1 << 20, 4);
        let buf = pool.get(100);
        assert!(buf.capacity() >= 100);
    }

    #[test]
    fn returned_buffers_are_reused() {
        let pool = SegmentBufferPool::new(4096, 4096, 65536, 1 << 20, 4);
        let buf = pool.get(10);
        let ptr = buf.base_ptr();
        pool.put(buf);
        let buf2 = pool.get(10);
        assert_eq!(buf2.base_ptr(), ptr);
    }

    #[test]
    fn returned_buffer_tail_is_zeroed() {
        let pool = SegmentBufferPool::new(4096, 4096, 65536, 1 << 20, 4);
        let mut buf = pool.get(10);
        buf.as_mut_slice()[..10].copy_from_slice(&[0xFF; 10]);
        buf.set_len(10);
        pool.put(buf);
        let buf2 = pool.get(10);
        assert!(buf2.as_slice().is_empty());
    }
}
