use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::warn;

use crate::memory::pool::PoolRef;

/// A fixed capacity byte buffer leased from a [`MemoryPool`](crate::memory::MemoryPool).
///
/// `MemoryBlock` is a cheap handle: clones refer to the same block. The valid data of a
/// block is the range `[start, end)` of its backing storage, where `end` grows as the single
/// writer that owns the block appends to it. Blocks link forward through [`next`](Self::next)
/// to form one logical byte stream.
///
/// The block stays usable while its pin count is above zero. The unpin that brings the count
/// to zero hands the storage back to the pool; from then on the handle reads as empty.
#[derive(Clone)]
pub struct MemoryBlock {
    inner: Arc<BlockInner>,
}

struct BlockInner {
    data: RwLock<BytesMut>,
    start: usize,
    next: RwLock<Option<MemoryBlock>>,
    pins: AtomicUsize,
    released: AtomicBool,
    pool: Option<PoolRef>,
}

impl MemoryBlock {
    pub(crate) fn pooled(storage: BytesMut, pool: PoolRef) -> Self {
        Self::with_storage(storage, 0, Some(pool))
    }

    /// Creates a block outside of any pool that holds a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::with_storage(BytesMut::from(data), 0, None)
    }

    /// Like [`from_slice`](Self::from_slice), with the valid data starting at `start`.
    ///
    /// Bytes before `start` are present in the storage but never visited by cursors
    /// entering this block from a previous one.
    pub fn from_slice_at(data: &[u8], start: usize) -> Self {
        debug_assert!(start <= data.len(), "start {start} out of bounds {}", data.len());
        Self::with_storage(BytesMut::from(data), start.min(data.len()), None)
    }

    fn with_storage(storage: BytesMut, start: usize, pool: Option<PoolRef>) -> Self {
        Self {
            inner: Arc::new(BlockInner {
                data: RwLock::new(storage),
                start,
                next: RwLock::new(None),
                pins: AtomicUsize::new(1),
                released: AtomicBool::new(false),
                pool,
            }),
        }
    }

    /// Offset of the first valid byte
    #[inline]
    pub fn start(&self) -> usize {
        self.inner.start
    }

    /// Offset one past the last valid byte
    #[inline]
    pub fn end(&self) -> usize {
        self.inner.data.read().len()
    }

    /// Number of valid bytes in `[start, end)`
    pub fn len(&self) -> usize {
        self.end().saturating_sub(self.start())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.data.read().capacity()
    }

    /// Bytes that can still be appended without outgrowing the block
    pub fn available(&self) -> usize {
        let data = self.inner.data.read();
        data.capacity() - data.len()
    }

    /// Appends as much of `src` as fits, returning how many bytes were taken.
    pub fn append(&self, src: &[u8]) -> usize {
        if self.is_released() {
            return 0;
        }
        let mut data = self.inner.data.write();
        let count = src.len().min(data.capacity() - data.len());
        data.extend_from_slice(&src[..count]);
        count
    }

    /// Reads from `reader` straight into the free tail of the block.
    ///
    /// Returns the number of bytes read. `Ok(0)` means either end of stream or a block
    /// without free space, callers check [`available`](Self::available) first.
    pub fn read_from<R: io::Read>(&self, reader: &mut R) -> io::Result<usize> {
        if self.is_released() {
            return Ok(0);
        }
        let mut data = self.inner.data.write();
        let filled = data.len();
        let capacity = data.capacity();
        if filled == capacity {
            return Ok(0);
        }

        data.resize(capacity, 0);
        let result = reader.read(&mut data[filled..]);
        let count = *result.as_ref().unwrap_or(&0);
        data.truncate(filled + count);
        result
    }

    /// The following block in the chain, if any.
    pub fn next(&self) -> Option<MemoryBlock> {
        self.inner.next.read().clone()
    }

    /// Links `next` after this block, replacing any previous link.
    pub fn set_next(&self, next: MemoryBlock) {
        *self.inner.next.write() = Some(next);
    }

    /// Takes another reference on the block.
    ///
    /// Returns `false` when the block has already been released, in which case the pin
    /// count stays at zero.
    #[must_use]
    pub fn pin(&self) -> bool {
        self.inner.pins.fetch_update(Ordering::AcqRel, Ordering::Acquire, |pins| pins.checked_add(1).filter(|_| pins > 0)).is_ok()
    }

    /// Drops one reference. The unpin that reaches zero releases the block.
    pub fn unpin(&self) {
        match self.inner.pins.fetch_update(Ordering::AcqRel, Ordering::Acquire, |pins| pins.checked_sub(1)) {
            Ok(1) => self.inner.release(),
            Ok(_) => {}
            Err(_) => warn!("unpin called on a memory block that is already released"),
        }
    }

    pub fn pin_count(&self) -> usize {
        self.inner.pins.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same block
    #[inline]
    pub fn ptr_eq(&self, other: &MemoryBlock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `f` over the valid data of the block.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.inner.data.read();
        f(data.get(self.start()..).unwrap_or_default())
    }

    /// Read access to the whole backing storage, offsets are absolute block offsets.
    #[inline]
    pub(crate) fn storage(&self) -> RwLockReadGuard<'_, BytesMut> {
        self.inner.data.read()
    }
}

impl BlockInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let storage = std::mem::take(&mut *self.data.write());
        self.next.write().take();
        if let Some(pool) = self.pool.as_ref().and_then(|pool| pool.upgrade()) {
            pool.give_back(storage);
        }
    }
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if *self.released.get_mut() {
            return;
        }
        if self.pool.is_some() {
            warn!(pins = *self.pins.get_mut(), "memory block dropped while still pinned, returning it to the pool");
        }
        self.release();
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("start", &self.start())
            .field("end", &self.end())
            .field("pins", &self.pin_count())
            .field("has_next", &self.inner.next.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_stops_at_capacity() {
        let block = MemoryBlock::from_slice(b"");
        assert_eq!(block.append(b"abc"), 0);

        let pool = crate::memory::MemoryPool::builder().block_size(4).build().unwrap();
        let block = pool.lease();
        assert_eq!(block.append(b"abcdef"), 4);
        assert_eq!(block.available(), 0);
        block.with_data(|data| assert_eq!(data, b"abcd"));
    }

    #[test]
    fn read_from_fills_free_tail() {
        let pool = crate::memory::MemoryPool::builder().block_size(8).build().unwrap();
        let block = pool.lease();
        block.append(b"ab");

        let mut reader = &b"cdefghijk"[..];
        assert_eq!(block.read_from(&mut reader).unwrap(), 6);
        assert_eq!(block.end(), 8);
        assert_eq!(block.read_from(&mut reader).unwrap(), 0);
        block.with_data(|data| assert_eq!(data, b"abcdefgh"));
    }

    #[test]
    fn pin_counts_references() {
        let block = MemoryBlock::from_slice(b"data");
        assert!(block.pin());
        assert_eq!(block.pin_count(), 2);

        block.unpin();
        assert!(!block.is_released());
        block.unpin();
        assert!(block.is_released());
        assert_eq!(block.pin_count(), 0);

        assert!(!block.pin());
        block.unpin();
        assert_eq!(block.pin_count(), 0);
    }

    #[test]
    fn release_drops_next_link() {
        let first = MemoryBlock::from_slice(b"one");
        let second = MemoryBlock::from_slice(b"two");
        first.set_next(second.clone());
        assert!(first.next().unwrap().ptr_eq(&second));

        first.unpin();
        assert!(first.next().is_none());
        assert!(!second.is_released());
    }

    #[test]
    fn valid_data_begins_at_start() {
        let block = MemoryBlock::from_slice_at(b"xxpayload", 2);
        assert_eq!(block.start(), 2);
        assert_eq!(block.len(), 7);
        block.with_data(|data| assert_eq!(data, b"payload"));
    }
}
