use std::ops::Deref;

use bytes::Bytes;
use parking_lot::{MappedRwLockReadGuard, RwLockReadGuard};

use crate::memory::Cursor;

/// Bytes of a cursor range, borrowed in place or copied out.
///
/// A [`View`](ByteSegment::View) holds a read guard on the block storage, so the block
/// cannot be appended to while the view is alive.
#[derive(Debug)]
pub enum ByteSegment<'a> {
    /// The range lies in one block and is read in place
    View(MappedRwLockReadGuard<'a, [u8]>),
    /// The range spans blocks and was copied into its own buffer
    Owned(Vec<u8>),
}

impl ByteSegment<'_> {
    /// Whether the segment borrows the block storage instead of owning a copy
    pub fn is_view(&self) -> bool {
        matches!(self, ByteSegment::View(_))
    }

    /// Detaches the segment from the block, copying only if it is a view.
    pub fn into_bytes(self) -> Bytes {
        match self {
            ByteSegment::View(view) => Bytes::copy_from_slice(&view),
            ByteSegment::Owned(buffer) => Bytes::from(buffer),
        }
    }
}

impl Deref for ByteSegment<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ByteSegment::View(view) => &**view,
            ByteSegment::Owned(buffer) => buffer.as_slice(),
        }
    }
}

impl AsRef<[u8]> for ByteSegment<'_> {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

/// Returns the bytes of `[start, end)`.
///
/// Inside a single block this is a view with no copy. Across blocks exactly
/// `start.get_length(end)` bytes are allocated and filled with [`Cursor::copy_to`].
pub fn extract_bytes<'a>(start: &'a Cursor, end: &Cursor) -> Option<ByteSegment<'a>> {
    let (Some(block), Some(_)) = (start.block(), end.block()) else {
        return None;
    };

    if start.same_block(end) {
        let range = start.index()..end.index();
        let view = RwLockReadGuard::map(block.storage(), |storage| storage.get(range).unwrap_or_default());
        return Some(ByteSegment::View(view));
    }

    let length = start.get_length(end);
    let mut buffer = vec![0u8; length];
    let copied = start.clone().copy_to(&mut buffer);
    buffer.truncate(copied);
    Some(ByteSegment::Owned(buffer))
}
