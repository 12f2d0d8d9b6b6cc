//! Position markers over a chain of [`MemoryBlock`]s.
//!
//! A [`Cursor`] names one byte position: a block and an absolute index inside that block's
//! storage. Pairs of cursors delimit the half-open ranges that the decoder and the token
//! matcher work on, so a parse never has to copy the receive buffer just to look at it.
//!
//! Two cursors used together must point into the same chain, with `end` reachable from
//! `start` by following [`MemoryBlock::next`]. This is a precondition: measuring cursors
//! from unrelated chains trips a debug assertion and otherwise yields an unspecified length.

use std::fmt;

use crate::memory::MemoryBlock;

/// A cheap, cloneable position inside a block chain.
///
/// The default cursor has no block and stands for an absent position.
#[derive(Clone, Default)]
pub struct Cursor {
    block: Option<MemoryBlock>,
    index: usize,
}

impl Cursor {
    pub fn new(block: MemoryBlock, index: usize) -> Self {
        Self { block: Some(block), index }
    }

    /// A cursor on the first valid byte of `block`
    pub fn at_start(block: &MemoryBlock) -> Self {
        Self::new(block.clone(), block.start())
    }

    /// A cursor one past the last valid byte of `block`
    pub fn at_end(block: &MemoryBlock) -> Self {
        Self::new(block.clone(), block.end())
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.block.is_none()
    }

    #[inline]
    pub fn block(&self) -> Option<&MemoryBlock> {
        self.block.as_ref()
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether both cursors sit in the same block (not necessarily at the same index)
    pub fn same_block(&self, other: &Cursor) -> bool {
        match (&self.block, &other.block) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// True when no byte can be read at or after this position.
    pub fn is_end(&self) -> bool {
        self.peek().is_none()
    }

    /// The byte at the cursor without advancing, following the chain past exhausted blocks.
    pub fn peek(&self) -> Option<u8> {
        let mut block = self.block.clone()?;
        let mut index = self.index;
        loop {
            if let Some(byte) = byte_at(&block, index) {
                return Some(byte);
            }
            block = block.next()?;
            index = block.start();
        }
    }

    /// Returns the byte at the cursor and moves past it.
    ///
    /// When the current block is exhausted the cursor moves into the next block first. At the
    /// end of the chain the position is left unchanged and `None` is returned.
    pub fn take(&mut self) -> Option<u8> {
        let current = self.block.as_ref()?;
        if let Some(byte) = byte_at(current, self.index) {
            self.index += 1;
            return Some(byte);
        }

        let mut block = current.next()?;
        let mut index = block.start();
        loop {
            if let Some(byte) = byte_at(&block, index) {
                self.block = Some(block);
                self.index = index + 1;
                return Some(byte);
            }
            block = block.next()?;
            index = block.start();
        }
    }

    /// The next 8 bytes packed little-endian into a `u64`, without advancing.
    ///
    /// Only looks at the current block: `None` when fewer than 8 bytes remain in it, leaving
    /// the caller to fall back to byte-at-a-time matching.
    pub fn peek_long(&self) -> Option<u64> {
        let block = self.block.as_ref()?;
        let storage = block.storage();
        let word = storage.get(self.index..self.index.checked_add(8)?)?;
        Some(u64::from_le_bytes(word.try_into().ok()?))
    }

    /// Advances up to `count` bytes, returning how many were actually skipped.
    pub fn skip(&mut self, count: usize) -> usize {
        let Some(mut block) = self.block.clone() else {
            return 0;
        };
        let mut index = self.index;
        let mut remaining = count;
        loop {
            let following = block.end().saturating_sub(index);
            if remaining <= following {
                index += remaining;
                remaining = 0;
                break;
            }
            match block.next() {
                Some(next) => {
                    remaining -= following;
                    index = next.start();
                    block = next;
                }
                None => {
                    index += following;
                    remaining -= following;
                    break;
                }
            }
        }
        self.block = Some(block);
        self.index = index;
        count - remaining
    }

    /// Moves to the first occurrence of `byte` at or after the cursor and returns it.
    ///
    /// When the byte does not occur the cursor ends up one past the last valid byte of the
    /// chain and `None` is returned.
    pub fn seek(&mut self, byte: u8) -> Option<u8> {
        let mut block = self.block.clone()?;
        let mut index = self.index;
        loop {
            let found = {
                let storage = block.storage();
                storage.get(index..).and_then(|tail| tail.iter().position(|b| *b == byte))
            };
            if let Some(offset) = found {
                self.block = Some(block);
                self.index = index + offset;
                return Some(byte);
            }
            match block.next() {
                Some(next) => {
                    index = next.start();
                    block = next;
                }
                None => {
                    self.index = block.end().max(index);
                    self.block = Some(block);
                    return None;
                }
            }
        }
    }

    /// Number of bytes between this cursor and `end`.
    ///
    /// `end` must be reachable from `self`; a default cursor on either side measures zero.
    pub fn get_length(&self, end: &Cursor) -> usize {
        let (Some(mut block), Some(end_block)) = (self.block.clone(), end.block.as_ref()) else {
            return 0;
        };
        let mut index = self.index;
        let mut length = 0;
        loop {
            if block.ptr_eq(end_block) {
                return length + end.index.saturating_sub(index);
            }
            length += block.end().saturating_sub(index);
            match block.next() {
                Some(next) => {
                    index = next.start();
                    block = next;
                }
                None => {
                    debug_assert!(false, "end cursor does not follow the start cursor");
                    return length;
                }
            }
        }
    }

    /// Copies up to `dst.len()` bytes into `dst`, advancing past them.
    ///
    /// Returns the number of bytes copied, which is smaller than `dst.len()` only when the
    /// chain runs out.
    pub fn copy_to(&mut self, dst: &mut [u8]) -> usize {
        let Some(mut block) = self.block.clone() else {
            return 0;
        };
        let mut index = self.index;
        let mut copied = 0;
        loop {
            let remaining = dst.len() - copied;
            let following = {
                let storage = block.storage();
                let tail = storage.get(index..).unwrap_or_default();
                let count = tail.len().min(remaining);
                dst[copied..copied + count].copy_from_slice(&tail[..count]);
                count
            };
            copied += following;
            index += following;

            if copied == dst.len() {
                break;
            }
            match block.next() {
                Some(next) => {
                    index = next.start();
                    block = next;
                }
                None => break,
            }
        }
        self.block = Some(block);
        self.index = index;
        copied
    }
}

#[inline]
fn byte_at(block: &MemoryBlock, index: usize) -> Option<u8> {
    block.storage().get(index).copied()
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.block {
            Some(block) => f.debug_struct("Cursor").field("index", &self.index).field("block_end", &block.end()).finish(),
            None => f.write_str("Cursor(default)"),
        }
    }
}
