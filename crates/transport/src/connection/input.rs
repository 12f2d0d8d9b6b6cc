use std::fmt;

use crate::memory::{Cursor, MemoryBlock, MemoryPool};

/// The receive buffer of one connection: pool blocks linked in arrival order.
///
/// Bytes between [`start`](Self::start) and [`end`](Self::end) have been received and not
/// consumed yet. Blocks the consumer has moved past are unpinned right away, so a long lived
/// connection only holds the blocks its unparsed bytes live in.
pub struct SocketInput {
    pool: MemoryPool,
    head: Cursor,
    tail: Option<MemoryBlock>,
}

impl SocketInput {
    pub fn new(pool: MemoryPool) -> Self {
        Self { pool, head: Cursor::default(), tail: None }
    }

    /// The block the next read should land in.
    ///
    /// That is the last block while it has room, otherwise a freshly leased one linked after
    /// it. Never waits for the pool: `None` when it is exhausted.
    pub fn alloc(&mut self) -> Option<MemoryBlock> {
        if let Some(tail) = &self.tail
            && tail.available() > 0
        {
            return Some(tail.clone());
        }

        let block = self.pool.try_lease()?;
        match &self.tail {
            Some(tail) => tail.set_next(block.clone()),
            None => self.head = Cursor::at_start(&block),
        }
        self.tail = Some(block.clone());
        Some(block)
    }

    /// First unconsumed byte, the default cursor when nothing was ever received
    pub fn start(&self) -> Cursor {
        self.head.clone()
    }

    pub fn end(&self) -> Cursor {
        self.tail.as_ref().map(Cursor::at_end).unwrap_or_default()
    }

    /// Number of received bytes not consumed yet
    pub fn buffered(&self) -> usize {
        self.head.get_length(&self.end())
    }

    /// Marks everything before `to` as consumed.
    ///
    /// `to` must lie between [`start`](Self::start) and [`end`](Self::end).
    pub fn consume(&mut self, to: Cursor) {
        let Some(target) = to.block() else {
            return;
        };
        let mut block = self.head.block().cloned();
        while let Some(current) = block {
            if current.ptr_eq(target) {
                break;
            }
            block = current.next();
            current.unpin();
        }
        self.head = to;
    }

    /// Unpins every block still held.
    pub fn release(&mut self) {
        let mut block = self.head.block().cloned();
        while let Some(current) = block {
            block = current.next();
            current.unpin();
        }
        self.head = Cursor::default();
        self.tail = None;
    }
}

impl Drop for SocketInput {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SocketInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketInput").field("buffered", &self.buffered()).finish_non_exhaustive()
    }
}
