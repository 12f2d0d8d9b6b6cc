//! Pooled memory backing every socket read and write.
//!
//! # Components
//!
//! - [`MemoryPool`]: allocates slabs and leases fixed size blocks out of them
//! - [`MemoryBlock`]: a pinned, reference counted block with a forward link to the next one
//! - [`Cursor`]: a cheap position inside a chain of blocks
//!
//! # Lifecycle
//!
//! A leased block starts with a pin count of one. Whoever holds a reference that must keep
//! the block alive (the receive chain of a connection, an in-flight write) pins it, and
//! unpins when done. The unpin that reaches zero hands the storage back to the pool, where
//! the next [`MemoryPool::lease`] picks it up again.
//!
//! ```
//! use micro_transport::memory::{Cursor, MemoryPool};
//!
//! let pool = MemoryPool::new();
//! let block = pool.lease();
//! block.append(b"GET / HTTP/1.1\r\n");
//!
//! let mut cursor = Cursor::at_start(&block);
//! assert_eq!(cursor.take(), Some(b'G'));
//!
//! block.unpin();
//! assert!(block.is_released());
//! ```

mod block;
mod cursor;
mod pool;

pub use block::MemoryBlock;
pub use cursor::Cursor;
pub use pool::{DEFAULT_BLOCK_SIZE, DEFAULT_BLOCKS_PER_SLAB, DEFAULT_MAX_SLABS, MemoryPool, MemoryPoolBuilder, PoolConfigError, PoolStats};

#[cfg(test)]
pub(crate) use cursor::tests::chain as test_chain;
