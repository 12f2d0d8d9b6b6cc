//! Slab-backed pool of fixed size memory blocks.
//!
//! The pool allocates memory in slabs: one contiguous [`BytesMut`] that is split into
//! `blocks_per_slab` regions of `block_size` bytes each. Every region becomes the storage of
//! a [`MemoryBlock`] when leased and goes back to the free list on the block's last unpin.
//!
//! Because every region is split off the same allocation, the slab memory itself is only
//! freed once every region carved from it has been dropped, which happens after the pool is
//! torn down and all outstanding blocks are released.
//!
//! # Growth policy
//!
//! A lease first reuses a free region. When none is free the pool grows by one slab, up to
//! `max_slabs`. Past that bound [`MemoryPool::lease`] blocks the calling thread until another
//! block is returned, while [`MemoryPool::try_lease`] reports `None`.

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

use crate::ensure;
use crate::memory::MemoryBlock;

/// Default capacity of a single block in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default number of blocks carved from a single slab
pub const DEFAULT_BLOCKS_PER_SLAB: usize = 32;

/// Default upper bound on the number of slabs a pool may allocate
pub const DEFAULT_MAX_SLABS: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolConfigError {
    #[error("block size must be greater than zero")]
    ZeroBlockSize,

    #[error("blocks per slab must be greater than zero")]
    ZeroBlocksPerSlab,

    #[error("max slabs must be greater than zero")]
    ZeroMaxSlabs,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of slabs allocated so far
    pub slabs: usize,
    /// Blocks sitting on the free list
    pub free_blocks: usize,
    /// Blocks currently leased out and not yet released
    pub leased_blocks: usize,
}

#[derive(Debug, Copy, Clone)]
struct PoolOptions {
    block_size: usize,
    blocks_per_slab: usize,
    max_slabs: usize,
}

#[derive(Debug)]
struct PoolState {
    free: Vec<BytesMut>,
    slabs: usize,
    leased: usize,
}

pub(crate) struct PoolShared {
    options: PoolOptions,
    state: Mutex<PoolState>,
    returned: Condvar,
}

/// A cloneable handle to a shared block pool.
///
/// Leases may be taken from any thread.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

/// Builder for [`MemoryPool`].
#[derive(Debug)]
pub struct MemoryPoolBuilder {
    options: PoolOptions,
}

impl MemoryPoolBuilder {
    fn new() -> Self {
        Self {
            options: PoolOptions {
                block_size: DEFAULT_BLOCK_SIZE,
                blocks_per_slab: DEFAULT_BLOCKS_PER_SLAB,
                max_slabs: DEFAULT_MAX_SLABS,
            },
        }
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.options.block_size = block_size;
        self
    }

    pub fn blocks_per_slab(mut self, blocks_per_slab: usize) -> Self {
        self.options.blocks_per_slab = blocks_per_slab;
        self
    }

    pub fn max_slabs(mut self, max_slabs: usize) -> Self {
        self.options.max_slabs = max_slabs;
        self
    }

    pub fn build(self) -> Result<MemoryPool, PoolConfigError> {
        let options = self.options;
        ensure!(options.block_size > 0, PoolConfigError::ZeroBlockSize);
        ensure!(options.blocks_per_slab > 0, PoolConfigError::ZeroBlocksPerSlab);
        ensure!(options.max_slabs > 0, PoolConfigError::ZeroMaxSlabs);

        let state = PoolState { free: Vec::new(), slabs: 0, leased: 0 };
        Ok(MemoryPool { shared: Arc::new(PoolShared { options, state: Mutex::new(state), returned: Condvar::new() }) })
    }
}

impl MemoryPool {
    /// Creates a pool with the default block size and growth bound.
    pub fn new() -> Self {
        Self::builder().build().unwrap_or_else(|_| unreachable!("default pool options are valid"))
    }

    pub fn builder() -> MemoryPoolBuilder {
        MemoryPoolBuilder::new()
    }

    /// Capacity in bytes of every block handed out by this pool
    pub fn block_size(&self) -> usize {
        self.shared.options.block_size
    }

    /// Leases a block with `start == 0`, no valid data and a pin count of one.
    ///
    /// Grows the pool when the free list is empty. Once `max_slabs` is reached this call
    /// blocks until another block is released.
    pub fn lease(&self) -> MemoryBlock {
        let mut state = self.shared.state.lock();
        let storage = loop {
            if let Some(storage) = self.shared.take_free(&mut state) {
                break storage;
            }
            trace!(slabs = state.slabs, "memory pool exhausted, waiting for a returned block");
            self.shared.returned.wait(&mut state);
        };
        drop(state);

        MemoryBlock::pooled(storage, Arc::downgrade(&self.shared))
    }

    /// Leases a block without blocking, `None` when the pool is at its growth bound.
    pub fn try_lease(&self) -> Option<MemoryBlock> {
        let storage = {
            let mut state = self.shared.state.lock();
            self.shared.take_free(&mut state)?
        };
        Some(MemoryBlock::pooled(storage, Arc::downgrade(&self.shared)))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats { slabs: state.slabs, free_blocks: state.free.len(), leased_blocks: state.leased }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool").field("options", &self.shared.options).field("stats", &self.stats()).finish()
    }
}

impl PoolShared {
    fn take_free(&self, state: &mut PoolState) -> Option<BytesMut> {
        if state.free.is_empty() {
            if state.slabs >= self.options.max_slabs {
                return None;
            }
            self.allocate_slab(state);
        }

        let storage = state.free.pop()?;
        state.leased += 1;
        Some(storage)
    }

    fn allocate_slab(&self, state: &mut PoolState) {
        let PoolOptions { block_size, blocks_per_slab, .. } = self.options;

        let mut slab = BytesMut::zeroed(block_size * blocks_per_slab);
        state.free.reserve(blocks_per_slab);
        for _ in 0..blocks_per_slab {
            let mut storage = slab.split_to(block_size);
            storage.clear();
            state.free.push(storage);
        }
        state.slabs += 1;

        debug!(slabs = state.slabs, block_size, blocks_per_slab, "allocated memory slab");
    }

    /// Puts the storage of a released block back on the free list.
    pub(crate) fn give_back(&self, mut storage: BytesMut) {
        storage.clear();
        let mut state = self.state.lock();
        state.leased = state.leased.saturating_sub(1);
        state.free.push(storage);
        drop(state);
        self.returned.notify_one();
    }
}

pub(crate) type PoolRef = Weak<PoolShared>;
