//! Pool of scratch memory allocated inside the inferior.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::Permissions;
use crate::error::WardenResult;
use crate::types::Address;

/// Granularity of reservations inside a block
const CHUNK_SIZE: usize = 16;

/// One backend allocation carved into chunks
#[derive(Debug)]
struct AllocatedBlock
{
    base: Address,
    size: usize,
    permissions: Permissions,
    /// Offset of each live reservation mapped to its rounded size
    reservations: BTreeMap<usize, usize>,
}

impl AllocatedBlock
{
    fn new(base: Address, size: usize, permissions: Permissions) -> Self
    {
        Self {
            base,
            size,
            permissions,
            reservations: BTreeMap::new(),
        }
    }

    /// First-fit reservation of `size` bytes.
    fn reserve(&mut self, size: usize) -> Option<Address>
    {
        let size = size.max(1).div_ceil(CHUNK_SIZE) * CHUNK_SIZE;
        let mut cursor = 0usize;
        for (&offset, &length) in &self.reservations {
            if offset - cursor >= size {
                break;
            }
            cursor = offset + length;
        }
        if self.size.checked_sub(cursor)? < size {
            return None;
        }
        self.reservations.insert(cursor, size);
        Some(self.base + cursor as u64)
    }

    fn contains(&self, address: Address) -> bool
    {
        address
            .offset_from(self.base)
            .is_some_and(|offset| offset < self.size as u64)
    }

    fn free(&mut self, address: Address) -> bool
    {
        match address.offset_from(self.base) {
            Some(offset) => self.reservations.remove(&(offset as usize)).is_some(),
            None => false,
        }
    }
}

/// Scratch-memory pool keyed by permissions
///
/// Expression evaluation needs many small, short-lived buffers; each one
/// would otherwise cost a round trip to the backend. Blocks of at least
/// `block_size` bytes are requested from the backend and handed out in
/// 16-byte chunks.
#[derive(Debug)]
pub struct AllocatedMemoryCache
{
    block_size: usize,
    blocks: Mutex<Vec<AllocatedBlock>>,
}

impl AllocatedMemoryCache
{
    /// Create an empty pool that grows in `block_size` steps.
    #[must_use]
    pub fn new(block_size: usize) -> Self
    {
        Self {
            block_size: block_size.max(CHUNK_SIZE),
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// Reserve `size` bytes with `permissions`.
    ///
    /// `allocate_block` is called with a byte size when no existing block has
    /// room; it must return the base address of a fresh backend allocation.
    ///
    /// ## Errors
    ///
    /// Propagates the error of `allocate_block`.
    pub fn allocate<F>(&self, size: usize, permissions: Permissions, allocate_block: F) -> WardenResult<Address>
    where
        F: FnOnce(usize, Permissions) -> WardenResult<Address>,
    {
        let mut blocks = self.lock();
        for block in blocks.iter_mut().filter(|block| block.permissions == permissions) {
            if let Some(address) = block.reserve(size) {
                return Ok(address);
            }
        }

        let block_size = size.div_ceil(self.block_size).max(1) * self.block_size;
        let base = allocate_block(block_size, permissions)?;
        debug!(%base, block_size, %permissions, "allocated scratch block");
        let mut block = AllocatedBlock::new(base, block_size, permissions);
        let address = block.reserve(size);
        blocks.push(block);
        address.ok_or_else(|| crate::error::WardenError::Allocation(format!("unable to reserve {size} bytes")))
    }

    /// Release a reservation. Returns `false` for addresses the pool never handed out.
    pub fn deallocate(&self, address: Address) -> bool
    {
        let mut blocks = self.lock();
        blocks
            .iter_mut()
            .find(|block| block.contains(address))
            .is_some_and(|block| block.free(address))
    }

    /// Forget every block, returning their base addresses for the backend to free.
    pub fn clear(&self) -> Vec<Address>
    {
        self.lock().drain(..).map(|block| block.base).collect()
    }

    /// Number of backend blocks held.
    #[must_use]
    pub fn block_count(&self) -> usize
    {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AllocatedBlock>>
    {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_small_allocations_share_a_block()
    {
        let pool = AllocatedMemoryCache::new(4096);
        let mut calls = 0;
        let a = pool
            .allocate(24, Permissions::READ_WRITE, |_, _| {
                calls += 1;
                Ok(Address::new(0x10_0000))
            })
            .unwrap();
        let b = pool
            .allocate(8, Permissions::READ_WRITE, |_, _| unreachable!("block has room"))
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(a, Address::new(0x10_0000));
        assert_eq!(b, Address::new(0x10_0020));
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn test_permissions_get_separate_blocks()
    {
        let pool = AllocatedMemoryCache::new(4096);
        pool.allocate(8, Permissions::READ_WRITE, |_, _| Ok(Address::new(0x1000)))
            .unwrap();
        let exec = pool
            .allocate(8, Permissions::READ | Permissions::EXECUTE, |_, _| Ok(Address::new(0x9000)))
            .unwrap();
        assert_eq!(exec, Address::new(0x9000));
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn test_freed_chunk_is_reused()
    {
        let pool = AllocatedMemoryCache::new(64);
        let first = pool
            .allocate(16, Permissions::READ_WRITE, |_, _| Ok(Address::new(0x2000)))
            .unwrap();
        assert!(pool.deallocate(first));
        assert!(!pool.deallocate(first));
        let again = pool
            .allocate(16, Permissions::READ_WRITE, |_, _| unreachable!("chunk was freed"))
            .unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_large_request_rounds_block_up()
    {
        let pool = AllocatedMemoryCache::new(4096);
        let mut requested = 0;
        pool.allocate(5000, Permissions::READ_WRITE, |size, _| {
            requested = size;
            Ok(Address::new(0x4000))
        })
        .unwrap();
        assert_eq!(requested, 8192);
        assert_eq!(pool.clear(), vec![Address::new(0x4000)]);
    }
}
