//! Chained byte blocks with bump allocation.
//!
//! Each block is a `Vec<u8>` whose capacity is fixed when it is linked;
//! allocations only ever grow `len` within that capacity, so a block never
//! reallocates and offsets handed out stay valid until teardown.

use super::ArenaConfig;
use crate::error::{Error, Result};
use tracing::trace;

/// Bump allocator over a chain of blocks
#[derive(Debug, Default)]
pub(crate) struct BlockChain {
    blocks: Vec<Vec<u8>>,
    next_block_size: usize,
    max_block_size: usize,
    limit: Option<usize>,
    reserved: usize,
}

impl BlockChain {
    pub(crate) fn new(config: &ArenaConfig) -> Self {
        Self {
            blocks: Vec::new(),
            next_block_size: config.initial_block_size.max(1),
            max_block_size: config.max_block_size.max(config.initial_block_size),
            limit: config.memory_limit,
            reserved: 0,
        }
    }

    /// Allocate `size` zeroed bytes at an offset aligned to `align`.
    ///
    /// Returns `(block, offset)`.
    pub(crate) fn allocate(&mut self, size: usize, align: usize) -> Result<(u32, u32)> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {} is not a power of two",
                align
            )));
        }
        if size > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "allocation of {} bytes exceeds the block addressing range",
                size
            )));
        }

        if let Some(block) = self.blocks.last_mut() {
            let start = align_up(block.len(), align).ok_or(Error::AllocationExhausted {
                requested: size,
                limit: self.limit,
            })?;
            if start
                .checked_add(size)
                .is_some_and(|end| end <= block.capacity())
            {
                block.resize(start + size, 0);
                return Ok(((self.blocks.len() - 1) as u32, start as u32));
            }
        }

        self.link_block(size)?;
        let index = self.blocks.len() - 1;
        self.blocks[index].resize(size, 0);
        Ok((index as u32, 0))
    }

    /// Link a new block able to hold at least `size` bytes.
    fn link_block(&mut self, size: usize) -> Result<()> {
        let mut block_size = self.next_block_size.max(size);
        if let Some(limit) = self.limit {
            let remaining = limit.saturating_sub(self.reserved);
            if size > remaining {
                return Err(Error::AllocationExhausted {
                    requested: size,
                    limit: Some(limit),
                });
            }
            block_size = block_size.min(remaining);
        }

        let mut block = Vec::new();
        block
            .try_reserve_exact(block_size)
            .map_err(|_| Error::AllocationExhausted {
                requested: block_size,
                limit: self.limit,
            })?;

        self.reserved += block.capacity();
        trace!(
            "linked arena block #{} ({} bytes, {} reserved in total)",
            self.blocks.len(),
            block.capacity(),
            self.reserved
        );
        self.blocks.push(block);

        // Never shrink: each block is at least as large as the previous one
        self.next_block_size = block_size
            .max(self.next_block_size.saturating_mul(2).min(self.max_block_size));
        Ok(())
    }

    pub(crate) fn get(&self, block: u32, offset: u32, len: u32) -> Option<&[u8]> {
        let start = offset as usize;
        self.blocks
            .get(block as usize)?
            .get(start..start + len as usize)
    }

    pub(crate) fn get_mut(&mut self, block: u32, offset: u32, len: u32) -> Option<&mut [u8]> {
        let start = offset as usize;
        self.blocks
            .get_mut(block as usize)?
            .get_mut(start..start + len as usize)
    }

    /// Move every block of `other` to the end of this chain.
    ///
    /// Returns the index the first absorbed block received.
    pub(crate) fn absorb(&mut self, mut other: BlockChain) -> u32 {
        let base = self.blocks.len() as u32;
        self.reserved += other.reserved;
        self.blocks.append(&mut other.blocks);
        base
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn reserved(&self) -> usize {
        self.reserved
    }

    pub(crate) fn used(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub(crate) fn release(&mut self) {
        self.blocks = Vec::new();
        self.reserved = 0;
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(initial: usize, max: usize, limit: Option<usize>) -> BlockChain {
        let config = ArenaConfig::new()
            .initial_block_size(initial)
            .max_block_size(max);
        let config = match limit {
            Some(limit) => config.memory_limit(limit),
            None => config,
        };
        BlockChain::new(&config)
    }

    #[test]
    fn test_bump_within_block() {
        let mut blocks = chain(64, 1024, None);
        assert_eq!(blocks.allocate(3, 1).unwrap(), (0, 0));
        assert_eq!(blocks.allocate(8, 8).unwrap(), (0, 8));
        assert_eq!(blocks.allocate(1, 1).unwrap(), (0, 16));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks.used(), 17);
    }

    #[test]
    fn test_blocks_grow() {
        let mut blocks = chain(16, 1024, None);
        blocks.allocate(16, 1).unwrap();
        let (block, offset) = blocks.allocate(4, 1).unwrap();
        assert_eq!((block, offset), (1, 0));
        assert!(blocks.blocks[1].capacity() >= blocks.blocks[0].capacity());

        // Oversized requests get a block of their own
        let (block, _) = blocks.allocate(4096, 1).unwrap();
        assert_eq!(block, 2);
        assert!(blocks.blocks[2].capacity() >= 4096);
    }

    #[test]
    fn test_memory_limit() {
        let mut blocks = chain(16, 16, Some(40));
        blocks.allocate(16, 1).unwrap();
        blocks.allocate(16, 1).unwrap();
        let err = blocks.allocate(16, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::AllocationExhausted {
                requested: 16,
                limit: Some(40)
            }
        ));
    }

    #[test]
    fn test_bad_alignment() {
        let mut blocks = chain(16, 16, None);
        assert!(matches!(
            blocks.allocate(4, 3),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_huge_alignment() {
        let mut blocks = chain(16, 16, None);
        blocks.allocate(1, 1).unwrap();
        let align = 1usize << (usize::BITS - 1);
        assert!(matches!(
            blocks.allocate(1, align),
            Err(Error::AllocationExhausted { requested: 1, .. })
        ));
        assert_eq!(align_up(5, 8), Some(8));
        assert_eq!(align_up(usize::MAX, 2), None);
    }

    #[test]
    fn test_absorb() {
        let mut left = chain(16, 16, None);
        let mut right = chain(16, 16, None);
        left.allocate(4, 1).unwrap();
        right.allocate(4, 1).unwrap();
        right.get_mut(0, 0, 4).unwrap().copy_from_slice(b"abcd");

        let base = left.absorb(right);
        assert_eq!(base, 1);
        assert_eq!(left.get(1, 0, 4).unwrap(), b"abcd");
    }
}
