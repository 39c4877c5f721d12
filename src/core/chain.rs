//! Chain index: free / head / interior classification of every block

use crate::core::block::{BlockLink, NO_BLOCK};
use crate::core::io::ImageSource;
use crate::core::store::BlockStore;
use crate::error::{FlashError, Result};
use tracing::debug;

/// Link headers of every block in an image
///
/// Built once per image by reading the two-byte header of each block.
#[derive(Debug, Clone)]
pub struct ChainIndex {
    links: Vec<BlockLink>,
}

impl ChainIndex {
    /// Read the link header of every block
    pub fn scan<S: ImageSource>(store: &mut BlockStore<S>) -> Result<Self> {
        let mut links = Vec::with_capacity(store.block_count() as usize);
        let mut header = [0u8; 2];

        for index in 0..store.block_count() {
            store.read_prefix(index, &mut header)?;
            links.push(BlockLink::new(header[0], header[1]));
        }

        let index = ChainIndex { links };
        debug!(
            "Scanned {} blocks: {} free, {} chain heads",
            index.block_count(),
            index.scan_free_blocks().count(),
            index.scan_chain_heads().count()
        );
        Ok(index)
    }

    pub fn from_links(links: Vec<BlockLink>) -> Self {
        ChainIndex { links }
    }

    pub fn block_count(&self) -> u32 {
        self.links.len() as u32
    }

    /// (start, next) pair of a block
    pub fn link_of(&self, index: u32) -> Result<BlockLink> {
        self.links
            .get(index as usize)
            .copied()
            .ok_or(FlashError::InvalidBlockIndex {
                block: index,
                block_count: self.block_count(),
            })
    }

    pub fn is_free(&self, index: u32) -> bool {
        self.links
            .get(index as usize)
            .is_some_and(|link| link.is_free())
    }

    pub fn is_chain_head(&self, index: u32) -> bool {
        self.links
            .get(index as usize)
            .is_some_and(|link| link.is_head_of(index))
    }

    /// Free block indices, ascending
    pub fn scan_free_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.block_count()).filter(move |&i| self.is_free(i))
    }

    /// Chain head indices, ascending
    pub fn scan_chain_heads(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.block_count()).filter(move |&i| self.is_chain_head(i))
    }

    /// Successor of `index` within the chain started at `head`
    ///
    /// `None` at the end of the chain. A next pointer outside the image is an
    /// error.
    pub fn next_of(&self, index: u32) -> Result<Option<u32>> {
        match self.link_of(index)?.next_block() {
            Some(next) if next >= self.block_count() => Err(FlashError::InvalidBlockIndex {
                block: next,
                block_count: self.block_count(),
            }),
            next => Ok(next),
        }
    }

    /// Ordered blocks of the chain starting at `head`
    ///
    /// Terminates within `block_count` hops; a longer walk can only be a cycle.
    pub fn chain(&self, head: u32) -> Result<Vec<u32>> {
        let mut blocks = vec![head];
        let mut current = head;

        while let Some(next) = self.next_of(current)? {
            if blocks.len() as u32 >= self.block_count() {
                return Err(FlashError::ChainCycle {
                    head,
                    hops: blocks.len() as u32,
                });
            }
            blocks.push(next);
            current = next;
        }

        Ok(blocks)
    }

    /// Free blocks that a new chain can address
    ///
    /// Link fields are one byte and 0xFF is the sentinel, so blocks at index
    /// 255 and above can never join a chain.
    pub fn allocatable_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.scan_free_blocks().filter(|&i| i < u32::from(NO_BLOCK))
    }
}
