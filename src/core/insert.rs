//! Insertion of a new binary image into free blocks
//!
//! The new chain is built entirely in memory first. Only once every block
//! it needs has been claimed is anything written, and the output is always a
//! separate image: claimed blocks are replaced, every other block is copied
//! through unchanged, in ascending order.

use crate::core::block::{Block, BlockLink, BLOCK_PAYLOAD_LEN, NO_BLOCK};
use crate::core::chain::ChainIndex;
use crate::core::directory::{
    is_safe_filename, tags, TagDirectory, FLAGS_BINARY_IMAGE, FLAGS_MASK,
};
use crate::core::io::{ImageSink, ImageSource};
use crate::core::object::LoadableObject;
use crate::core::store::BlockStore;
use crate::error::{FlashError, Result};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Checksum written for new entries; the on-flash value is never computed
pub const CHECKSUM_PLACEHOLDER: [u8; 4] = [0; 4];

/// Tag directory for a binary image, in on-flash order
///
/// The name is stored as raw bytes and read back one byte per character, so
/// only ASCII names that extraction would accept are stored.
pub fn binary_directory(filename: &str, object: &LoadableObject) -> Result<TagDirectory> {
    if !filename.is_ascii() || !is_safe_filename(filename) {
        return Err(FlashError::InvalidFilename(filename.to_string()));
    }

    Ok([
        (tags::FILENAME, filename.as_bytes().to_vec()),
        (tags::FLAGS, vec![FLAGS_BINARY_IMAGE ^ FLAGS_MASK]),
        (tags::CODE, object.code.clone()),
        (tags::ENTRY_POINT, object.entry_point.to_be_bytes().to_vec()),
        (tags::LOAD_ADDRESS, object.load_address.to_be_bytes().to_vec()),
        (tags::CHECKSUM, CHECKSUM_PLACEHOLDER.to_vec()),
    ]
    .into_iter()
    .collect())
}

/// Blocks of a new chain, ready to be written
#[derive(Debug, Clone)]
pub struct InsertPlan {
    head: u32,
    blocks: BTreeMap<u32, Block>,
}

impl InsertPlan {
    /// Serialize `directory` and lay it out over the lowest free blocks
    ///
    /// Fails with [`FlashError::InsufficientSpace`] before anything is
    /// written if the free blocks run out.
    pub fn new(index: &ChainIndex, directory: &TagDirectory) -> Result<Self> {
        let stream = directory.to_bytes()?;
        let mut chunks: Vec<&[u8]> = stream.chunks(BLOCK_PAYLOAD_LEN).collect();
        if chunks.is_empty() {
            // An empty directory still occupies its head block
            chunks.push(&[]);
        }

        let free: Vec<u32> = index.allocatable_blocks().take(chunks.len()).collect();
        if free.len() < chunks.len() {
            return Err(FlashError::InsufficientSpace {
                needed: chunks.len(),
                available: index.allocatable_blocks().count(),
            });
        }

        let head = free[0];
        let mut blocks = BTreeMap::new();
        for (pos, (&block, chunk)) in free.iter().zip(&chunks).enumerate() {
            let next = free.get(pos + 1).map_or(NO_BLOCK, |&n| n as u8);
            let link = BlockLink::new(head as u8, next);
            blocks.insert(block, Block::with_payload(link, chunk)?);
        }

        debug!(
            "Planned {}-byte chain over blocks {:?}",
            stream.len(),
            free
        );
        Ok(InsertPlan { head, blocks })
    }

    /// Chain head of the new entry
    pub fn head(&self) -> u32 {
        self.head
    }

    /// Claimed block indices, ascending
    pub fn claimed(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.keys().copied()
    }

    pub fn block(&self, index: u32) -> Option<&Block> {
        self.blocks.get(&index)
    }

    /// Emit the new image: claimed blocks replaced, all others copied verbatim
    pub fn write_image<S, T>(&self, source: &mut BlockStore<S>, out: &mut BlockStore<T>) -> Result<()>
    where
        S: ImageSource,
        T: ImageSink,
    {
        if out.block_count() != source.block_count() {
            return Err(FlashError::ImageSizeMismatch {
                expected: source.block_count(),
                actual: out.block_count(),
            });
        }

        for index in 0..source.block_count() {
            match self.blocks.get(&index) {
                Some(block) => out.write(index, block)?,
                None => out.write(index, &source.read(index)?)?,
            }
        }
        out.sync()?;

        info!(
            "Wrote {} blocks, new chain at block {} over {} blocks",
            source.block_count(),
            self.head,
            self.blocks.len()
        );
        Ok(())
    }
}

/// Insert `object` under `filename` and write the resulting image to `out`
pub fn insert_binary<S, T>(
    source: &mut BlockStore<S>,
    index: &ChainIndex,
    filename: &str,
    object: &LoadableObject,
    out: &mut BlockStore<T>,
) -> Result<InsertPlan>
where
    S: ImageSource,
    T: ImageSink,
{
    let plan = InsertPlan::new(index, &binary_directory(filename, object)?)?;
    plan.write_image(source, out)?;
    Ok(plan)
}
