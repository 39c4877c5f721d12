use crate::error::{FlashError, Result};

/// Size of every block in the image
pub const BLOCK_SIZE: usize = 4096;

/// Bytes skipped at the start of every block in a chain
pub const BLOCK_HEADER_LEN: usize = 4;

/// Payload bytes carried by one block
pub const BLOCK_PAYLOAD_LEN: usize = BLOCK_SIZE - BLOCK_HEADER_LEN;

/// Sentinel for "no block": a free block's start byte, or the end of a chain
pub const NO_BLOCK: u8 = 0xFF;

/// Erased flash value used to pad unused bytes
pub const ERASED: u8 = 0xFF;

/// Link header (first two bytes of a block)
///
/// ```text
/// byte 0: chain-start index (0xFF = free)
/// byte 1: next-block index (0xFF = end of chain)
/// byte 2-3: unused by readers, written as 0xFF
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLink {
    pub start: u8,
    pub next: u8,
}

impl BlockLink {
    pub fn new(start: u8, next: u8) -> Self {
        BlockLink { start, next }
    }

    pub fn is_free(&self) -> bool {
        self.start == NO_BLOCK
    }

    /// A chain head names itself as the chain start
    pub fn is_head_of(&self, index: u32) -> bool {
        !self.is_free() && u32::from(self.start) == index
    }

    /// Successor block, if any
    pub fn next_block(&self) -> Option<u32> {
        if self.next == NO_BLOCK {
            None
        } else {
            Some(u32::from(self.next))
        }
    }

    pub fn to_header(&self) -> [u8; BLOCK_HEADER_LEN] {
        [self.start, self.next, ERASED, ERASED]
    }
}

/// A single 4KB block
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    bytes: Box<[u8; BLOCK_SIZE]>,
}

impl Block {
    /// An erased block (all 0xFF), which reads back as free
    pub fn erased() -> Self {
        Block {
            bytes: Box::new([ERASED; BLOCK_SIZE]),
        }
    }

    /// Build a chain block from its link and up to [`BLOCK_PAYLOAD_LEN`] payload bytes
    ///
    /// Unused tail bytes stay erased.
    pub fn with_payload(link: BlockLink, payload: &[u8]) -> Result<Self> {
        if payload.len() > BLOCK_PAYLOAD_LEN {
            return Err(FlashError::PayloadTooLarge(payload.len()));
        }

        let mut block = Block::erased();
        block.bytes[..BLOCK_HEADER_LEN].copy_from_slice(&link.to_header());
        block.bytes[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + payload.len()].copy_from_slice(payload);
        Ok(block)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; BLOCK_SIZE] = bytes.try_into().map_err(|_| {
            FlashError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "Block bytes wrong length: {} (expected {})",
                    bytes.len(),
                    BLOCK_SIZE
                ),
            ))
        })?;
        Ok(Block {
            bytes: Box::new(bytes),
        })
    }

    pub fn link(&self) -> BlockLink {
        BlockLink::new(self.bytes[0], self.bytes[1])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    /// Payload area after the header
    pub fn payload(&self) -> &[u8] {
        &self.bytes[BLOCK_HEADER_LEN..]
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block").field("link", &self.link()).finish()
    }
}
