//! Error types for flash image operations

use thiserror::Error;

/// Flash image operation result type
pub type Result<T> = std::result::Result<T, FlashError>;

/// Flash image operation errors
#[derive(Error, Debug)]
pub enum FlashError {
    /// Underlying I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image length is not a whole number of blocks
    #[error("Image length {len} is not a multiple of the 4096-byte block size")]
    MisalignedImage { len: u64 },

    /// A block read returned fewer than 4096 bytes
    #[error("Truncated read of block {block}: got {got} of 4096 bytes")]
    TruncatedRead { block: u32, got: usize },

    /// A link header points outside the image
    #[error("Block index {block} out of range (image has {block_count} blocks)")]
    InvalidBlockIndex { block: u32, block_count: u32 },

    /// Output image does not match the source's block count
    #[error("Output image has {actual} blocks, source has {expected}")]
    ImageSizeMismatch { expected: u32, actual: u32 },

    /// Following next pointers did not terminate within the image's block count
    #[error("Chain starting at block {head} does not terminate after {hops} hops")]
    ChainCycle { head: u32, hops: u32 },

    /// The chain ended while a record was still being read
    #[error("Chain starting at block {head} ends in the middle of a record")]
    ChainTruncated { head: u32 },

    /// A length field does not fit in 32 bits
    #[error("Variable-length integer overflows 32 bits")]
    VarLenOverflow,

    /// A payload is too large to be length-encoded
    #[error("Payload too large to encode: {0} bytes")]
    PayloadTooLarge(usize),

    /// Tag 0xFF cannot be stored as a record
    #[error("Tag 0xFF is reserved as the end-of-records marker")]
    ReservedTag,

    /// Not enough free blocks to hold a new chain
    #[error("Insufficient space: need {needed} free blocks, {available} available")]
    InsufficientSpace { needed: usize, available: usize },

    /// A filename that could not be read back or extracted
    #[error("Invalid filename {0:?}: must be ASCII, non-empty, not . or .., without / \\ or NUL")]
    InvalidFilename(String),

    /// Insertion output would replace the source image
    #[error("Output image {0:?} is the source image")]
    OutputIsInput(std::path::PathBuf),

    /// The loadable object could not be parsed
    #[error("Invalid object file: {0}")]
    InvalidObject(String),

    /// Configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Report serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlashError {
    /// Whether the error is confined to a single chain
    ///
    /// Extraction reports such errors against the offending entry and keeps
    /// scanning. Everything else aborts the operation.
    pub fn is_entry_local(&self) -> bool {
        matches!(
            self,
            FlashError::InvalidBlockIndex { .. }
                | FlashError::ChainCycle { .. }
                | FlashError::ChainTruncated { .. }
                | FlashError::VarLenOverflow
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_local_classification() {
        assert!(FlashError::ChainCycle { head: 0, hops: 3 }.is_entry_local());
        assert!(FlashError::ChainTruncated { head: 1 }.is_entry_local());
        assert!(FlashError::VarLenOverflow.is_entry_local());
        assert!(!FlashError::MisalignedImage { len: 10 }.is_entry_local());
        assert!(!FlashError::TruncatedRead { block: 0, got: 12 }.is_entry_local());
        assert!(!FlashError::InsufficientSpace {
            needed: 1,
            available: 0
        }
        .is_entry_local());
    }

    #[test]
    fn test_invalid_filename_is_fatal() {
        assert!(!FlashError::InvalidFilename("a/b".into()).is_entry_local());
    }

    #[test]
    fn test_display_messages() {
        let err = FlashError::InsufficientSpace {
            needed: 3,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient space: need 3 free blocks, 1 available"
        );
    }
}
