//! Block-granular view over an image

use crate::core::block::{Block, BLOCK_SIZE};
use crate::core::io::{ImageSink, ImageSource};
use crate::error::{FlashError, Result};

/// Fixed-size random-access view over an image
///
/// The sole I/O primitive of the filesystem. Nothing is cached: every
/// [`read`](BlockStore::read) goes back to the source.
pub struct BlockStore<S> {
    source: S,
    block_count: u32,
}

impl<S: ImageSource> BlockStore<S> {
    /// Wrap a source whose length must be a whole number of blocks
    pub fn open(source: S) -> Result<Self> {
        let len = source.len_bytes()?;
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(FlashError::MisalignedImage { len });
        }

        let block_count =
            u32::try_from(len / BLOCK_SIZE as u64).map_err(|_| FlashError::MisalignedImage { len })?;

        Ok(BlockStore {
            source,
            block_count,
        })
    }

    /// Read a whole block
    pub fn read(&mut self, index: u32) -> Result<Block> {
        if index >= self.block_count {
            return Err(FlashError::InvalidBlockIndex {
                block: index,
                block_count: self.block_count,
            });
        }

        let mut buffer = vec![0u8; BLOCK_SIZE];
        let got = self.source.read_at(Self::offset_of(index), &mut buffer)?;
        if got < BLOCK_SIZE {
            return Err(FlashError::TruncatedRead { block: index, got });
        }

        Block::from_bytes(&buffer)
    }

    /// Read just the first `buf.len()` bytes of a block
    pub fn read_prefix(&mut self, index: u32, buf: &mut [u8]) -> Result<()> {
        if index >= self.block_count {
            return Err(FlashError::InvalidBlockIndex {
                block: index,
                block_count: self.block_count,
            });
        }

        let got = self.source.read_at(Self::offset_of(index), buf)?;
        if got < buf.len() {
            return Err(FlashError::TruncatedRead { block: index, got });
        }
        Ok(())
    }
}

impl<S> BlockStore<S> {
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    fn offset_of(index: u32) -> u64 {
        u64::from(index) * BLOCK_SIZE as u64
    }
}

impl<S: ImageSink> BlockStore<S> {
    /// Start an output image of `block_count` blocks
    ///
    /// The sink is written to, never read, so it needs no existing contents.
    pub fn for_output(sink: S, block_count: u32) -> Self {
        BlockStore {
            source: sink,
            block_count,
        }
    }

    /// Write a whole block
    pub fn write(&mut self, index: u32, block: &Block) -> Result<()> {
        if index >= self.block_count {
            return Err(FlashError::InvalidBlockIndex {
                block: index,
                block_count: self.block_count,
            });
        }

        self.source.write_at(Self::offset_of(index), block.as_bytes())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.source.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockLink;
    use crate::core::io::MemoryImage;

    #[test]
    fn test_rejects_misaligned_image() {
        let result = BlockStore::open(MemoryImage::with_len(BLOCK_SIZE + 1));
        assert!(matches!(
            result,
            Err(FlashError::MisalignedImage { len }) if len == BLOCK_SIZE as u64 + 1
        ));
    }

    #[test]
    fn test_block_count() {
        let store = BlockStore::open(MemoryImage::with_len(3 * BLOCK_SIZE)).unwrap();
        assert_eq!(store.block_count(), 3);

        let empty = BlockStore::open(MemoryImage::default()).unwrap();
        assert_eq!(empty.block_count(), 0);
    }

    #[test]
    fn test_read_out_of_range() {
        let mut store = BlockStore::open(MemoryImage::with_len(BLOCK_SIZE)).unwrap();
        assert!(matches!(
            store.read(1),
            Err(FlashError::InvalidBlockIndex { block: 1, block_count: 1 })
        ));
    }

    /// Source that reports a full length but serves fewer bytes
    struct ShortSource;

    impl ImageSource for ShortSource {
        fn len_bytes(&self) -> Result<u64> {
            Ok(BLOCK_SIZE as u64)
        }

        fn read_at(&mut self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(100);
            buf[..n].fill(0);
            Ok(n)
        }
    }

    /// Source whose length cannot be determined
    struct UnsizedSource;

    impl ImageSource for UnsizedSource {
        fn len_bytes(&self) -> Result<u64> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "metadata unavailable").into())
        }

        fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_length_error_propagates() {
        assert!(matches!(
            BlockStore::open(UnsizedSource),
            Err(FlashError::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied
        ));
    }

    #[test]
    fn test_read_prefix_out_of_range() {
        let mut store = BlockStore::open(MemoryImage::new(vec![0xFF; 2 * BLOCK_SIZE])).unwrap();
        let mut header = [0u8; 2];

        store.read_prefix(1, &mut header).unwrap();
        assert_eq!(header, [0xFF, 0xFF]);
        assert!(matches!(
            store.read_prefix(2, &mut header),
            Err(FlashError::InvalidBlockIndex { block: 2, block_count: 2 })
        ));
    }

    #[test]
    fn test_truncated_read() {
        let mut store = BlockStore::open(ShortSource).unwrap();
        assert!(matches!(
            store.read(0),
            Err(FlashError::TruncatedRead { block: 0, got: 100 })
        ));
    }

    #[test]
    fn test_write_then_read() {
        let mut out = BlockStore::for_output(MemoryImage::default(), 2);
        let block = Block::with_payload(BlockLink::new(1, 0xFF), b"payload").unwrap();
        out.write(0, &Block::erased()).unwrap();
        out.write(1, &block).unwrap();

        let mut store = BlockStore::open(out.into_inner()).unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.read(1).unwrap(), block);
        assert!(store.read(0).unwrap().link().is_free());
    }
}
