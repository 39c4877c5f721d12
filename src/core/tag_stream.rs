//! TLV record stream spanning a chain of blocks
//!
//! Readers see one flat byte stream per chain; block boundaries and the
//! 4-byte header of every block are skipped transparently. Each record is
//! `tag (1 byte) | length (varlen) | payload (length bytes)`, and a tag of
//! 0xFF ends the stream.

use crate::core::block::{Block, BLOCK_HEADER_LEN, BLOCK_SIZE};
use crate::core::chain::ChainIndex;
use crate::core::io::ImageSource;
use crate::core::store::BlockStore;
use crate::core::varlen;
use crate::error::{FlashError, Result};

/// Tag value marking the end of a chain's records
pub const END_OF_RECORDS: u8 = 0xFF;

/// One decoded TLV record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub tag: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    At { block: u32, offset: usize },
    /// Past the last byte of the final block
    ChainEnd,
}

/// Finite iterator over the records of one chain
///
/// Yields each record in stream order, stops at the end marker, and is fused
/// after the end or after the first error. Build a new one from the same head
/// to read the chain again.
pub struct TagRecords<'a, S> {
    store: &'a mut BlockStore<S>,
    index: &'a ChainIndex,
    head: u32,
    cursor: Cursor,
    current: Option<Block>,
    hops: u32,
    finished: bool,
}

impl<'a, S: ImageSource> TagRecords<'a, S> {
    pub fn new(store: &'a mut BlockStore<S>, index: &'a ChainIndex, head: u32) -> Self {
        TagRecords {
            store,
            index,
            head,
            cursor: Cursor::At {
                block: head,
                offset: BLOCK_HEADER_LEN,
            },
            current: None,
            hops: 0,
            finished: false,
        }
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    fn read_byte(&mut self) -> Result<u8> {
        let (block, offset) = match self.cursor {
            Cursor::At { block, offset } => (block, offset),
            Cursor::ChainEnd => return Err(FlashError::ChainTruncated { head: self.head }),
        };

        let byte = match &self.current {
            Some(current) => current.as_bytes()[offset],
            None => {
                let loaded = self.store.read(block)?;
                let byte = loaded.as_bytes()[offset];
                self.current = Some(loaded);
                byte
            }
        };

        if offset == BLOCK_SIZE - 1 {
            self.cursor = match self.index.next_of(block)? {
                Some(next) => {
                    self.hops += 1;
                    if self.hops >= self.index.block_count() {
                        return Err(FlashError::ChainCycle {
                            head: self.head,
                            hops: self.hops,
                        });
                    }
                    Cursor::At {
                        block: next,
                        offset: BLOCK_HEADER_LEN,
                    }
                }
                None => Cursor::ChainEnd,
            };
            self.current = None;
        } else {
            self.cursor = Cursor::At {
                block,
                offset: offset + 1,
            };
        }

        Ok(byte)
    }

    /// Read the next record, or `None` at the end of the stream
    pub fn read_record(&mut self) -> Result<Option<TagRecord>> {
        // Running off the final block between records is a structural end
        if self.cursor == Cursor::ChainEnd {
            return Ok(None);
        }

        let tag = self.read_byte()?;
        if tag == END_OF_RECORDS {
            return Ok(None);
        }

        let len = varlen::decode_with(|| self.read_byte())? as usize;

        // A corrupt length must not drive a huge up-front allocation
        let bound = self.index.block_count() as usize * BLOCK_SIZE;
        let mut payload = Vec::with_capacity(len.min(bound));
        for _ in 0..len {
            payload.push(self.read_byte()?);
        }

        Ok(Some(TagRecord { tag, payload }))
    }
}

impl<S: ImageSource> Iterator for TagRecords<'_, S> {
    type Item = Result<TagRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<S: ImageSource> std::iter::FusedIterator for TagRecords<'_, S> {}

/// Append one record to `out`
pub fn write_record(tag: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if tag == END_OF_RECORDS {
        return Err(FlashError::ReservedTag);
    }

    let len = u32::try_from(payload.len()).map_err(|_| FlashError::PayloadTooLarge(payload.len()))?;

    out.push(tag);
    varlen::encode_into(len, out);
    out.extend_from_slice(payload);
    Ok(())
}

/// Serialize records in order into one flat byte sequence
///
/// Splitting the sequence into blocks is the inserter's job.
pub fn write_records<'r, I>(records: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (u8, &'r [u8])>,
{
    let mut out = Vec::new();
    for (tag, payload) in records {
        write_record(tag, payload, &mut out)?;
    }
    Ok(out)
}
