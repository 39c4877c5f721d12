//! Tag directory: the decoded records of one stored entry
//!
//! A directory maps one-byte tag codes to raw payloads. Iteration follows
//! first-insertion order, which is also the order records are serialized in,
//! so filename and flags stay ahead of the content tags.

use crate::core::chain::ChainIndex;
use crate::core::io::ImageSource;
use crate::core::store::BlockStore;
use crate::core::tag_stream::{self, TagRecords};
use crate::error::Result;
use serde::Serialize;

/// Known tag codes
pub mod tags {
    /// ASCII filename, no terminator
    pub const FILENAME: u8 = 0x01;
    /// One byte, stored inverted
    pub const FLAGS: u8 = 0x03;
    /// Regular file contents
    pub const FILE_CONTENT: u8 = 0x1E;
    /// Optional string table of a binary image
    pub const STRING_TABLE: u8 = 0x20;
    /// Binary image code
    pub const CODE: u8 = 0xB1;
    /// Entry point, 4 bytes big-endian
    pub const ENTRY_POINT: u8 = 0xB5;
    /// Load address, 4 bytes big-endian
    pub const LOAD_ADDRESS: u8 = 0xBA;
    /// Checksum, 4 bytes big-endian, never verified
    pub const CHECKSUM: u8 = 0xBC;
}

/// Flags are stored XORed with this mask
pub const FLAGS_MASK: u8 = 0xFF;

/// Decoded flags of a regular file
pub const FLAGS_REGULAR_FILE: u8 = 0x00;

/// Decoded flags of a binary image
pub const FLAGS_BINARY_IMAGE: u8 = 0x03;

/// A name is written only as a plain file inside the output directory
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// What an entry holds, from its decoded flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "flags")]
pub enum EntryKind {
    RegularFile,
    BinaryImage,
    Unknown(u8),
}

impl EntryKind {
    pub fn from_flags(flags: u8) -> Self {
        match flags {
            FLAGS_REGULAR_FILE => EntryKind::RegularFile,
            FLAGS_BINARY_IMAGE => EntryKind::BinaryImage,
            other => EntryKind::Unknown(other),
        }
    }
}

/// Order-preserving tag -> payload map
#[derive(Clone, PartialEq, Eq)]
pub struct TagDirectory {
    entries: Vec<(u8, Vec<u8>)>,
    /// Position of each tag in `entries`
    slots: [Option<u16>; 256],
}

impl Default for TagDirectory {
    fn default() -> Self {
        TagDirectory {
            entries: Vec::new(),
            slots: [None; 256],
        }
    }
}

impl TagDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every record of the chain starting at `head`
    pub fn read<S: ImageSource>(
        store: &mut BlockStore<S>,
        index: &ChainIndex,
        head: u32,
    ) -> Result<Self> {
        let mut directory = TagDirectory::new();
        for record in TagRecords::new(store, index, head) {
            let record = record?;
            directory.insert(record.tag, record.payload);
        }
        Ok(directory)
    }

    /// Set a tag's payload
    ///
    /// A tag already present keeps its position and has its payload replaced;
    /// the old payload is returned.
    pub fn insert(&mut self, tag: u8, payload: Vec<u8>) -> Option<Vec<u8>> {
        match self.slots[tag as usize] {
            Some(pos) => Some(std::mem::replace(&mut self.entries[pos as usize].1, payload)),
            None => {
                self.slots[tag as usize] = Some(self.entries.len() as u16);
                self.entries.push((tag, payload));
                None
            }
        }
    }

    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.slots[tag as usize].map(|pos| self.entries[pos as usize].1.as_slice())
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.slots[tag as usize].is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> + '_ {
        self.entries.iter().map(|(tag, payload)| (*tag, payload.as_slice()))
    }

    /// Serialize as a flat TLV byte sequence in insertion order
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        tag_stream::write_records(self.iter())
    }

    /// Filename, each byte taken as one character
    pub fn filename(&self) -> Option<String> {
        self.get(tags::FILENAME)
            .map(|bytes| bytes.iter().map(|&b| char::from(b)).collect())
    }

    /// Decoded (un-inverted) flags byte
    pub fn flags(&self) -> Option<u8> {
        self.get(tags::FLAGS)
            .and_then(|bytes| bytes.first())
            .map(|&stored| stored ^ FLAGS_MASK)
    }

    pub fn kind(&self) -> Option<EntryKind> {
        self.flags().map(EntryKind::from_flags)
    }

    fn get_u32_be(&self, tag: u8) -> Option<u32> {
        let bytes: [u8; 4] = self.get(tag)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.get_u32_be(tags::ENTRY_POINT)
    }

    pub fn load_address(&self) -> Option<u32> {
        self.get_u32_be(tags::LOAD_ADDRESS)
    }

    pub fn checksum(&self) -> Option<u32> {
        self.get_u32_be(tags::CHECKSUM)
    }
}

impl std::fmt::Debug for TagDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(tag, payload)| (format!("{tag:#04x}"), payload.len())),
            )
            .finish()
    }
}

impl FromIterator<(u8, Vec<u8>)> for TagDirectory {
    fn from_iter<I: IntoIterator<Item = (u8, Vec<u8>)>>(iter: I) -> Self {
        let mut directory = TagDirectory::new();
        for (tag, payload) in iter {
            directory.insert(tag, payload);
        }
        directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let dir: TagDirectory = [
            (tags::FILENAME, b"boot".to_vec()),
            (tags::FLAGS, vec![0xFC]),
            (tags::CODE, vec![1, 2, 3]),
        ]
        .into_iter()
        .collect();

        let order: Vec<u8> = dir.iter().map(|(tag, _)| tag).collect();
        assert_eq!(order, vec![tags::FILENAME, tags::FLAGS, tags::CODE]);
    }

    #[test]
    fn test_duplicate_overwrites_in_place() {
        let mut dir = TagDirectory::new();
        dir.insert(0x01, b"old".to_vec());
        dir.insert(0x1E, b"data".to_vec());

        let previous = dir.insert(0x01, b"new".to_vec());
        assert_eq!(previous, Some(b"old".to_vec()));
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.get(0x01), Some(&b"new"[..]));
        assert_eq!(dir.iter().next().map(|(tag, _)| tag), Some(0x01));
    }

    #[test]
    fn test_flags_are_inverted() {
        let mut dir = TagDirectory::new();
        assert_eq!(dir.flags(), None);

        dir.insert(tags::FLAGS, vec![0xFF]);
        assert_eq!(dir.flags(), Some(0x00));
        assert_eq!(dir.kind(), Some(EntryKind::RegularFile));

        dir.insert(tags::FLAGS, vec![0xFC]);
        assert_eq!(dir.flags(), Some(0x03));
        assert_eq!(dir.kind(), Some(EntryKind::BinaryImage));

        dir.insert(tags::FLAGS, vec![0x00]);
        assert_eq!(dir.kind(), Some(EntryKind::Unknown(0xFF)));
    }

    #[test]
    fn test_big_endian_fields() {
        let mut dir = TagDirectory::new();
        dir.insert(tags::ENTRY_POINT, vec![0x00, 0x01, 0x02, 0x03]);
        dir.insert(tags::LOAD_ADDRESS, vec![0x20, 0x00, 0x00, 0x00]);
        dir.insert(tags::CHECKSUM, vec![0xDE, 0xAD]);

        assert_eq!(dir.entry_point(), Some(0x0001_0203));
        assert_eq!(dir.load_address(), Some(0x2000_0000));
        // Wrong width is treated as absent
        assert_eq!(dir.checksum(), None);
    }

    #[test]
    fn test_filename_bytes_as_chars() {
        let mut dir = TagDirectory::new();
        dir.insert(tags::FILENAME, b"a.py".to_vec());
        assert_eq!(dir.filename().as_deref(), Some("a.py"));

        dir.insert(tags::FILENAME, vec![b'x', 0xE9]);
        assert_eq!(dir.filename().as_deref(), Some("x\u{e9}"));
    }

    #[test]
    fn test_to_bytes() {
        let mut dir = TagDirectory::new();
        dir.insert(tags::FILENAME, b"a.py".to_vec());
        dir.insert(tags::FLAGS, vec![0xFF]);

        assert_eq!(
            dir.to_bytes().unwrap(),
            vec![0x01, 0x04, b'a', b'.', b'p', b'y', 0x03, 0x01, 0xFF]
        );
    }
}
