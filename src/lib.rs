//! # tagflash - chain-linked TLV flash filesystem images
//!
//! `tagflash-rs` reads and writes the flash filesystem of an embedded Wi-Fi
//! module: a sequence of 4KB blocks linked into chains, each chain holding
//! one entry as a stream of tag/length/value records.
//!
//! - **Extract** every stored file and binary image from a raw flash dump
//! - **Insert** a new binary image into free blocks, leaving every other
//!   block byte-for-byte intact
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tagflash_rs::{Config, FlashImage, Result};
//!
//! # fn main() -> Result<()> {
//! let config = Config::default();
//! let mut image = FlashImage::open("flash.bin")?;
//!
//! let report = image.extract_to("out", &config.extract)?;
//! println!("{} entries extracted", report.extracted());
//! # Ok(())
//! # }
//! ```
//!
//! ## Inserting
//!
//! ```rust,no_run
//! use tagflash_rs::{FlashImage, LoadableObject, Result};
//!
//! # fn main() -> Result<()> {
//! let elf = std::fs::read("app.elf")?;
//! let object = LoadableObject::from_elf(&elf, ".text")?;
//!
//! let mut image = FlashImage::open("flash.bin")?;
//! image.insert_to_path("app", &object, "flash-new.bin")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;

pub use crate::config::{Config, ExtractConfig, InsertConfig};
pub use crate::core::{
    block::{Block, BlockLink, BLOCK_HEADER_LEN, BLOCK_PAYLOAD_LEN, BLOCK_SIZE, NO_BLOCK},
    chain::ChainIndex,
    directory::{tags, EntryKind, TagDirectory},
    extract::{Artifact, EntryOutcome, EntryReport, ExtractReport, Extractor, SkipReason},
    insert::{binary_directory, insert_binary, InsertPlan},
    io::{FileImage, ImageSink, ImageSource, MappedImage, MemoryImage},
    object::LoadableObject,
    store::BlockStore,
    tag_stream::{TagRecord, TagRecords},
};
pub use crate::error::{FlashError, Result};

use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

/// Whether two paths name the same existing file
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// A flash image opened for extraction or insertion
///
/// Holds the block store and its chain index. The source is only ever read;
/// insertion always produces a separate image.
///
/// # Examples
///
/// ```rust
/// use tagflash_rs::{FlashImage, LoadableObject, BLOCK_SIZE};
///
/// # fn main() -> tagflash_rs::Result<()> {
/// // Two erased blocks: both free
/// let mut image = FlashImage::from_bytes(vec![0xFF; 2 * BLOCK_SIZE])?;
/// let object = LoadableObject::new(vec![0x01, 0x00, 0x00, 0x00], 0x2000, 0x2000);
///
/// let bytes = image.insert_to_vec("app", &object)?;
/// let mut updated = FlashImage::from_bytes(bytes)?;
/// assert_eq!(updated.read_entry(0)?.filename().as_deref(), Some("app"));
/// # Ok(())
/// # }
/// ```
pub struct FlashImage<S> {
    store: BlockStore<S>,
    index: ChainIndex,
}

impl FlashImage<FileImage> {
    /// Open an image file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening flash image at {:?}", path.as_ref());
        Self::new(FileImage::open(path)?)
    }
}

impl FlashImage<MappedImage> {
    /// Memory-map an image file
    pub fn open_mapped<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Mapping flash image at {:?}", path.as_ref());
        Self::new(MappedImage::open(path)?)
    }
}

impl FlashImage<MemoryImage> {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::new(MemoryImage::new(bytes))
    }
}

impl<S: ImageSource> FlashImage<S> {
    /// Wrap any random-access source
    pub fn new(source: S) -> Result<Self> {
        let mut store = BlockStore::open(source)?;
        let index = ChainIndex::scan(&mut store)?;
        Ok(FlashImage { store, index })
    }

    pub fn block_count(&self) -> u32 {
        self.store.block_count()
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    /// Decode the entry whose chain starts at `head`
    pub fn read_entry(&mut self, head: u32) -> Result<TagDirectory> {
        TagDirectory::read(&mut self.store, &self.index, head)
    }

    /// Iterate the raw records of the chain starting at `head`
    pub fn records(&mut self, head: u32) -> TagRecords<'_, S> {
        TagRecords::new(&mut self.store, &self.index, head)
    }

    /// Decode every entry; corrupt chains are returned as error messages
    pub fn entries(
        &mut self,
    ) -> Result<Vec<(u32, std::result::Result<TagDirectory, String>)>> {
        let config = ExtractConfig::default();
        Extractor::new(&config).list(&mut self.store, &self.index)
    }

    /// Write every recognised entry into `output_dir`
    pub fn extract_to<P: AsRef<Path>>(
        &mut self,
        output_dir: P,
        config: &ExtractConfig,
    ) -> Result<ExtractReport> {
        Extractor::new(config).extract_to_dir(&mut self.store, &self.index, output_dir.as_ref())
    }

    /// Render every recognised entry, handing files to `emit`
    pub fn extract_with<F>(&mut self, config: &ExtractConfig, emit: F) -> Result<ExtractReport>
    where
        F: FnMut(&Artifact) -> Result<()>,
    {
        Extractor::new(config).extract_with(&mut self.store, &self.index, emit)
    }

    /// Plan the chain for a new binary image without writing anything
    pub fn plan_insert(&self, filename: &str, object: &LoadableObject) -> Result<InsertPlan> {
        InsertPlan::new(&self.index, &binary_directory(filename, object)?)
    }

    /// Insert a binary image, writing the new image to `sink`
    pub fn insert_into<T: ImageSink>(
        &mut self,
        filename: &str,
        object: &LoadableObject,
        sink: T,
    ) -> Result<InsertPlan> {
        let mut out = BlockStore::for_output(sink, self.store.block_count());
        insert_binary(&mut self.store, &self.index, filename, object, &mut out)
    }

    /// Insert a binary image and return the new image bytes
    pub fn insert_to_vec(&mut self, filename: &str, object: &LoadableObject) -> Result<Vec<u8>> {
        let mut out = MemoryImage::default();
        self.insert_into(filename, object, &mut out)?;
        Ok(out.into_inner())
    }

    /// Insert a binary image and write the new image to `path`
    ///
    /// The image is written to a temporary file next to `path` and only moved
    /// into place once complete, so a failed insertion leaves nothing behind.
    /// `path` must not be the file the image was opened from.
    pub fn insert_to_path<P: AsRef<Path>>(
        &mut self,
        filename: &str,
        object: &LoadableObject,
        path: P,
    ) -> Result<InsertPlan> {
        let path = path.as_ref();
        if let Some(source) = self.store.source().path() {
            if same_file(source, path) {
                return Err(FlashError::OutputIsInput(path.to_path_buf()));
            }
        }
        let plan = self.plan_insert(filename, object)?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(dir)?;
        let file = FileImage::from_file(temp.reopen()?, temp.path());

        let mut out = BlockStore::for_output(file, self.store.block_count());
        plan.write_image(&mut self.store, &mut out)?;
        drop(out);

        temp.persist(path).map_err(|e| FlashError::Io(e.error))?;
        info!("Wrote new image to {:?}", path);
        Ok(plan)
    }
}
