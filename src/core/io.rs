//! Random-access backends for flash images
//!
//! The filesystem core never owns a global file handle. Callers hand it an
//! [`ImageSource`] (and, for insertion output, an [`ImageSink`]) so the same
//! code runs over an in-memory buffer, a plain file or a memory map.

use crate::error::Result;
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Byte-addressed read capability
pub trait ImageSource {
    /// Total length in bytes
    fn len_bytes(&self) -> Result<u64>;

    /// File backing the source, if any
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Read up to `buf.len()` bytes at `offset`
    ///
    /// Returns the number of bytes actually read. A short count means the
    /// source ended early.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Byte-addressed write capability
pub trait ImageSink {
    /// Write all of `buf` at `offset`
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush writes to stable storage
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: ImageSource + ?Sized> ImageSource for &mut T {
    fn len_bytes(&self) -> Result<u64> {
        (**self).len_bytes()
    }

    fn path(&self) -> Option<&Path> {
        (**self).path()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

impl<T: ImageSink + ?Sized> ImageSink for &mut T {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}

fn copy_from_slice_at(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let start = match usize::try_from(offset) {
        Ok(start) if start < data.len() => start,
        _ => return 0,
    };
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

/// Owned in-memory image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    data: Vec<u8>,
}

impl MemoryImage {
    pub fn new(data: Vec<u8>) -> Self {
        MemoryImage { data }
    }

    /// Zero-filled image of `len` bytes
    pub fn with_len(len: usize) -> Self {
        MemoryImage { data: vec![0; len] }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl ImageSource for MemoryImage {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(copy_from_slice_at(&self.data, offset, buf))
    }
}

impl ImageSink for MemoryImage {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| {
            std::io::Error::new(ErrorKind::InvalidInput, "write offset overflows usize")
        })?;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// File-backed image; every call seeks before reading or writing
pub struct FileImage {
    file: File,
    path: PathBuf,
}

impl FileImage {
    /// Open an existing image read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;

        Ok(FileImage {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Create (or truncate) an image file for writing
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(FileImage {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Wrap an already-open file
    pub fn from_file<P: AsRef<Path>>(file: File, path: P) -> Self {
        FileImage {
            file,
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileImage {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(filled)
    }
}

impl ImageSink for FileImage {
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Read-only memory-mapped image
pub struct MappedImage {
    map: Mmap,
    path: PathBuf,
}

impl MappedImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: the map is read-only and the tool never writes to its input.
        // Concurrent external modification of the file is outside our contract.
        let map = unsafe { Mmap::map(&file)? };
        Ok(MappedImage {
            map,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }
}

impl ImageSource for MappedImage {
    fn len_bytes(&self) -> Result<u64> {
        Ok(self.map.len() as u64)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(copy_from_slice_at(&self.map, offset, buf))
    }
}
