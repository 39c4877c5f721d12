//! Chain corruption detection tests
//!
//! Verifies that broken link headers are contained to their own entry while
//! image-level damage aborts the whole run.

use std::fs::{self, OpenOptions};
use tagflash_rs::{
    tags, EntryOutcome, ExtractConfig, FlashError, FlashImage, ImageSource, SkipReason,
    BLOCK_SIZE,
};
use tempfile::TempDir;

/// Helper: one block with the given link and raw stream, padded with 0xFF
fn block(start: u8, next: u8, stream: &[u8]) -> Vec<u8> {
    let mut bytes = vec![start, next, 0xFF, 0xFF];
    bytes.extend_from_slice(stream);
    bytes.resize(BLOCK_SIZE, 0xFF);
    bytes
}

/// Helper: complete regular-file stream
fn file_stream(name: &[u8], content: &[u8]) -> Vec<u8> {
    let mut stream = vec![tags::FILENAME, name.len() as u8];
    stream.extend_from_slice(name);
    stream.extend([tags::FLAGS, 1, 0xFF, tags::FILE_CONTENT, content.len() as u8]);
    stream.extend_from_slice(content);
    stream.push(0xFF);
    stream
}

/// Helper: stream whose content record claims far more bytes than any chain holds
fn dangling_stream(name: &[u8], low_bits: u8) -> Vec<u8> {
    let mut stream = vec![tags::FILENAME, name.len() as u8];
    stream.extend_from_slice(name);
    stream.extend([tags::FLAGS, 1, 0xFF, tags::FILE_CONTENT, 0x80 | low_bits, 0xFF, 0x7F]);
    stream
}

fn assert_corrupt(outcome: &EntryOutcome) {
    assert!(
        matches!(
            outcome,
            EntryOutcome::Skipped {
                reason: SkipReason::Corrupt(_)
            }
        ),
        "expected a corrupt entry, got {:?}",
        outcome
    );
}

#[test]
fn test_self_loop_is_detected() {
    // Head 0 points at itself and the record never fits
    let mut image = block(0, 0, &dangling_stream(b"spin", 0));
    image.extend(block(1, 0xFF, &file_stream(b"after", b"ok")));

    let out = TempDir::new().unwrap();
    let mut flash = FlashImage::from_bytes(image).unwrap();
    let report = flash.extract_to(out.path(), &ExtractConfig::default()).unwrap();

    assert_eq!(report.entries.len(), 2);
    assert_corrupt(&report.entries[0].outcome);
    assert!(report.entries[1].is_extracted());
    assert_eq!(fs::read(out.path().join("after")).unwrap(), b"ok");
}

#[test]
fn test_chain_cycle_error_from_index() {
    let mut image = block(0, 1, &[]);
    image.extend(block(0, 2, &[]));
    image.extend(block(0, 1, &[]));

    let flash = FlashImage::from_bytes(image).unwrap();
    assert!(matches!(
        flash.index().chain(0),
        Err(FlashError::ChainCycle { head: 0, .. })
    ));
}

#[test]
fn test_dangling_next_pointer() {
    // Next pointer names block 9 in a 2-block image
    let mut image = block(0, 9, &dangling_stream(b"lost", 0x3F));
    image.extend(block(1, 0xFF, &file_stream(b"kept", b"yes")));

    let mut flash = FlashImage::from_bytes(image).unwrap();
    assert!(matches!(
        flash.index().chain(0),
        Err(FlashError::InvalidBlockIndex { block: 9, block_count: 2 })
    ));
    assert!(matches!(
        flash.read_entry(0),
        Err(FlashError::InvalidBlockIndex { block: 9, .. })
    ));

    let entries = flash.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].1.is_err());
    assert_eq!(
        entries[1].1.as_ref().unwrap().get(tags::FILE_CONTENT),
        Some(&b"yes"[..])
    );
}

#[test]
fn test_record_cut_off_at_chain_end() {
    let image = block(0, 0xFF, &dangling_stream(b"short", 0x3F));

    let mut flash = FlashImage::from_bytes(image).unwrap();
    assert!(matches!(
        flash.read_entry(0),
        Err(FlashError::ChainTruncated { head: 0 })
    ));

    let report = flash.extract_with(&ExtractConfig::default(), |_| Ok(())).unwrap();
    assert_corrupt(&report.entries[0].outcome);
}

#[test]
fn test_truncated_image_file_aborts() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flash.bin");

    let mut image = block(0, 0xFF, &file_stream(b"a", b"1"));
    image.extend(block(1, 0xFF, &file_stream(b"b", b"2")));
    fs::write(&path, &image).unwrap();

    // Cut the second block short
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len((BLOCK_SIZE + 1000) as u64).unwrap();
    drop(file);

    assert!(matches!(
        FlashImage::open(&path),
        Err(FlashError::MisalignedImage { len }) if len == (BLOCK_SIZE + 1000) as u64
    ));
}

/// Source that claims more bytes than it can deliver
struct ShortSource {
    data: Vec<u8>,
    claimed: u64,
}

impl ImageSource for ShortSource {
    fn len_bytes(&self) -> tagflash_rs::Result<u64> {
        Ok(self.claimed)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> tagflash_rs::Result<usize> {
        let start = (offset as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

#[test]
fn test_short_block_read_is_fatal() {
    let mut data = block(0, 0xFF, &file_stream(b"a", b"1"));
    // Header of block 1 readable, payload missing
    data.extend(&block(1, 0xFF, &file_stream(b"b", b"2"))[..100]);

    let source = ShortSource {
        data,
        claimed: 2 * BLOCK_SIZE as u64,
    };
    let mut flash = FlashImage::new(source).unwrap();
    assert_eq!(flash.index().scan_chain_heads().collect::<Vec<_>>(), vec![0, 1]);

    let mut emitted = Vec::new();
    let result = flash.extract_with(&ExtractConfig::default(), |artifact| {
        emitted.push(artifact.name.clone());
        Ok(())
    });

    assert!(matches!(
        result,
        Err(FlashError::TruncatedRead { block: 1, got: 100 })
    ));
    assert_eq!(emitted, vec!["a".to_string()]);
}
