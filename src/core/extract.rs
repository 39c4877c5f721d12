//! Extraction of stored entries
//!
//! Every chain head is decoded into a [`TagDirectory`] and rendered by its
//! flags: regular files are written verbatim, binary images as ELF (or raw
//! code). Entries that cannot be rendered are reported and skipped; only
//! structural failures abort the scan.

use crate::config::ExtractConfig;
use crate::core::chain::ChainIndex;
use crate::core::directory::{is_safe_filename, tags, EntryKind, TagDirectory};
use crate::core::io::ImageSource;
use crate::core::object::LoadableObject;
use crate::core::store::BlockStore;
use crate::error::Result;
use serde::{Serialize, Serializer};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Why an entry was not extracted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    #[error("no flags tag")]
    MissingFlags,

    #[error("unknown file type (flags {0:#04x})")]
    UnknownFlags(u8),

    #[error("no filename tag")]
    MissingFilename,

    #[error("unsafe filename {0:?}")]
    UnsafeFilename(String),

    #[error("missing or malformed tag {0:#04x}")]
    MissingTag(u8),

    #[error("corrupt chain: {0}")]
    Corrupt(String),
}

impl Serialize for SkipReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Tag code and payload length, as found in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TagSummary {
    pub tag: u8,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryOutcome {
    Extracted { kind: EntryKind, files: Vec<String> },
    Skipped { reason: SkipReason },
}

/// What happened to one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub head: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u8>,
    pub tags: Vec<TagSummary>,
    pub outcome: EntryOutcome,
}

impl EntryReport {
    pub fn is_extracted(&self) -> bool {
        matches!(self.outcome, EntryOutcome::Extracted { .. })
    }
}

/// Result of scanning a whole image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub block_count: u32,
    pub entries: Vec<EntryReport>,
}

impl ExtractReport {
    pub fn extracted(&self) -> usize {
        self.entries.iter().filter(|e| e.is_extracted()).count()
    }

    pub fn skipped(&self) -> usize {
        self.entries.len() - self.extracted()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct Extractor<'c> {
    config: &'c ExtractConfig,
}

impl<'c> Extractor<'c> {
    pub fn new(config: &'c ExtractConfig) -> Self {
        Extractor { config }
    }

    /// Render an entry into its output files
    pub fn render(&self, directory: &TagDirectory) -> std::result::Result<Vec<Artifact>, SkipReason> {
        let flags = directory.flags().ok_or(SkipReason::MissingFlags)?;
        let kind = EntryKind::from_flags(flags);
        if let EntryKind::Unknown(flags) = kind {
            return Err(SkipReason::UnknownFlags(flags));
        }

        let name = directory.filename().ok_or(SkipReason::MissingFilename)?;
        if !is_safe_filename(&name) {
            return Err(SkipReason::UnsafeFilename(name));
        }

        match kind {
            EntryKind::RegularFile => {
                let content = directory
                    .get(tags::FILE_CONTENT)
                    .ok_or(SkipReason::MissingTag(tags::FILE_CONTENT))?;
                Ok(vec![Artifact {
                    name,
                    bytes: content.to_vec(),
                }])
            }
            _ => self.render_binary(name, directory),
        }
    }

    fn render_binary(
        &self,
        name: String,
        directory: &TagDirectory,
    ) -> std::result::Result<Vec<Artifact>, SkipReason> {
        let code = directory
            .get(tags::CODE)
            .ok_or(SkipReason::MissingTag(tags::CODE))?;
        let entry_point = directory
            .entry_point()
            .ok_or(SkipReason::MissingTag(tags::ENTRY_POINT))?;
        let load_address = directory
            .load_address()
            .ok_or(SkipReason::MissingTag(tags::LOAD_ADDRESS))?;
        let checksum = directory
            .checksum()
            .ok_or(SkipReason::MissingTag(tags::CHECKSUM))?;

        info!("\t[tag 0xb5] entry point = {:#010x}", entry_point);
        info!("\t[tag 0xba] load address = {:#010x}", load_address);
        info!("\t[tag 0xbc] checksum = {:#010x}", checksum);

        let bytes = if self.config.raw_binaries {
            code.to_vec()
        } else {
            LoadableObject::new(code.to_vec(), entry_point, load_address)
                .to_elf(self.config.elf_machine)
                .map_err(|e| SkipReason::Corrupt(e.to_string()))?
        };

        let mut artifacts = Vec::with_capacity(2);
        if let Some(strtab) = directory.get(tags::STRING_TABLE) {
            artifacts.push(Artifact {
                name: format!("{}{}", name, self.config.strtab_suffix),
                bytes: strtab.to_vec(),
            });
        }
        artifacts.insert(0, Artifact { name, bytes });
        Ok(artifacts)
    }

    /// Decode one chain and decide its outcome
    ///
    /// Artifacts of an extracted entry are handed to `emit`; its errors abort.
    fn extract_entry<S, F>(
        &self,
        store: &mut BlockStore<S>,
        index: &ChainIndex,
        head: u32,
        emit: &mut F,
    ) -> Result<EntryReport>
    where
        S: ImageSource,
        F: FnMut(&Artifact) -> Result<()>,
    {
        info!("block {}:", head);

        let directory = match TagDirectory::read(store, index, head) {
            Ok(directory) => directory,
            Err(e) if e.is_entry_local() => {
                warn!("\t!!! {}, not dumping", e);
                return Ok(EntryReport {
                    head,
                    filename: None,
                    flags: None,
                    tags: Vec::new(),
                    outcome: EntryOutcome::Skipped {
                        reason: SkipReason::Corrupt(e.to_string()),
                    },
                });
            }
            Err(e) => return Err(e),
        };

        let mut summary: Vec<TagSummary> = directory
            .iter()
            .map(|(tag, payload)| TagSummary {
                tag,
                len: payload.len(),
            })
            .collect();
        summary.sort_by_key(|t| t.tag);

        let listed: Vec<String> = summary
            .iter()
            .map(|t| format!("{:02x} ({} bytes)", t.tag, t.len))
            .collect();
        info!("\ttags: {}", listed.join(", "));

        let filename = directory.filename();
        if let Some(name) = &filename {
            info!("\t[tag 0x01] filename = {}", name);
        }
        let flags = directory.flags();
        if let Some(flags) = flags {
            info!("\t[tag 0x03] flags = {:#04x} = {:#010b}", flags, flags);
        }

        let outcome = match self.render(&directory) {
            Ok(artifacts) => {
                let mut files = Vec::with_capacity(artifacts.len());
                for artifact in &artifacts {
                    emit(artifact)?;
                    debug!("\twrote {} ({} bytes)", artifact.name, artifact.bytes.len());
                    files.push(artifact.name.clone());
                }
                EntryOutcome::Extracted {
                    kind: directory.kind().unwrap_or(EntryKind::RegularFile),
                    files,
                }
            }
            Err(reason) => {
                warn!("\t!!! {}, not dumping", reason);
                EntryOutcome::Skipped { reason }
            }
        };

        Ok(EntryReport {
            head,
            filename,
            flags,
            tags: summary,
            outcome,
        })
    }

    /// Scan every chain head, handing rendered files to `emit`
    pub fn extract_with<S, F>(
        &self,
        store: &mut BlockStore<S>,
        index: &ChainIndex,
        mut emit: F,
    ) -> Result<ExtractReport>
    where
        S: ImageSource,
        F: FnMut(&Artifact) -> Result<()>,
    {
        let mut report = ExtractReport {
            block_count: store.block_count(),
            entries: Vec::new(),
        };

        for head in index.scan_chain_heads() {
            let entry = self.extract_entry(store, index, head, &mut emit)?;
            report.entries.push(entry);
        }

        info!(
            "Extracted {} entries, skipped {}",
            report.extracted(),
            report.skipped()
        );
        Ok(report)
    }

    /// Scan every chain head and write rendered files into `output_dir`
    pub fn extract_to_dir<S: ImageSource>(
        &self,
        store: &mut BlockStore<S>,
        index: &ChainIndex,
        output_dir: &Path,
    ) -> Result<ExtractReport> {
        std::fs::create_dir_all(output_dir)?;
        self.extract_with(store, index, |artifact| {
            std::fs::write(output_dir.join(&artifact.name), &artifact.bytes)?;
            Ok(())
        })
    }

    /// Decode every entry without rendering anything
    pub fn list<S: ImageSource>(
        &self,
        store: &mut BlockStore<S>,
        index: &ChainIndex,
    ) -> Result<Vec<(u32, std::result::Result<TagDirectory, String>)>> {
        let mut entries = Vec::new();
        for head in index.scan_chain_heads() {
            let entry = match TagDirectory::read(store, index, head) {
                Ok(directory) => Ok(directory),
                Err(e) if e.is_entry_local() => Err(e.to_string()),
                Err(e) => return Err(e),
            };
            entries.push((head, entry));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular(name: &[u8], content: &[u8]) -> TagDirectory {
        [
            (tags::FILENAME, name.to_vec()),
            (tags::FLAGS, vec![0xFF]),
            (tags::FILE_CONTENT, content.to_vec()),
        ]
        .into_iter()
        .collect()
    }

    fn binary() -> TagDirectory {
        [
            (tags::FILENAME, b"app".to_vec()),
            (tags::FLAGS, vec![0xFC]),
            (tags::CODE, vec![0x01, 0x00, 0x00, 0x00]),
            (tags::ENTRY_POINT, 0x1000u32.to_be_bytes().to_vec()),
            (tags::LOAD_ADDRESS, 0x1000u32.to_be_bytes().to_vec()),
            (tags::CHECKSUM, vec![0; 4]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_render_regular_file() {
        let config = ExtractConfig::default();
        let artifacts = Extractor::new(&config)
            .render(&regular(b"a.py", b"hello"))
            .unwrap();
        assert_eq!(
            artifacts,
            vec![Artifact {
                name: "a.py".into(),
                bytes: b"hello".to_vec()
            }]
        );
    }

    #[test]
    fn test_render_binary_as_elf() {
        let config = ExtractConfig::default();
        let artifacts = Extractor::new(&config).render(&binary()).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(&artifacts[0].bytes[..4], b"\x7FELF");

        let object = LoadableObject::from_elf(&artifacts[0].bytes, ".text").unwrap();
        assert_eq!(object.entry_point, 0x1000);
        assert_eq!(object.code, vec![0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_render_binary_raw_with_strtab() {
        let config = ExtractConfig {
            raw_binaries: true,
            ..ExtractConfig::default()
        };
        let mut dir = binary();
        dir.insert(tags::STRING_TABLE, b"main\0".to_vec());

        let artifacts = Extractor::new(&config).render(&dir).unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].name, "app");
        assert_eq!(artifacts[0].bytes, vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(artifacts[1].name, "app.strtab");
        assert_eq!(artifacts[1].bytes, b"main\0");
    }

    #[test]
    fn test_binary_missing_required_tag() {
        let config = ExtractConfig::default();
        let full = binary();
        let dir: TagDirectory = full
            .iter()
            .filter(|(tag, _)| *tag != tags::CHECKSUM)
            .map(|(tag, payload)| (tag, payload.to_vec()))
            .collect();

        assert_eq!(
            Extractor::new(&config).render(&dir),
            Err(SkipReason::MissingTag(tags::CHECKSUM))
        );
    }

    #[test]
    fn test_unknown_and_missing_flags() {
        let config = ExtractConfig::default();
        let extractor = Extractor::new(&config);

        let mut dir = regular(b"x", b"");
        dir.insert(tags::FLAGS, vec![0xFE]);
        assert_eq!(extractor.render(&dir), Err(SkipReason::UnknownFlags(0x01)));

        let no_flags: TagDirectory = [(tags::FILENAME, b"x".to_vec())].into_iter().collect();
        assert_eq!(extractor.render(&no_flags), Err(SkipReason::MissingFlags));
    }

    #[test]
    fn test_unsafe_filenames_rejected() {
        let config = ExtractConfig::default();
        let extractor = Extractor::new(&config);

        for name in [&b"../evil"[..], b"..", b"", b"dir/file", b"a\\b"] {
            assert!(matches!(
                extractor.render(&regular(name, b"x")),
                Err(SkipReason::UnsafeFilename(_))
            ));
        }
    }

    #[test]
    fn test_report_json() {
        let report = ExtractReport {
            block_count: 1,
            entries: vec![EntryReport {
                head: 0,
                filename: Some("a.py".into()),
                flags: Some(0),
                tags: vec![TagSummary { tag: 1, len: 4 }],
                outcome: EntryOutcome::Skipped {
                    reason: SkipReason::UnknownFlags(0x07),
                },
            }],
        };

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["entries"][0]["outcome"]["status"], "skipped");
        assert_eq!(
            json["entries"][0]["outcome"]["reason"],
            "unknown file type (flags 0x07)"
        );
    }
}
