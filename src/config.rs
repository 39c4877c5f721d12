//! Tool configuration
//!
//! Loaded from an optional TOML file; every field has a default, and the
//! command line overrides whatever the file sets.
//!
//! ```toml
//! [extract]
//! raw_binaries = false
//! strtab_suffix = ".strtab"
//! elf_machine = 2
//!
//! [insert]
//! code_section = ".text"
//! filename = "app.bin"
//! ```

use crate::core::object::{EM_SPARC, TEXT_SECTION};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub extract: ExtractConfig,
    pub insert: InsertConfig,
}

/// How entries are rendered on extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractConfig {
    /// Write binary images as raw code instead of ELF
    pub raw_binaries: bool,

    /// Appended to a binary's filename for its string table
    pub strtab_suffix: String,

    /// `e_machine` of generated ELF files
    pub elf_machine: u16,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            raw_binaries: false,
            strtab_suffix: ".strtab".to_string(),
            elf_machine: EM_SPARC,
        }
    }
}

/// Where inserted objects come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InsertConfig {
    /// Section holding the code
    pub code_section: String,

    /// Stored filename; defaults to the object file's name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl Default for InsertConfig {
    fn default() -> Self {
        InsertConfig {
            code_section: TEXT_SECTION.to_string(),
            filename: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
