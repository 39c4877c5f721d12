//! tagflash command line
//!
//! Extracts entries from, lists, and inserts binary images into chain-linked
//! TLV flash filesystem images.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tagflash_rs::{Config, EntryOutcome, FlashImage, LoadableObject};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tagflash")]
#[command(about = "Extract and insert entries in TLV flash filesystem images")]
struct Args {
    /// Log per-block debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write every stored file and binary image into a directory
    Extract {
        image: PathBuf,
        output_dir: PathBuf,

        /// Write binary images as raw code instead of ELF
        #[arg(long)]
        raw_binaries: bool,

        /// Write a JSON report of every entry
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Insert the code of an object file as a new binary image
    Insert {
        object_file: PathBuf,
        image_in: PathBuf,
        image_out: PathBuf,

        /// Stored filename (default: the object file's name)
        #[arg(long)]
        name: Option<String>,

        /// Section holding the code
        #[arg(long)]
        section: Option<String>,
    },

    /// Log every entry without writing anything
    List { image: PathBuf },
}

fn extract(
    config: &Config,
    image: &Path,
    output_dir: &Path,
    raw_binaries: bool,
    report_path: Option<&Path>,
) -> anyhow::Result<()> {
    let mut extract_config = config.extract.clone();
    extract_config.raw_binaries |= raw_binaries;

    let mut flash = FlashImage::open(image)
        .with_context(|| format!("Failed to open image {}", image.display()))?;
    let report = flash
        .extract_to(output_dir, &extract_config)
        .with_context(|| format!("Extraction from {} aborted", image.display()))?;

    if let Some(path) = report_path {
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    for entry in &report.entries {
        if let EntryOutcome::Skipped { reason } = &entry.outcome {
            warn!("block {}: skipped ({})", entry.head, reason);
        }
    }
    Ok(())
}

fn insert(
    config: &Config,
    object_file: &Path,
    image_in: &Path,
    image_out: &Path,
    name: Option<String>,
    section: Option<String>,
) -> anyhow::Result<()> {
    let section = section.unwrap_or_else(|| config.insert.code_section.clone());
    let filename = match name.or_else(|| config.insert.filename.clone()) {
        Some(name) => name,
        None => match object_file.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => bail!(
                "Cannot derive a stored name from {}; pass --name",
                object_file.display()
            ),
        },
    };

    let bytes = std::fs::read(object_file)
        .with_context(|| format!("Failed to read object file {}", object_file.display()))?;
    let object = LoadableObject::from_elf(&bytes, &section)
        .with_context(|| format!("Failed to load {} from {}", section, object_file.display()))?;
    info!(
        "Object: {} bytes of code, entry point {:#010x}, load address {:#010x}",
        object.code.len(),
        object.entry_point,
        object.load_address
    );

    let mut flash = FlashImage::open(image_in)
        .with_context(|| format!("Failed to open image {}", image_in.display()))?;
    let plan = flash
        .insert_to_path(&filename, &object, image_out)
        .with_context(|| format!("Failed to insert {}", filename))?;

    info!(
        "Inserted {} at block {} ({} blocks)",
        filename,
        plan.head(),
        plan.claimed().count()
    );
    Ok(())
}

fn list(image: &Path) -> anyhow::Result<()> {
    let mut flash = FlashImage::open(image)
        .with_context(|| format!("Failed to open image {}", image.display()))?;

    info!(
        "{} blocks, {} free",
        flash.block_count(),
        flash.index().scan_free_blocks().count()
    );
    for (head, entry) in flash.entries()? {
        match entry {
            Ok(directory) => info!(
                "block {}: {} flags={:?} tags={:?}",
                head,
                directory.filename().unwrap_or_default(),
                directory.flags(),
                directory
            ),
            Err(e) => warn!("block {}: {}", head, e),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    match args.command {
        Command::Extract {
            image,
            output_dir,
            raw_binaries,
            report,
        } => extract(&config, &image, &output_dir, raw_binaries, report.as_deref()),
        Command::Insert {
            object_file,
            image_in,
            image_out,
            name,
            section,
        } => insert(&config, &object_file, &image_in, &image_out, name, section),
        Command::List { image } => list(&image),
    }
}
