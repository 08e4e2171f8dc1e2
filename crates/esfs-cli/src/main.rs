#![forbid(unsafe_code)]
//! `esfs`: EssenceFS volume tool.
//!
//! Formats volume images and manipulates their contents: listing,
//! creating, resizing, reading, writing, and importing host folders.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use esfs_block::{read_superblock_region, FileDevice};
use esfs_core::{format_volume, FilesystemOps, Node, Volume};
use esfs_ondisk::{FileType, Superblock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "esfs", about = "EssenceFS volume tool")]
struct Cli {
    /// Path to the volume image.
    image: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh volume image of the given size.
    Format {
        /// Volume size; accepts k/m/g/t suffixes (e.g. 64m).
        size: String,
        /// Volume name (at most 32 bytes).
        name: String,
    },
    /// Print the superblock summary without mounting.
    Inspect {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Recursively list a directory.
    Tree {
        /// Directory path; defaults to the root.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show the free extents of a block group.
    AvailableExtents { group: u64 },
    /// Create a file or directory.
    Create {
        /// Parent directory path.
        path: String,
        /// New entry name.
        name: String,
        /// Entry kind.
        kind: EntryKind,
    },
    /// Resize a file's data stream.
    Resize {
        path: String,
        /// New size; accepts k/m/g/t suffixes.
        size: String,
    },
    /// Copy a file's contents out of the volume.
    Read {
        path: String,
        /// Host file to write.
        output: PathBuf,
    },
    /// Overwrite a file's contents from a host file of the same length.
    Write {
        path: String,
        /// Host file to read.
        input: PathBuf,
    },
    /// Recursively import a host folder.
    Import {
        /// Target directory path inside the volume.
        target_path: String,
        /// Host folder to import.
        folder: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EntryKind {
    File,
    Directory,
}

impl From<EntryKind> for FileType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => FileType::File,
            EntryKind::Directory => FileType::Directory,
        }
    }
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    identifier: String,
    block_size: u64,
    block_count: u64,
    blocks_used: u64,
    blocks_per_group: u16,
    group_count: u64,
    mounted: bool,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Format { size, name } => format_cmd(&cli.image, &size, &name),
        Command::Inspect { json } => inspect_cmd(&cli.image, json),
        Command::Tree { path } => with_volume(&cli.image, |volume| tree(volume, &path, 0)),
        Command::AvailableExtents { group } => {
            with_volume(&cli.image, |volume| available_extents(volume, group))
        }
        Command::Create { path, name, kind } => with_volume(&cli.image, |volume| {
            create(volume, &path, &name, kind.into())
        }),
        Command::Resize { path, size } => {
            let size = parse_size(&size)?;
            with_volume(&cli.image, |volume| resize(volume, &path, size))
        }
        Command::Read { path, output } => {
            with_volume(&cli.image, |volume| read_out(volume, &path, &output))
        }
        Command::Write { path, input } => {
            with_volume(&cli.image, |volume| write_in(volume, &path, &input))
        }
        Command::Import {
            target_path,
            folder,
        } => with_volume(&cli.image, |volume| import(volume, &target_path, &folder)),
    }
}

/// Parse a size string: decimal digits with optional k/m/g/t multipliers.
fn parse_size(text: &str) -> Result<u64> {
    let mut size: u64 = 0;
    for ch in text.chars() {
        match ch {
            '0'..='9' => {
                size = size
                    .checked_mul(10)
                    .and_then(|s| s.checked_add(u64::from(ch) - u64::from('0')))
                    .context("size overflows")?;
            }
            'k' => size = size.checked_mul(1 << 10).context("size overflows")?,
            'm' => size = size.checked_mul(1 << 20).context("size overflows")?,
            'g' => size = size.checked_mul(1 << 30).context("size overflows")?,
            't' => size = size.checked_mul(1 << 40).context("size overflows")?,
            _ => bail!("unrecognised size '{text}'"),
        }
    }
    Ok(size)
}

fn format_cmd(image: &Path, size: &str, name: &str) -> Result<()> {
    let size = parse_size(size)?;
    let dev = FileDevice::create(image, size)
        .with_context(|| format!("could not create {}", image.display()))?;
    let report = format_volume(Arc::new(dev), size, name)?;
    println!("Block size: {}", report.block_size);
    println!("Block groups: {}", report.group_count);
    println!("Blocks per group: {}", report.blocks_per_group);
    println!("Volume ID: {}", report.identifier);
    Ok(())
}

fn inspect_cmd(image: &Path, json: bool) -> Result<()> {
    let dev = FileDevice::open(image)
        .with_context(|| format!("could not open {}", image.display()))?;
    let region = read_superblock_region(&dev)?;
    let sb = Superblock::parse_region(&region).context("not an EssenceFS volume")?;
    let output = InspectOutput {
        volume_name: sb.volume_name_string(),
        identifier: sb.identifier.to_string(),
        block_size: sb.block_size,
        block_count: sb.block_count,
        blocks_used: sb.blocks_used,
        blocks_per_group: sb.blocks_per_group,
        group_count: sb.group_count,
        mounted: sb.mounted != 0,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Volume name: {}", output.volume_name);
        println!("Volume ID: {}", output.identifier);
        println!("Block size: {}", output.block_size);
        println!(
            "Blocks: {} used / {} total",
            output.blocks_used, output.block_count
        );
        println!(
            "Groups: {} of {} blocks",
            output.group_count, output.blocks_per_group
        );
        println!("Mounted: {}", if output.mounted { "yes" } else { "no" });
    }
    Ok(())
}

/// Mount, run the operation, and always attempt a clean unmount.
fn with_volume(image: &Path, op: impl FnOnce(&Volume) -> Result<()>) -> Result<()> {
    let dev = FileDevice::open(image)
        .with_context(|| format!("could not open {}", image.display()))?;
    let volume = Volume::mount(Arc::new(dev))?;
    let result = op(&volume);
    let unmount = volume.unmount();
    result?;
    unmount?;
    Ok(())
}

/// Resolve an absolute slash-separated path to an open node.
fn resolve_path(volume: &Volume, path: &str) -> Result<Arc<Node>> {
    if !path.starts_with('/') {
        bail!("path '{path}' must start with '/'");
    }
    let mut node = volume.root();
    for component in path.split('/').filter(|part| !part.is_empty()) {
        let next = volume
            .scan(&node, component.as_bytes())?
            .with_context(|| format!("'{component}' not found in '{path}'"))?;
        volume.close(&node)?;
        node = next;
    }
    Ok(node)
}

fn tree(volume: &Volume, path: &str, indent: usize) -> Result<()> {
    let node = resolve_path(volume, path)?;
    if indent == 0 {
        println!("--> {path}");
    }
    let children = volume.enumerate(&node)?;
    for child in &children {
        let name = String::from_utf8_lossy(&child.name).into_owned();
        let kind = match child.file_type {
            FileType::File => "file  ",
            FileType::Directory => "dir   ",
            FileType::SymbolicLink => "s-link",
        };
        let detail = match child.file_type {
            FileType::Directory => format!("{} items", child.directory_children),
            _ => format!("{} bytes", child.file_size),
        };
        println!(
            "{:indent$}    {name:<28} {} {kind} {detail}",
            "",
            child.identifier,
            indent = indent
        );
        if child.file_type == FileType::Directory {
            let sub_path = if path == "/" {
                format!("/{name}")
            } else {
                format!("{path}/{name}")
            };
            tree(volume, &sub_path, indent + 4)?;
        }
    }
    if children.is_empty() {
        println!("{:indent$}    (empty directory)", "", indent = indent);
    }
    volume.close(&node)?;
    Ok(())
}

fn available_extents(volume: &Volume, group: u64) -> Result<()> {
    let descriptors = volume.group_descriptors();
    let extents = volume.available_extents(group)?;
    if descriptors
        .get(usize::try_from(group).context("group index overflows")?)
        .is_some_and(|descriptor| descriptor.extent_table == 0)
    {
        println!("(group not yet initialised)");
    }
    let first_block = group * u64::from(volume.superblock().blocks_per_group);
    for extent in extents {
        println!(
            "local extent: offset {} (global {}), count {}",
            extent.offset,
            first_block + u64::from(extent.offset),
            extent.count
        );
    }
    Ok(())
}

fn create(volume: &Volume, path: &str, name: &str, file_type: FileType) -> Result<()> {
    let parent = resolve_path(volume, path)?;
    if volume.scan(&parent, name.as_bytes())?.is_some() {
        bail!("'{name}' already exists in '{path}'");
    }
    volume.create(&parent, name.as_bytes(), file_type)?;
    volume.close(&parent)?;
    Ok(())
}

fn resize(volume: &Volume, path: &str, size: u64) -> Result<()> {
    let node = resolve_path(volume, path)?;
    volume.resize(&node, size)?;
    volume.close(&node)?;
    Ok(())
}

fn read_out(volume: &Volume, path: &str, output: &Path) -> Result<()> {
    let node = resolve_path(volume, path)?;
    let size = volume.stat(&node)?.size;
    let mut data = vec![0_u8; usize::try_from(size).context("file too large")?];
    volume.read(&node, 0, &mut data)?;
    std::fs::write(output, &data)
        .with_context(|| format!("could not write {}", output.display()))?;
    volume.close(&node)?;
    Ok(())
}

fn write_in(volume: &Volume, path: &str, input: &Path) -> Result<()> {
    let data = std::fs::read(input)
        .with_context(|| format!("could not read {}", input.display()))?;
    let node = resolve_path(volume, path)?;
    let size = volume.stat(&node)?.size;
    if size != data.len() as u64 {
        bail!(
            "'{path}' is {size} bytes but {} is {}; resize it first",
            input.display(),
            data.len()
        );
    }
    volume.write(&node, 0, &data)?;
    volume.sync(&node)?;
    volume.close(&node)?;
    Ok(())
}

fn import(volume: &Volume, target_path: &str, folder: &Path) -> Result<()> {
    for entry in std::fs::read_dir(folder)
        .with_context(|| format!("could not read {}", folder.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            bail!("'{}' is not valid UTF-8", name.to_string_lossy());
        };
        if name.starts_with('.') {
            continue;
        }

        let child_path = if target_path == "/" {
            format!("/{name}")
        } else {
            format!("{target_path}/{name}")
        };

        if entry.file_type()?.is_dir() {
            create(volume, target_path, name, FileType::Directory)?;
            import(volume, &child_path, &entry.path())?;
        } else {
            let data = std::fs::read(entry.path())
                .with_context(|| format!("could not read {}", entry.path().display()))?;
            create(volume, target_path, name, FileType::File)?;
            let node = resolve_path(volume, &child_path)?;
            volume.resize(&node, data.len() as u64)?;
            volume.write(&node, 0, &data)?;
            volume.sync(&node)?;
            volume.close(&node)?;
        }
    }
    Ok(())
}
