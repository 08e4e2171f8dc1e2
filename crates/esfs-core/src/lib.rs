#![forbid(unsafe_code)]
//! EssenceFS volume lifecycle and VFS binding.
//!
//! `Volume` mounts a formatted block device, owns the superblock and
//! group descriptor table, and exposes the filesystem capability set
//! (`scan`, `enumerate`, `read`, `write`, `resize`, `create`, `sync`,
//! `remove`) over refcounted open nodes.

mod format;
mod node;
mod volume;

pub use format::{choose_block_size, format_volume, FormatReport};
pub use node::{Node, NodeTable};
pub use volume::{FilesystemOps, NodeStat, Volume};
