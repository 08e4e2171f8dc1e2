//! Mounted volume state and the filesystem capability set.

use crate::node::{Node, NodeInner, NodeTable};
use esfs_block::{read_superblock_region, write_superblock_region, BlockDevicePort, BlockIo};
use esfs_dir::DirectoryChild;
use esfs_error::{EsfsError, Result};
use esfs_ondisk::{
    encode_descriptor_table, parse_descriptor_table, DataPayload, FileDataAttr,
    FileDirectoryAttr, FileEntry, FileType, GroupDescriptor, Indirection, Superblock,
};
use esfs_stream::{read_stream, resize_data_stream, write_stream};
use esfs_types::{
    u64_to_usize, BlockSize, ByteOffset, LocalExtent, UniqueIdentifier, BOOT_SUPER_BLOCK_SIZE,
    DRIVER_VERSION, GROUP_DESCRIPTOR_SIZE, SUPERBLOCK_OFFSET,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

fn corruption(block: u64, detail: impl Into<String>) -> EsfsError {
    EsfsError::Corruption {
        block,
        detail: detail.into(),
    }
}

pub(crate) fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// The filesystem capability set the VFS dispatches through.
pub trait FilesystemOps: Send + Sync {
    /// Look up `name` in `directory`; a hit takes a handle on the node.
    fn scan(&self, directory: &Arc<Node>, name: &[u8]) -> Result<Option<Arc<Node>>>;

    /// List every child of `directory`.
    fn enumerate(&self, directory: &Arc<Node>) -> Result<Vec<DirectoryChild>>;

    /// Read from the node's data stream. Ranges past the stream end are
    /// rejected.
    fn read(&self, node: &Arc<Node>, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write to the node's data stream. Never grows it; resize first.
    fn write(&self, node: &Arc<Node>, offset: u64, buf: &[u8]) -> Result<()>;

    /// Grow or shrink the node's data stream, then persist its entry.
    fn resize(&self, node: &Arc<Node>, new_size: u64) -> Result<()>;

    /// Add a child to `directory`.
    fn create(&self, directory: &Arc<Node>, name: &[u8], file_type: FileType) -> Result<()>;

    /// Persist the node's in-memory file entry.
    fn sync(&self, node: &Arc<Node>) -> Result<()>;

    /// Truncate the node to zero and unlink it from its parent.
    fn remove(&self, node: &Arc<Node>) -> Result<()>;

    /// Drop one handle on the node.
    fn close(&self, node: &Arc<Node>) -> Result<()>;
}

/// Introspection snapshot of an open node.
#[derive(Debug, Clone)]
pub struct NodeStat {
    pub identifier: UniqueIdentifier,
    pub file_type: FileType,
    pub size: u64,
    pub directory_children: u64,
    pub indirection: Indirection,
    pub extent_count: u16,
    /// Non-zero extent-list block pointers (INDIRECT_2 only).
    pub extent_list_blocks: Vec<u64>,
    pub container_block: u64,
    pub offset_into_block: u32,
    pub offset_into_block2: u32,
}

struct VolumeState {
    superblock: Superblock,
    gdt: Vec<GroupDescriptor>,
}

/// A mounted EssenceFS volume.
///
/// Every public operation holds the volume mutex for its whole duration;
/// the open-node table and the per-node locks nest inside it, in that
/// order.
pub struct Volume {
    io: BlockIo,
    sectors_per_block: u64,
    state: Mutex<VolumeState>,
    nodes: NodeTable,
    root: Arc<Node>,
    /// Set when structural corruption was detected; mutating operations
    /// are refused from then on.
    poisoned: AtomicBool,
}

impl Volume {
    /// Mount the volume on `dev`.
    ///
    /// Verifies the superblock signature and driver versions, refuses a
    /// volume whose mounted flag is still set, loads the GDT, persists
    /// `mounted = 1`, and opens the root directory.
    pub fn mount(dev: Arc<dyn BlockDevicePort>) -> Result<Self> {
        let region = read_superblock_region(dev.as_ref())?;
        let mut superblock = Superblock::parse_region(&region)?;

        if superblock.required_read_version > DRIVER_VERSION {
            return Err(EsfsError::UnsupportedVersion {
                required: superblock.required_read_version,
                driver: DRIVER_VERSION,
            });
        }
        if superblock.required_write_version > DRIVER_VERSION {
            return Err(EsfsError::UnsupportedVersion {
                required: superblock.required_write_version,
                driver: DRIVER_VERSION,
            });
        }
        if superblock.mounted != 0 {
            warn!(
                target: "esfs::volume",
                name = %superblock.volume_name_string(),
                "volume was not unmounted cleanly; refusing to mount"
            );
            return Err(EsfsError::AlreadyMounted);
        }

        let sector_size = dev.sector_size();
        if superblock.block_size % sector_size != 0 {
            return Err(EsfsError::Format(format!(
                "block size {} is not a multiple of the sector size {sector_size}",
                superblock.block_size
            )));
        }
        let volume_bytes = superblock
            .block_count
            .checked_mul(superblock.block_size)
            .and_then(|bytes| bytes.checked_add(BOOT_SUPER_BLOCK_SIZE));
        match volume_bytes {
            Some(bytes) if bytes <= dev.len_bytes() => {}
            _ => {
                return Err(EsfsError::Format(
                    "volume does not fit the device".to_owned(),
                ))
            }
        }

        let sectors_per_block = superblock.block_size / sector_size;
        let io = BlockIo::new(dev, BlockSize::new(superblock.block_size)?)?;

        // Load the group descriptor table.
        let gdt_bytes = u64::from(superblock.gdt.count) * superblock.block_size;
        if gdt_bytes < superblock.group_count * GROUP_DESCRIPTOR_SIZE as u64 {
            return Err(corruption(
                u64::from(superblock.gdt.offset),
                "GDT blocks cannot hold every group descriptor",
            ));
        }
        let mut raw_gdt = vec![0_u8; u64_to_usize(gdt_bytes, "gdt")?];
        io.read_blocks(u64::from(superblock.gdt.offset), &mut raw_gdt)?;
        let gdt = parse_descriptor_table(&raw_gdt, superblock.group_count)?;

        // Persist the mounted flag so a second mount is refused.
        superblock.mounted = 1;
        write_superblock_region(
            io.device().as_ref(),
            ByteOffset(SUPERBLOCK_OFFSET),
            &superblock.serialize_region(),
        )?;

        let root = Self::load_root(&io, &superblock)?;
        info!(
            target: "esfs::volume",
            name = %superblock.volume_name_string(),
            blocks = superblock.block_count,
            block_size = superblock.block_size,
            groups = superblock.group_count,
            "mounted volume"
        );

        let nodes = NodeTable::new();
        nodes.register(root.clone());

        Ok(Self {
            io,
            sectors_per_block,
            state: Mutex::new(VolumeState { superblock, gdt }),
            nodes,
            root,
            poisoned: AtomicBool::new(false),
        })
    }

    fn load_root(io: &BlockIo, superblock: &Superblock) -> Result<Arc<Node>> {
        let root_extent = superblock.root_directory_file_entry;
        let mut raw = vec![
            0_u8;
            u64_to_usize(
                u64::from(root_extent.count) * superblock.block_size,
                "root_entry"
            )?
        ];
        io.read_blocks(u64::from(root_extent.offset), &mut raw)?;
        let (entry, length) = FileEntry::parse(&raw)?;
        if entry.file_type != FileType::Directory || entry.directory().is_none() {
            return Err(corruption(
                u64::from(root_extent.offset),
                "root file entry is not a directory",
            ));
        }
        Ok(Arc::new(Node::new(
            FileType::Directory,
            NodeInner {
                entry,
                file_entry_length: length,
                container_block: u64::from(root_extent.offset),
                offset_into_block: 0,
                offset_into_block2: 0,
                parent: None,
                handles: 1,
            },
        )))
    }

    /// Write back the GDT and the superblock with `mounted = 0`, then
    /// refresh the backup superblock at the tail of the volume.
    pub fn unmount(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            // Leave the mounted flag set; the volume needs checking.
            return Err(EsfsError::ReadOnly);
        }
        let mut state = self.state.lock();

        let gdt_bytes =
            u64::from(state.superblock.gdt.count) * state.superblock.block_size;
        let raw_gdt =
            encode_descriptor_table(&state.gdt, u64_to_usize(gdt_bytes, "gdt")?)?;
        self.io
            .write_blocks(u64::from(state.superblock.gdt.offset), &raw_gdt)?;

        state.superblock.mounted = 0;
        let region = state.superblock.serialize_region();
        write_superblock_region(
            self.io.device().as_ref(),
            ByteOffset(SUPERBLOCK_OFFSET),
            &region,
        )?;
        let backup_offset = state.superblock.block_count * state.superblock.block_size;
        write_superblock_region(
            self.io.device().as_ref(),
            ByteOffset(backup_offset),
            &region,
        )?;
        self.io.sync()?;

        info!(
            target: "esfs::volume",
            name = %state.superblock.volume_name_string(),
            "unmounted volume"
        );
        Ok(())
    }

    /// The root directory node.
    #[must_use]
    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    #[must_use]
    pub fn sectors_per_block(&self) -> u64 {
        self.sectors_per_block
    }

    /// Snapshot of the superblock.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.state.lock().superblock.clone()
    }

    /// Snapshot of the group descriptor table.
    #[must_use]
    pub fn group_descriptors(&self) -> Vec<GroupDescriptor> {
        self.state.lock().gdt.clone()
    }

    /// Free extents of `group`, as the allocator sees them.
    pub fn available_extents(&self, group: u64) -> Result<Vec<LocalExtent>> {
        let state = self.state.lock();
        esfs_alloc::available_extents(&self.io, &state.superblock, &state.gdt, group)
    }

    /// Introspect an open node.
    pub fn stat(&self, node: &Arc<Node>) -> Result<NodeStat> {
        let _state = self.state.lock();
        let inner = node.lock();
        let data = inner
            .entry
            .data()
            .ok_or_else(|| corruption(inner.container_block, "file entry without data"))?;
        let extent_list_blocks = match &data.payload {
            DataPayload::Indirect2(blocks) => {
                blocks.iter().copied().filter(|b| *b != 0).collect()
            }
            _ => Vec::new(),
        };
        Ok(NodeStat {
            identifier: node.identifier(),
            file_type: node.file_type(),
            size: data.size,
            directory_children: inner
                .entry
                .directory()
                .map_or(0, |dir| dir.items_in_directory),
            indirection: data.indirection(),
            extent_count: data.extent_count,
            extent_list_blocks,
            container_block: inner.container_block,
            offset_into_block: inner.offset_into_block,
            offset_into_block2: inner.offset_into_block2,
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(EsfsError::ReadOnly);
        }
        Ok(())
    }

    /// Mark the volume read-only after a consistency failure.
    fn poison_on_corruption<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(EsfsError::Corruption { block, detail }) = &result {
            warn!(
                target: "esfs::volume",
                block,
                detail = %detail,
                "structural corruption; volume is now read-only"
            );
            self.poisoned.store(true, Ordering::Release);
        }
        result
    }

    /// Write a node's file entry bytes back to its container block.
    fn sync_inner(&self, inner: &NodeInner) -> Result<()> {
        let bytes = inner.entry.encode();
        if bytes.len() != inner.file_entry_length {
            return Err(corruption(
                inner.container_block,
                "file entry changed length in memory",
            ));
        }
        self.io.write_at(
            inner.container_block,
            u64::from(inner.offset_into_block),
            &bytes,
        )
    }

    fn directory_attrs(node: &Arc<Node>) -> Result<(FileDataAttr, FileDirectoryAttr)> {
        if node.file_type() != FileType::Directory {
            return Err(EsfsError::IncorrectNodeType);
        }
        let inner = node.lock();
        let data = inner
            .entry
            .data()
            .cloned()
            .ok_or_else(|| corruption(inner.container_block, "directory without data"))?;
        let directory = inner
            .entry
            .directory()
            .copied()
            .ok_or_else(|| {
                corruption(inner.container_block, "directory without directory attribute")
            })?;
        Ok((data, directory))
    }
}

impl FilesystemOps for Volume {
    fn scan(&self, directory: &Arc<Node>, name: &[u8]) -> Result<Option<Arc<Node>>> {
        let result = (|| {
            let state = self.state.lock();
            let (data, dir_attr) = Self::directory_attrs(directory)?;
            let Some(found) =
                esfs_dir::search(&self.io, &state.superblock, &data, &dir_attr, name)?
            else {
                return Ok(None);
            };

            // Entries without a usable shape are invisible to lookups.
            let entry = &found.file_entry;
            if entry.data().is_none() {
                return Ok(None);
            }
            match entry.file_type {
                FileType::Directory if entry.directory().is_none() => return Ok(None),
                FileType::File | FileType::Directory => {}
                FileType::SymbolicLink => return Ok(None),
            }

            // Already open: take another handle instead of re-reading.
            if let Some(existing) = self.nodes.find_and_retain(entry.identifier) {
                return Ok(Some(existing));
            }

            let node = Arc::new(Node::new(
                entry.file_type,
                NodeInner {
                    entry: found.file_entry,
                    file_entry_length: found.file_entry_length,
                    container_block: found.container_block,
                    offset_into_block: found.offset_into_block,
                    offset_into_block2: found.offset_into_block2,
                    parent: Some(directory.identifier()),
                    handles: 1,
                },
            ));
            self.nodes.register(node.clone());
            debug!(
                target: "esfs::volume",
                name = %String::from_utf8_lossy(name),
                identifier = %node.identifier(),
                "opened node"
            );
            Ok(Some(node))
        })();
        self.poison_on_corruption(result)
    }

    fn enumerate(&self, directory: &Arc<Node>) -> Result<Vec<DirectoryChild>> {
        let result = (|| {
            let state = self.state.lock();
            let (data, dir_attr) = Self::directory_attrs(directory)?;
            esfs_dir::enumerate(&self.io, &state.superblock, &data, &dir_attr)
        })();
        self.poison_on_corruption(result)
    }

    fn read(&self, node: &Arc<Node>, offset: u64, buf: &mut [u8]) -> Result<()> {
        let result = (|| {
            let state = self.state.lock();
            let inner = node.lock();
            let data = inner
                .entry
                .data()
                .ok_or(EsfsError::IncorrectNodeType)?;
            read_stream(&self.io, &state.superblock, data, offset, buf)?;
            Ok(())
        })();
        self.poison_on_corruption(result)
    }

    fn write(&self, node: &Arc<Node>, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        let result = (|| {
            let state = self.state.lock();
            let mut inner = node.lock();
            let data = inner
                .entry
                .data_mut()
                .ok_or(EsfsError::IncorrectNodeType)?;
            write_stream(&self.io, &state.superblock, data, offset, buf)?;
            inner.entry.modification_time = now_seconds();
            Ok(())
        })();
        self.poison_on_corruption(result)
    }

    fn resize(&self, node: &Arc<Node>, new_size: u64) -> Result<()> {
        self.check_writable()?;
        let result = (|| {
            let mut state = self.state.lock();
            let state = &mut *state;
            let mut inner = node.lock();
            let container_block = inner.container_block;
            let data = inner
                .entry
                .data_mut()
                .ok_or(EsfsError::IncorrectNodeType)?;
            resize_data_stream(
                &self.io,
                &mut state.superblock,
                &mut state.gdt,
                data,
                new_size,
                true,
                container_block,
            )?;
            inner.entry.modification_time = now_seconds();
            self.sync_inner(&inner)
        })();
        self.poison_on_corruption(result)
    }

    fn create(&self, directory: &Arc<Node>, name: &[u8], file_type: FileType) -> Result<()> {
        self.check_writable()?;
        let result = (|| {
            let mut state = self.state.lock();
            let state = &mut *state;
            if directory.file_type() != FileType::Directory {
                return Err(EsfsError::IncorrectNodeType);
            }
            let mut inner = directory.lock();
            let container_block = inner.container_block;
            let (data, dir_attr) = inner.entry.data_and_directory_mut();
            let data = data
                .ok_or_else(|| corruption(container_block, "directory without data"))?;
            let dir_attr = dir_attr.ok_or_else(|| {
                corruption(container_block, "directory without directory attribute")
            })?;

            esfs_dir::create_entry(
                &self.io,
                &mut state.superblock,
                &mut state.gdt,
                data,
                dir_attr,
                container_block,
                name,
                file_type,
                now_seconds(),
            )?;
            inner.entry.modification_time = now_seconds();
            self.sync_inner(&inner)
        })();
        self.poison_on_corruption(result)
    }

    fn sync(&self, node: &Arc<Node>) -> Result<()> {
        self.check_writable()?;
        let result = (|| {
            let _state = self.state.lock();
            let inner = node.lock();
            self.sync_inner(&inner)
        })();
        self.poison_on_corruption(result)
    }

    fn remove(&self, node: &Arc<Node>) -> Result<()> {
        self.check_writable()?;
        let result = (|| {
            let mut state = self.state.lock();
            let state = &mut *state;

            let parent_identifier = node
                .lock()
                .parent
                .ok_or(EsfsError::InvalidHandle)?;

            // Shrink the stream to zero and persist the entry, matching
            // the on-disk bytes the directory removal will discard.
            let (entry_block, entry_offset2) = {
                let mut inner = node.lock();
                let container_block = inner.container_block;
                let data = inner
                    .entry
                    .data_mut()
                    .ok_or(EsfsError::IncorrectNodeType)?;
                resize_data_stream(
                    &self.io,
                    &mut state.superblock,
                    &mut state.gdt,
                    data,
                    0,
                    false,
                    container_block,
                )?;
                self.sync_inner(&inner)?;
                (inner.container_block, inner.offset_into_block2)
            };

            let parent = self
                .nodes
                .get(parent_identifier)
                .ok_or(EsfsError::InvalidHandle)?;
            let removed = {
                let mut parent_inner = parent.lock();
                let dir_attr = parent_inner.entry.directory_mut().ok_or_else(|| {
                    corruption(entry_block, "parent lost its directory attribute")
                })?;
                let removed = esfs_dir::remove_entry(
                    &self.io,
                    &state.superblock,
                    dir_attr,
                    entry_block,
                    entry_offset2,
                )?;
                parent_inner.entry.modification_time = now_seconds();
                self.sync_inner(&parent_inner)?;
                removed
            };

            // Entries that slid down pull any open nodes with them.
            for identifier in &removed.shifted {
                if let Some(open) = self.nodes.get(*identifier) {
                    let mut open_inner = open.lock();
                    open_inner.offset_into_block = open_inner
                        .offset_into_block
                        .saturating_sub(removed.removed_length);
                    open_inner.offset_into_block2 = open_inner
                        .offset_into_block2
                        .saturating_sub(removed.removed_length);
                }
            }

            self.nodes.remove(node.identifier());
            debug!(
                target: "esfs::volume",
                identifier = %node.identifier(),
                "removed node"
            );
            Ok(())
        })();
        self.poison_on_corruption(result)
    }

    fn close(&self, node: &Arc<Node>) -> Result<()> {
        let _state = self.state.lock();
        if node.identifier() == self.root.identifier() {
            // The root handle lives as long as the mount.
            return Ok(());
        }
        self.nodes.release(node.identifier());
        Ok(())
    }
}
