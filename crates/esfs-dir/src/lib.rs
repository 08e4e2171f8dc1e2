#![forbid(unsafe_code)]
//! Directory engine.
//!
//! A directory is a regular file whose data stream holds a packed array
//! of directory entries, laid out block by block: an entry never spans a
//! block boundary, and the byte after the last entry in a block is either
//! the block end or zero. Lookup and enumeration walk the stream; insert
//! appends into the last block (growing by one block when it is full);
//! removal compacts the container block in place.

use esfs_block::BlockIo;
use esfs_error::{EsfsError, Result};
use esfs_ondisk::{
    directory_entry_total_length, encode_directory_entry, parse_directory_entry, FileDataAttr,
    FileDirectoryAttr, FileEntry, FileType, Superblock,
};
use esfs_stream::{get_block_from_stream, read_stream, resize_data_stream, write_stream};
use esfs_types::{u64_to_usize, UniqueIdentifier, MAX_NAME_LENGTH};
use tracing::{debug, trace};

fn corruption(block: u64, detail: impl Into<String>) -> EsfsError {
    EsfsError::Corruption {
        block,
        detail: detail.into(),
    }
}

/// One row of a directory listing.
#[derive(Debug, Clone)]
pub struct DirectoryChild {
    pub name: Vec<u8>,
    pub identifier: UniqueIdentifier,
    pub file_type: FileType,
    /// Stream size for files, zero for directories.
    pub file_size: u64,
    /// Child count for directories, zero for files.
    pub directory_children: u64,
}

/// A directory entry located by `search`, with everything needed to bind
/// an open node to its on-disk location.
#[derive(Debug, Clone)]
pub struct FoundEntry {
    pub file_entry: FileEntry,
    pub file_entry_length: usize,
    /// Global block holding the entry.
    pub container_block: u64,
    /// Offset of the embedded file entry within that block.
    pub offset_into_block: u32,
    /// Offset of the enclosing directory entry within that block.
    pub offset_into_block2: u32,
}

/// Result of `create_entry`.
#[derive(Debug, Clone, Copy)]
pub struct CreatedEntry {
    pub identifier: UniqueIdentifier,
    /// Global block the new entry was written into.
    pub container_block: u64,
}

/// Result of `remove_entry`.
#[derive(Debug, Clone)]
pub struct RemovedEntry {
    /// Bytes vacated in the container block.
    pub removed_length: u32,
    /// Identifiers of the entries that moved down to fill the gap, in
    /// block order.
    pub shifted: Vec<UniqueIdentifier>,
}

// ── Walk ────────────────────────────────────────────────────────────────────

struct WalkState {
    buffer: Vec<u8>,
    block_index: u64,
    position: usize,
    current_block: u64,
}

/// Walk every directory entry, calling `visit(state_position, parsed)`;
/// the visitor returns `true` to stop early.
fn walk_entries(
    io: &BlockIo,
    sb: &Superblock,
    data: &FileDataAttr,
    directory: &FileDirectoryAttr,
    mut visit: impl FnMut(&WalkState, esfs_ondisk::DirectoryEntryInfo) -> bool,
) -> Result<()> {
    if directory.items_in_directory == 0 {
        return Ok(());
    }
    if data.size == 0 {
        return Err(corruption(0, "directory has items but a zero-byte stream"));
    }

    let block_size = u64_to_usize(sb.block_size, "block_size")?;
    let mut state = WalkState {
        buffer: vec![0_u8; block_size],
        block_index: 0,
        position: 0,
        current_block: 0,
    };
    state.current_block = read_stream(io, sb, data, 0, &mut state.buffer)?
        .ok_or_else(|| corruption(0, "directory stream has no backing block"))?;

    for _ in 0..directory.items_in_directory {
        if state.position == block_size || state.buffer[state.position] == 0 {
            // The next entry starts at the top of the next block.
            state.block_index += 1;
            state.position = 0;
            let offset = state.block_index * sb.block_size;
            if offset >= data.size {
                return Err(corruption(
                    state.current_block,
                    "directory stream ended before every entry was seen",
                ));
            }
            state.current_block = read_stream(io, sb, data, offset, &mut state.buffer)?
                .ok_or_else(|| corruption(0, "directory stream has no backing block"))?;
        }

        let info = parse_directory_entry(&state.buffer[state.position..])
            .map_err(|error| corruption(state.current_block, format!("{error}")))?;
        let total_length = info.total_length;
        if visit(&state, info) {
            return Ok(());
        }
        state.position += total_length;
    }

    Ok(())
}

// ── Enumerate ───────────────────────────────────────────────────────────────

/// List every child of the directory.
pub fn enumerate(
    io: &BlockIo,
    sb: &Superblock,
    data: &FileDataAttr,
    directory: &FileDirectoryAttr,
) -> Result<Vec<DirectoryChild>> {
    let mut children =
        Vec::with_capacity(usize::try_from(directory.items_in_directory).unwrap_or(0));
    walk_entries(io, sb, data, directory, |_, info| {
        let entry = &info.file_entry;
        let (file_size, directory_children) = match entry.file_type {
            FileType::Directory => (
                0,
                entry.directory().map_or(0, |dir| dir.items_in_directory),
            ),
            _ => (entry.data().map_or(0, |data| data.size), 0),
        };
        children.push(DirectoryChild {
            name: info.name.clone(),
            identifier: entry.identifier,
            file_type: entry.file_type,
            file_size,
            directory_children,
        });
        false
    })?;
    Ok(children)
}

// ── Search ──────────────────────────────────────────────────────────────────

/// Find the first entry named `name`; duplicates are permitted on disk and
/// the first match wins.
pub fn search(
    io: &BlockIo,
    sb: &Superblock,
    data: &FileDataAttr,
    directory: &FileDirectoryAttr,
    name: &[u8],
) -> Result<Option<FoundEntry>> {
    let mut found = None;
    walk_entries(io, sb, data, directory, |state, info| {
        if info.name != name {
            return false;
        }
        found = Some(FoundEntry {
            file_entry_length: info.file_entry_length,
            container_block: state.current_block,
            offset_into_block: (state.position + info.file_entry_offset) as u32,
            offset_into_block2: state.position as u32,
            file_entry: info.file_entry,
        });
        true
    })?;
    Ok(found)
}

// ── Create ──────────────────────────────────────────────────────────────────

/// Insert a new child entry into the directory.
///
/// The identifier combines 8 random low bytes with the global block the
/// entry lands in, so lookups stay collision-free within a volume. The
/// directory stream grows by one cleared block when the last block has no
/// room; callers persist the parent's file entry afterwards.
#[allow(clippy::too_many_arguments)]
pub fn create_entry(
    io: &BlockIo,
    sb: &mut Superblock,
    gdt: &mut [esfs_ondisk::GroupDescriptor],
    data: &mut FileDataAttr,
    directory: &mut FileDirectoryAttr,
    dir_container_block: u64,
    name: &[u8],
    file_type: FileType,
    timestamp: u64,
) -> Result<CreatedEntry> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(EsfsError::NameTooLong);
    }

    let block_size = u64_to_usize(sb.block_size, "block_size")?;
    let mut identifier = UniqueIdentifier::from_bytes(rand::random());
    let mut file_entry = FileEntry::new(identifier, file_type, timestamp);
    let entry_length = encode_directory_entry(name, &file_entry)?.len();
    if entry_length > block_size {
        return Err(EsfsError::Format(
            "directory entry exceeds the block size".to_owned(),
        ));
    }

    // Find the free space in the last block, walking entries to the first
    // zero byte.
    let mut last_block = vec![0_u8; block_size];
    let mut position = 0_usize;
    let mut space_remaining = 0_usize;
    if data.size > 0 {
        read_stream(io, sb, data, data.size - sb.block_size, &mut last_block)?;
        while position != block_size && last_block[position] != 0 {
            let length = directory_entry_total_length(&last_block[position..])
                .map_err(|error| corruption(dir_container_block, format!("{error}")))?;
            position += length;
        }
        space_remaining = block_size - position;
    }

    let grew = space_remaining < entry_length;
    if grew {
        resize_data_stream(
            io,
            sb,
            gdt,
            data,
            data.size + sb.block_size,
            true,
            dir_container_block,
        )?;
    }

    // Bind the identifier to the block the entry will land in.
    let entry_block = get_block_from_stream(io, sb, data, data.size - sb.block_size)?;
    identifier.set_container_block(entry_block);
    file_entry.identifier = identifier;
    let entry_bytes = encode_directory_entry(name, &file_entry)?;

    if grew {
        // The fresh block is cleared; the entry starts it.
        let mut block = vec![0_u8; block_size];
        block[..entry_bytes.len()].copy_from_slice(&entry_bytes);
        write_stream(io, sb, data, data.size - sb.block_size, &block)?;
        directory.space_available_in_last_block = (block_size - entry_bytes.len()) as u16;
    } else {
        last_block[position..position + entry_bytes.len()].copy_from_slice(&entry_bytes);
        write_stream(io, sb, data, data.size - sb.block_size, &last_block)?;
        directory.space_available_in_last_block =
            (block_size - position - entry_bytes.len()) as u16;
    }

    directory.items_in_directory += 1;
    debug!(
        target: "esfs::dir",
        name = %String::from_utf8_lossy(name),
        block = entry_block,
        items = directory.items_in_directory,
        "created directory entry"
    );

    Ok(CreatedEntry {
        identifier,
        container_block: entry_block,
    })
}

// ── Remove ──────────────────────────────────────────────────────────────────

/// Remove the directory entry at `offset_into_block2` of `container_block`.
///
/// The entries after it in the same block shift down to fill the gap and
/// the vacated tail is zeroed. Entries in later blocks stay where they
/// are; reclaiming trailing empty blocks is future work.
pub fn remove_entry(
    io: &BlockIo,
    sb: &Superblock,
    directory: &mut FileDirectoryAttr,
    container_block: u64,
    offset_into_block2: u32,
) -> Result<RemovedEntry> {
    let block_size = u64_to_usize(sb.block_size, "block_size")?;
    let mut block = vec![0_u8; block_size];
    io.read_blocks(container_block, &mut block)?;

    let offset = offset_into_block2 as usize;
    if offset >= block_size {
        return Err(EsfsError::InvalidHandle);
    }
    let removed_length = directory_entry_total_length(&block[offset..])
        .map_err(|error| corruption(container_block, format!("{error}")))?;

    // Shift the tail down and zero the vacated bytes.
    block.copy_within(offset + removed_length.., offset);
    block[block_size - removed_length..].fill(0);
    io.write_blocks(container_block, &block)?;

    directory.items_in_directory = directory
        .items_in_directory
        .checked_sub(1)
        .ok_or_else(|| corruption(container_block, "directory item count underflow"))?;

    // Collect the entries that moved, so open nodes can be re-bound.
    let mut shifted = Vec::new();
    let mut position = offset;
    while position < block_size && block[position] != 0 {
        let info = parse_directory_entry(&block[position..])
            .map_err(|error| corruption(container_block, format!("{error}")))?;
        shifted.push(info.file_entry.identifier);
        position += info.total_length;
    }

    trace!(
        target: "esfs::dir",
        block = container_block,
        removed = removed_length,
        shifted = shifted.len(),
        "removed directory entry"
    );

    Ok(RemovedEntry {
        removed_length: removed_length as u32,
        shifted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use esfs_block::MemoryDevice;
    use esfs_ondisk::GroupDescriptor;
    use esfs_types::{BlockSize, LocalExtent, MAX_VOLUME_NAME_LENGTH};
    use std::sync::Arc;

    const BLOCK_SIZE: u64 = 512;
    const DIR_CONTAINER: u64 = 1;

    struct Fixture {
        io: BlockIo,
        sb: Superblock,
        gdt: Vec<GroupDescriptor>,
        data: FileDataAttr,
        directory: FileDirectoryAttr,
    }

    impl Fixture {
        fn new() -> Self {
            let dev = Arc::new(MemoryDevice::new(250 * BLOCK_SIZE as usize + 8192));
            let io = BlockIo::new(dev, BlockSize::new(BLOCK_SIZE).unwrap()).unwrap();
            let sb = Superblock {
                volume_name: [0; MAX_VOLUME_NAME_LENGTH],
                required_read_version: 2,
                required_write_version: 2,
                mounted: 0,
                block_size: BLOCK_SIZE,
                block_count: 250,
                blocks_used: 2,
                blocks_per_group: 64,
                group_count: 4,
                blocks_per_group_extent_table: 1,
                gdt: LocalExtent { offset: 0, count: 1 },
                root_directory_file_entry: LocalExtent { offset: 1, count: 1 },
                identifier: esfs_types::UniqueIdentifier::ZERO,
                os_installation: esfs_types::UniqueIdentifier::ZERO,
            };
            let mut gdt = vec![GroupDescriptor::default(); 4];
            gdt[0] = GroupDescriptor {
                extent_table: 1,
                extent_count: 1,
                blocks_used: 2,
            };
            let mut raw = vec![0_u8; BLOCK_SIZE as usize];
            raw[0..4].copy_from_slice(&LocalExtent { offset: 2, count: 62 }.encode());
            io.write_blocks(1, &raw).unwrap();

            Self {
                io,
                sb,
                gdt,
                data: FileDataAttr::new_direct(),
                directory: FileDirectoryAttr::default(),
            }
        }

        fn create(&mut self, name: &str, file_type: FileType) -> Result<CreatedEntry> {
            create_entry(
                &self.io,
                &mut self.sb,
                &mut self.gdt,
                &mut self.data,
                &mut self.directory,
                DIR_CONTAINER,
                name.as_bytes(),
                file_type,
                100,
            )
        }

        fn search(&self, name: &str) -> Option<FoundEntry> {
            search(
                &self.io,
                &self.sb,
                &self.data,
                &self.directory,
                name.as_bytes(),
            )
            .unwrap()
        }

        fn names(&self) -> Vec<String> {
            enumerate(&self.io, &self.sb, &self.data, &self.directory)
                .unwrap()
                .into_iter()
                .map(|child| String::from_utf8(child.name).unwrap())
                .collect()
        }
    }

    #[test]
    fn first_entry_grows_the_stream() {
        let mut fx = Fixture::new();
        assert_eq!(fx.data.size, 0);

        let created = fx.create("hello.txt", FileType::File).unwrap();
        assert_eq!(fx.data.size, BLOCK_SIZE);
        assert_eq!(fx.directory.items_in_directory, 1);
        // The identifier's high half holds the entry's block.
        assert_eq!(created.identifier.container_block(), created.container_block);

        let found = fx.search("hello.txt").expect("entry must be found");
        assert_eq!(found.file_entry.identifier, created.identifier);
        assert_eq!(found.file_entry.file_type, FileType::File);
        assert_eq!(found.container_block, created.container_block);
        assert_eq!(found.offset_into_block2, 0);
    }

    #[test]
    fn missing_name_is_not_found() {
        let mut fx = Fixture::new();
        fx.create("present", FileType::File).unwrap();
        assert!(fx.search("absent").is_none());
    }

    #[test]
    fn entries_pack_until_the_block_is_full() {
        let mut fx = Fixture::new();
        // ~150 bytes per entry: three fit into a 512-byte block.
        for name in ["a", "b", "c", "d"] {
            fx.create(name, FileType::File).unwrap();
        }
        assert_eq!(fx.data.size, 2 * BLOCK_SIZE);
        assert_eq!(fx.names(), vec!["a", "b", "c", "d"]);

        // The fourth entry starts the second block.
        let found = fx.search("d").unwrap();
        assert_eq!(found.offset_into_block2, 0);
        let third = fx.search("c").unwrap();
        assert_ne!(third.container_block, found.container_block);
    }

    #[test]
    fn duplicate_names_are_permitted_and_first_wins() {
        let mut fx = Fixture::new();
        let first = fx.create("twin", FileType::File).unwrap();
        let second = fx.create("twin", FileType::File).unwrap();
        assert_ne!(first.identifier, second.identifier);
        assert_eq!(fx.directory.items_in_directory, 2);

        let found = fx.search("twin").unwrap();
        assert_eq!(found.file_entry.identifier, first.identifier);
    }

    #[test]
    fn long_names_are_rejected() {
        let mut fx = Fixture::new();
        let long = "x".repeat(256);
        assert!(matches!(
            fx.create(&long, FileType::File),
            Err(EsfsError::NameTooLong)
        ));
        let just_fits = "y".repeat(255);
        assert!(fx.create(&just_fits, FileType::File).is_ok());
    }

    #[test]
    fn directory_children_counted() {
        let mut fx = Fixture::new();
        fx.create("subdir", FileType::Directory).unwrap();
        let children = enumerate(&fx.io, &fx.sb, &fx.data, &fx.directory).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].file_type, FileType::Directory);
        assert_eq!(children[0].directory_children, 0);
    }

    #[test]
    fn remove_compacts_the_block_and_reports_shifted_entries() {
        let mut fx = Fixture::new();
        let a = fx.create("a", FileType::File).unwrap();
        let b = fx.create("b", FileType::File).unwrap();
        let c = fx.create("c", FileType::File).unwrap();
        assert_eq!(a.container_block, b.container_block);

        let before_b = fx.search("b").unwrap();
        let before_c = fx.search("c").unwrap();

        let a_offset = fx.search("a").unwrap().offset_into_block2;
        let removed = remove_entry(
            &fx.io,
            &fx.sb,
            &mut fx.directory,
            a.container_block,
            a_offset,
        )
        .unwrap();

        assert_eq!(fx.directory.items_in_directory, 2);
        assert_eq!(removed.shifted, vec![b.identifier, c.identifier]);
        assert!(removed.removed_length > 0);

        // The survivors moved down by exactly the removed length.
        let after_b = fx.search("b").unwrap();
        let after_c = fx.search("c").unwrap();
        assert_eq!(
            after_b.offset_into_block2 + removed.removed_length,
            before_b.offset_into_block2
        );
        assert_eq!(
            after_c.offset_into_block2 + removed.removed_length,
            before_c.offset_into_block2
        );
        assert_eq!(fx.names(), vec!["b", "c"]);

        // The vacated tail of the block reads back as zeros.
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        fx.io.read_blocks(a.container_block, &mut block).unwrap();
        let tail = &block[BLOCK_SIZE as usize - removed.removed_length as usize..];
        assert!(tail.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn remove_last_entry_leaves_empty_directory() {
        let mut fx = Fixture::new();
        let only = fx.create("solo", FileType::File).unwrap();
        let found = fx.search("solo").unwrap();

        let removed = remove_entry(
            &fx.io,
            &fx.sb,
            &mut fx.directory,
            only.container_block,
            found.offset_into_block2,
        )
        .unwrap();
        assert!(removed.shifted.is_empty());
        assert_eq!(fx.directory.items_in_directory, 0);
        assert!(fx.names().is_empty());
    }

    #[test]
    fn space_available_tracks_the_last_block() {
        let mut fx = Fixture::new();
        // A file entry is 41 + 80 + 4 bytes; wrapping it with the entry
        // header, a 3-byte name, and the terminator gives 149.
        let entry_length = 149_u16;

        fx.create("one", FileType::File).unwrap();
        let after_one = fx.directory.space_available_in_last_block;
        assert_eq!(after_one, BLOCK_SIZE as u16 - entry_length);

        fx.create("two", FileType::File).unwrap();
        let after_two = fx.directory.space_available_in_last_block;
        assert_eq!(after_one - after_two, entry_length);
    }
}
