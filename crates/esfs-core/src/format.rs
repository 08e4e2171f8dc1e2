//! Offline volume formatting.
//!
//! Lays down the boot/super region, the group descriptor table, the
//! first group's extent table, the root directory file entry, and the
//! backup superblock. The first group starts with everything up to and
//! including its extent table in use; every other group initialises
//! lazily on first allocation.

use crate::volume::now_seconds;
use esfs_block::{write_superblock_region, BlockDevicePort, BlockIo};
use esfs_error::{EsfsError, Result};
use esfs_ondisk::{encode_descriptor_table, FileEntry, FileType, GroupDescriptor, Superblock};
use esfs_types::{
    blocks_needed_to_store, u64_to_usize, BlockSize, ByteOffset, LocalExtent, UniqueIdentifier,
    BOOT_SUPER_BLOCK_SIZE, DRIVER_VERSION, GROUP_DESCRIPTOR_SIZE, MAX_BLOCK_SIZE,
    MAX_VOLUME_NAME_LENGTH, MIN_VOLUME_SIZE, SUPERBLOCK_OFFSET,
};
use std::sync::Arc;
use tracing::info;

/// Geometry of a freshly formatted volume.
#[derive(Debug, Clone)]
pub struct FormatReport {
    pub block_size: u64,
    pub block_count: u64,
    pub blocks_per_group: u16,
    pub group_count: u64,
    pub blocks_used: u64,
    pub identifier: UniqueIdentifier,
}

/// Pick the block size from the volume size.
#[must_use]
pub fn choose_block_size(volume_size: u64) -> u64 {
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;
    if volume_size < 512 * MIB {
        512
    } else if volume_size < GIB {
        1024
    } else if volume_size < 2 * GIB {
        2048
    } else if volume_size < 256 * GIB {
        4096
    } else if volume_size < 256 * 1024 * GIB {
        8192
    } else {
        MAX_BLOCK_SIZE
    }
}

/// Format `volume_size` bytes of `dev` as an EssenceFS volume.
pub fn format_volume(
    dev: Arc<dyn BlockDevicePort>,
    volume_size: u64,
    volume_name: &str,
) -> Result<FormatReport> {
    if volume_size < MIN_VOLUME_SIZE {
        return Err(EsfsError::Format(format!(
            "cannot format {volume_size} bytes; the minimum volume is {MIN_VOLUME_SIZE}"
        )));
    }
    if volume_size > dev.len_bytes() {
        return Err(EsfsError::Format(format!(
            "volume of {volume_size} bytes does not fit the {}-byte device",
            dev.len_bytes()
        )));
    }
    if volume_name.len() > MAX_VOLUME_NAME_LENGTH {
        return Err(EsfsError::NameTooLong);
    }

    let block_size = choose_block_size(volume_size);
    let io = BlockIo::new(dev.clone(), BlockSize::new(block_size)?)?;

    let mut block_count = volume_size / block_size;

    // At most 4096 blocks per group, halving until at least one group fits.
    let mut blocks_per_group: u16 = 4096;
    let group_count = loop {
        let groups = block_count / u64::from(blocks_per_group);
        if groups > 0 {
            break groups;
        }
        blocks_per_group /= 2;
    };

    // The worst-case extent table of a group is `blocks_per_group` bytes.
    let blocks_per_group_extent_table =
        blocks_needed_to_store(u64::from(blocks_per_group), block_size);
    let gdt_blocks =
        blocks_needed_to_store(group_count * GROUP_DESCRIPTOR_SIZE as u64, block_size);
    let boot_super_blocks = (2 * BOOT_SUPER_BLOCK_SIZE) / block_size;

    let initial_block_usage = boot_super_blocks
        + gdt_blocks
        + 1 // Root directory file entry.
        + blocks_per_group_extent_table;
    if initial_block_usage >= u64::from(blocks_per_group) {
        return Err(EsfsError::Format(format!(
            "core data ({initial_block_usage} blocks) does not fit the first group"
        )));
    }

    // The tail of the last group stores the superblock backup.
    block_count -= boot_super_blocks / 2;

    let narrow = |value: u64, what: &str| {
        u16::try_from(value)
            .map_err(|_| EsfsError::Format(format!("{what} does not fit its on-disk field")))
    };

    let mut volume_name_bytes = [0_u8; MAX_VOLUME_NAME_LENGTH];
    volume_name_bytes[..volume_name.len()].copy_from_slice(volume_name.as_bytes());

    let superblock = Superblock {
        volume_name: volume_name_bytes,
        required_read_version: DRIVER_VERSION,
        required_write_version: DRIVER_VERSION,
        mounted: 0,
        block_size,
        block_count,
        blocks_used: initial_block_usage,
        blocks_per_group,
        group_count,
        blocks_per_group_extent_table,
        gdt: LocalExtent {
            offset: narrow(boot_super_blocks, "GDT offset")?,
            count: narrow(gdt_blocks, "GDT block count")?,
        },
        root_directory_file_entry: LocalExtent {
            offset: narrow(boot_super_blocks + gdt_blocks, "root entry offset")?,
            count: 1,
        },
        identifier: UniqueIdentifier::from_bytes(rand::random()),
        os_installation: UniqueIdentifier::ZERO,
    };

    // Group 0 starts life initialised: its extent table sits in the last
    // block of the initially used region and covers the remainder.
    let mut gdt = vec![GroupDescriptor::default(); u64_to_usize(group_count, "group_count")?];
    gdt[0] = GroupDescriptor {
        extent_table: initial_block_usage - 1,
        extent_count: 1,
        blocks_used: narrow(initial_block_usage, "initial block usage")?,
    };

    let first_extent = LocalExtent {
        offset: narrow(initial_block_usage, "first free extent offset")?,
        count: narrow(
            u64::from(blocks_per_group) - initial_block_usage,
            "first free extent count",
        )?,
    };
    let mut extent_table_image = vec![
        0_u8;
        u64_to_usize(
            blocks_per_group_extent_table * block_size,
            "extent_table"
        )?
    ];
    extent_table_image[..4].copy_from_slice(&first_extent.encode());

    let root_entry = FileEntry::new(
        UniqueIdentifier::from_bytes(rand::random()),
        FileType::Directory,
        now_seconds(),
    );
    let mut root_block = vec![0_u8; u64_to_usize(block_size, "block_size")?];
    let root_bytes = root_entry.encode();
    root_block[..root_bytes.len()].copy_from_slice(&root_bytes);

    // Persist, leaving the boot block untouched.
    let region = superblock.serialize_region();
    write_superblock_region(dev.as_ref(), ByteOffset(SUPERBLOCK_OFFSET), &region)?;
    write_superblock_region(dev.as_ref(), ByteOffset(block_count * block_size), &region)?;
    let gdt_image = encode_descriptor_table(&gdt, u64_to_usize(gdt_blocks * block_size, "gdt")?)?;
    io.write_blocks(boot_super_blocks, &gdt_image)?;
    io.write_blocks(initial_block_usage - 1, &extent_table_image)?;
    io.write_blocks(boot_super_blocks + gdt_blocks, &root_block)?;
    io.sync()?;

    info!(
        target: "esfs::format",
        name = volume_name,
        block_size,
        block_count,
        groups = group_count,
        identifier = %superblock.identifier,
        "formatted volume"
    );

    Ok(FormatReport {
        block_size,
        block_count,
        blocks_per_group,
        group_count,
        blocks_used: initial_block_usage,
        identifier: superblock.identifier,
    })
}
