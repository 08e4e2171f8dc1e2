//! Superblock and group descriptor table layout.

use esfs_types::{
    ensure_slice, read_fixed, read_le_u16, read_le_u64, trim_nul_padded, BlockSize, LocalExtent,
    ParseError, UniqueIdentifier, BOOT_SUPER_BLOCK_SIZE, GROUP_DESCRIPTOR_SIZE,
    MAX_VOLUME_NAME_LENGTH, SUPERBLOCK_SIGNATURE,
};

// Field offsets within the packed superblock.
mod offsets {
    pub const SIGNATURE: usize = 0;
    pub const VOLUME_NAME: usize = 16;
    pub const REQUIRED_READ_VERSION: usize = 48;
    pub const REQUIRED_WRITE_VERSION: usize = 50;
    pub const MOUNTED: usize = 52;
    pub const BLOCK_SIZE: usize = 53;
    pub const BLOCK_COUNT: usize = 61;
    pub const BLOCKS_USED: usize = 69;
    pub const BLOCKS_PER_GROUP: usize = 77;
    pub const GROUP_COUNT: usize = 79;
    pub const BLOCKS_PER_GROUP_EXTENT_TABLE: usize = 87;
    pub const GDT: usize = 95;
    pub const ROOT_DIRECTORY_FILE_ENTRY: usize = 99;
    pub const IDENTIFIER: usize = 103;
    pub const OS_INSTALLATION: usize = 119;
    pub const END: usize = 135;
}

/// Packed superblock length before padding to 8192 bytes.
pub const SUPERBLOCK_ENCODED_SIZE: usize = offsets::END;

/// The volume header, stored at byte offset 8192 and backed up in the
/// final 8192 bytes of the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub volume_name: [u8; MAX_VOLUME_NAME_LENGTH],
    pub required_read_version: u16,
    pub required_write_version: u16,
    /// Non-zero while the volume is mounted (or was not unmounted cleanly).
    pub mounted: u8,
    pub block_size: u64,
    pub block_count: u64,
    pub blocks_used: u64,
    pub blocks_per_group: u16,
    pub group_count: u64,
    /// Blocks reserved for each group's extent table.
    pub blocks_per_group_extent_table: u64,
    /// Location of the group descriptor table (offset is a global block).
    pub gdt: LocalExtent,
    /// Location of the root directory's file entry (offset is a global block).
    pub root_directory_file_entry: LocalExtent,
    pub identifier: UniqueIdentifier,
    pub os_installation: UniqueIdentifier,
}

impl Superblock {
    /// Parse and validate a superblock from an 8 KiB region.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        let signature = ensure_slice(region, offsets::SIGNATURE, 16)?;
        if signature != SUPERBLOCK_SIGNATURE {
            return Err(ParseError::InvalidSignature { what: "superblock" });
        }

        let block_size = read_le_u64(region, offsets::BLOCK_SIZE)?;
        BlockSize::new(block_size)?;

        let block_count = read_le_u64(region, offsets::BLOCK_COUNT)?;
        let blocks_used = read_le_u64(region, offsets::BLOCKS_USED)?;
        if blocks_used > block_count {
            return Err(ParseError::InvalidField {
                field: "blocks_used",
                reason: "exceeds block count",
            });
        }

        let blocks_per_group = read_le_u16(region, offsets::BLOCKS_PER_GROUP)?;
        if blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "blocks_per_group",
                reason: "must be non-zero",
            });
        }

        Ok(Self {
            volume_name: read_fixed::<MAX_VOLUME_NAME_LENGTH>(region, offsets::VOLUME_NAME)?,
            required_read_version: read_le_u16(region, offsets::REQUIRED_READ_VERSION)?,
            required_write_version: read_le_u16(region, offsets::REQUIRED_WRITE_VERSION)?,
            mounted: ensure_slice(region, offsets::MOUNTED, 1)?[0],
            block_size,
            block_count,
            blocks_used,
            blocks_per_group,
            group_count: read_le_u64(region, offsets::GROUP_COUNT)?,
            blocks_per_group_extent_table: read_le_u64(
                region,
                offsets::BLOCKS_PER_GROUP_EXTENT_TABLE,
            )?,
            gdt: LocalExtent::decode(region, offsets::GDT)?,
            root_directory_file_entry: LocalExtent::decode(
                region,
                offsets::ROOT_DIRECTORY_FILE_ENTRY,
            )?,
            identifier: UniqueIdentifier::from_bytes(read_fixed::<16>(
                region,
                offsets::IDENTIFIER,
            )?),
            os_installation: UniqueIdentifier::from_bytes(read_fixed::<16>(
                region,
                offsets::OS_INSTALLATION,
            )?),
        })
    }

    /// Serialize into a full 8 KiB region, zero-padded past the packed fields.
    #[must_use]
    pub fn serialize_region(&self) -> Vec<u8> {
        let mut region = vec![0_u8; BOOT_SUPER_BLOCK_SIZE as usize];
        region[offsets::SIGNATURE..offsets::SIGNATURE + 16].copy_from_slice(SUPERBLOCK_SIGNATURE);
        region[offsets::VOLUME_NAME..offsets::VOLUME_NAME + MAX_VOLUME_NAME_LENGTH]
            .copy_from_slice(&self.volume_name);
        region[offsets::REQUIRED_READ_VERSION..offsets::REQUIRED_READ_VERSION + 2]
            .copy_from_slice(&self.required_read_version.to_le_bytes());
        region[offsets::REQUIRED_WRITE_VERSION..offsets::REQUIRED_WRITE_VERSION + 2]
            .copy_from_slice(&self.required_write_version.to_le_bytes());
        region[offsets::MOUNTED] = self.mounted;
        region[offsets::BLOCK_SIZE..offsets::BLOCK_SIZE + 8]
            .copy_from_slice(&self.block_size.to_le_bytes());
        region[offsets::BLOCK_COUNT..offsets::BLOCK_COUNT + 8]
            .copy_from_slice(&self.block_count.to_le_bytes());
        region[offsets::BLOCKS_USED..offsets::BLOCKS_USED + 8]
            .copy_from_slice(&self.blocks_used.to_le_bytes());
        region[offsets::BLOCKS_PER_GROUP..offsets::BLOCKS_PER_GROUP + 2]
            .copy_from_slice(&self.blocks_per_group.to_le_bytes());
        region[offsets::GROUP_COUNT..offsets::GROUP_COUNT + 8]
            .copy_from_slice(&self.group_count.to_le_bytes());
        region[offsets::BLOCKS_PER_GROUP_EXTENT_TABLE
            ..offsets::BLOCKS_PER_GROUP_EXTENT_TABLE + 8]
            .copy_from_slice(&self.blocks_per_group_extent_table.to_le_bytes());
        region[offsets::GDT..offsets::GDT + 4].copy_from_slice(&self.gdt.encode());
        region[offsets::ROOT_DIRECTORY_FILE_ENTRY..offsets::ROOT_DIRECTORY_FILE_ENTRY + 4]
            .copy_from_slice(&self.root_directory_file_entry.encode());
        region[offsets::IDENTIFIER..offsets::IDENTIFIER + 16]
            .copy_from_slice(self.identifier.as_bytes());
        region[offsets::OS_INSTALLATION..offsets::OS_INSTALLATION + 16]
            .copy_from_slice(self.os_installation.as_bytes());
        region
    }

    /// Volume name with NUL padding stripped.
    #[must_use]
    pub fn volume_name_string(&self) -> String {
        trim_nul_padded(&self.volume_name)
    }

    /// Number of blocks in `group`; the final group holds the remainder.
    #[must_use]
    pub fn blocks_in_group(&self, group: u64) -> u64 {
        if group == self.group_count - 1 {
            self.block_count % u64::from(self.blocks_per_group)
        } else {
            u64::from(self.blocks_per_group)
        }
    }
}

// ── Group descriptors ───────────────────────────────────────────────────────

/// Per-group allocation bookkeeping, 32 bytes on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupDescriptor {
    /// First block of the group's extent table; 0 means the group has not
    /// been initialised and no blocks in it are used.
    pub extent_table: u64,
    pub extent_count: u16,
    pub blocks_used: u16,
}

impl GroupDescriptor {
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            extent_table: read_le_u64(bytes, offset)?,
            extent_count: read_le_u16(bytes, offset + 8)?,
            blocks_used: read_le_u16(bytes, offset + 10)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; GROUP_DESCRIPTOR_SIZE] {
        let mut out = [0_u8; GROUP_DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.extent_table.to_le_bytes());
        out[8..10].copy_from_slice(&self.extent_count.to_le_bytes());
        out[10..12].copy_from_slice(&self.blocks_used.to_le_bytes());
        out
    }
}

/// Parse `group_count` descriptors from the raw GDT blocks.
pub fn parse_descriptor_table(
    bytes: &[u8],
    group_count: u64,
) -> Result<Vec<GroupDescriptor>, ParseError> {
    let count = usize::try_from(group_count).map_err(|_| ParseError::IntegerConversion {
        field: "group_count",
    })?;
    let mut table = Vec::with_capacity(count);
    for index in 0..count {
        table.push(GroupDescriptor::decode(
            bytes,
            index * GROUP_DESCRIPTOR_SIZE,
        )?);
    }
    Ok(table)
}

/// Serialize descriptors into a buffer of `table_bytes` (the GDT block span).
pub fn encode_descriptor_table(
    table: &[GroupDescriptor],
    table_bytes: usize,
) -> Result<Vec<u8>, ParseError> {
    if table.len() * GROUP_DESCRIPTOR_SIZE > table_bytes {
        return Err(ParseError::InvalidField {
            field: "group_descriptor_table",
            reason: "descriptors exceed the reserved GDT blocks",
        });
    }
    let mut out = vec![0_u8; table_bytes];
    for (index, descriptor) in table.iter().enumerate() {
        out[index * GROUP_DESCRIPTOR_SIZE..(index + 1) * GROUP_DESCRIPTOR_SIZE]
            .copy_from_slice(&descriptor.encode());
    }
    Ok(out)
}
