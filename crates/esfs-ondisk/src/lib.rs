#![forbid(unsafe_code)]
//! On-disk structures for EssenceFS.
//!
//! Bit-exact little-endian parsing and serialization for the superblock,
//! the group descriptor table, file entries with their attribute lists,
//! and directory entries. All layouts are densely packed; multi-byte
//! integers are little-endian.

mod entry;
mod superblock;

pub use entry::{
    encode_directory_entry, parse_directory_entry, directory_entry_total_length, DataPayload,
    DirectoryEntryInfo, FileAttribute, FileDataAttr, FileDirectoryAttr, FileEntry, FileType,
    Indirection, DIRECTORY_ENTRY_HEADER_SIZE, DIRECTORY_NAME_ATTR_BASE_SIZE,
    FILE_DATA_ATTR_SIZE, FILE_DIRECTORY_ATTR_SIZE, FILE_ENTRY_HEADER_SIZE, LIST_END_SIZE,
};
pub use superblock::{
    encode_descriptor_table, parse_descriptor_table, GroupDescriptor, Superblock,
    SUPERBLOCK_ENCODED_SIZE,
};
