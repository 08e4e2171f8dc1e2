//! File entries, attribute lists, and directory entries.
//!
//! A file entry is a signature, identifier, type, and timestamps followed
//! by a `{type, size}`-tagged attribute list terminated by 0xFFFF. A
//! directory entry wraps a name attribute and an embedded file entry in
//! the same tagged format. Entries never span a block boundary.

use esfs_types::{
    ensure_slice, read_fixed, read_le_u16, read_le_u64, ParseError, GlobalExtent,
    UniqueIdentifier, ATTRIBUTE_DIRECTORY_FILE, ATTRIBUTE_DIRECTORY_NAME, ATTRIBUTE_FILE_DATA,
    ATTRIBUTE_FILE_DIRECTORY, ATTRIBUTE_HEADER_SIZE, ATTRIBUTE_LIST_END, DIRECTORY_ENTRY_SIGNATURE,
    DIRECT_BYTES, FILE_ENTRY_SIGNATURE, GLOBAL_EXTENT_SIZE, INDIRECT_2_BLOCKS, INDIRECT_EXTENTS,
    MAX_NAME_LENGTH, STREAM_DEFAULT,
};

/// Fixed prefix of a file entry before its attribute list.
pub const FILE_ENTRY_HEADER_SIZE: usize = 41;

/// Encoded size of a `FILE_DATA` attribute (header + fields + 64-byte union).
pub const FILE_DATA_ATTR_SIZE: usize = 80;

/// Encoded size of a `FILE_DIRECTORY` attribute.
pub const FILE_DIRECTORY_ATTR_SIZE: usize = 14;

/// Encoded size of the attribute-list terminator.
pub const LIST_END_SIZE: usize = ATTRIBUTE_HEADER_SIZE;

/// Signature prefix of a directory entry.
pub const DIRECTORY_ENTRY_HEADER_SIZE: usize = 8;

/// `DIRECTORY_NAME` attribute size before the name bytes.
pub const DIRECTORY_NAME_ATTR_BASE_SIZE: usize = 5;

// ── File types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    SymbolicLink,
}

impl FileType {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            3 => Ok(Self::SymbolicLink),
            _ => Err(ParseError::InvalidField {
                field: "file_type",
                reason: "unknown file type",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
            Self::SymbolicLink => 3,
        }
    }
}

// ── Indirection ─────────────────────────────────────────────────────────────

/// Encoding used to map logical stream bytes to physical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indirection {
    Indirect,
    Indirect2,
    Direct,
}

impl Indirection {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::Indirect),
            2 => Ok(Self::Indirect2),
            4 => Ok(Self::Direct),
            _ => Err(ParseError::InvalidField {
                field: "indirection",
                reason: "unsupported indirection mode",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Indirect => 1,
            Self::Indirect2 => 2,
            Self::Direct => 4,
        }
    }
}

// ── FILE_DATA attribute ─────────────────────────────────────────────────────

/// The three-way union at the tail of a `FILE_DATA` attribute, keyed by
/// the indirection mode. The trailing 64 bytes are opaque until the tag
/// is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPayload {
    /// The stream bytes themselves, inline.
    Direct([u8; DIRECT_BYTES]),
    /// Up to four inline extents listing all blocks of the stream.
    Indirect([GlobalExtent; INDIRECT_EXTENTS]),
    /// Up to eight blocks each holding a packed list of extents.
    Indirect2([u64; INDIRECT_2_BLOCKS]),
}

/// A file's data stream attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataAttr {
    pub stream: u8,
    pub extent_count: u16,
    /// Stream length in bytes.
    pub size: u64,
    pub payload: DataPayload,
}

impl FileDataAttr {
    /// A fresh, empty DIRECT stream.
    #[must_use]
    pub fn new_direct() -> Self {
        Self {
            stream: STREAM_DEFAULT,
            extent_count: 0,
            size: 0,
            payload: DataPayload::Direct([0; DIRECT_BYTES]),
        }
    }

    #[must_use]
    pub fn indirection(&self) -> Indirection {
        match self.payload {
            DataPayload::Direct(_) => Indirection::Direct,
            DataPayload::Indirect(_) => Indirection::Indirect,
            DataPayload::Indirect2(_) => Indirection::Indirect2,
        }
    }

    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let attr_size = read_le_u16(bytes, offset + 2)?;
        if usize::from(attr_size) != FILE_DATA_ATTR_SIZE {
            return Err(ParseError::InvalidField {
                field: "file_data",
                reason: "unexpected attribute size",
            });
        }

        let stream = ensure_slice(bytes, offset + 4, 1)?[0];
        let indirection = Indirection::from_raw(ensure_slice(bytes, offset + 5, 1)?[0])?;
        let extent_count = read_le_u16(bytes, offset + 6)?;
        let size = read_le_u64(bytes, offset + 8)?;
        let union_offset = offset + 16;

        let payload = match indirection {
            Indirection::Direct => {
                DataPayload::Direct(read_fixed::<DIRECT_BYTES>(bytes, union_offset)?)
            }
            Indirection::Indirect => {
                let mut extents = [GlobalExtent::ZERO; INDIRECT_EXTENTS];
                for (i, extent) in extents.iter_mut().enumerate() {
                    *extent =
                        GlobalExtent::decode(bytes, union_offset + i * GLOBAL_EXTENT_SIZE)?;
                }
                DataPayload::Indirect(extents)
            }
            Indirection::Indirect2 => {
                let mut blocks = [0_u64; INDIRECT_2_BLOCKS];
                for (i, block) in blocks.iter_mut().enumerate() {
                    *block = read_le_u64(bytes, union_offset + i * 8)?;
                }
                DataPayload::Indirect2(blocks)
            }
        };

        Ok(Self {
            stream,
            extent_count,
            size,
            payload,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FILE_DATA_ATTR_SIZE] {
        let mut out = [0_u8; FILE_DATA_ATTR_SIZE];
        out[0..2].copy_from_slice(&ATTRIBUTE_FILE_DATA.to_le_bytes());
        out[2..4].copy_from_slice(&(FILE_DATA_ATTR_SIZE as u16).to_le_bytes());
        out[4] = self.stream;
        out[5] = self.indirection().to_raw();
        out[6..8].copy_from_slice(&self.extent_count.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        match &self.payload {
            DataPayload::Direct(bytes) => out[16..16 + DIRECT_BYTES].copy_from_slice(bytes),
            DataPayload::Indirect(extents) => {
                for (i, extent) in extents.iter().enumerate() {
                    out[16 + i * GLOBAL_EXTENT_SIZE..16 + (i + 1) * GLOBAL_EXTENT_SIZE]
                        .copy_from_slice(&extent.encode());
                }
            }
            DataPayload::Indirect2(blocks) => {
                for (i, block) in blocks.iter().enumerate() {
                    out[16 + i * 8..16 + (i + 1) * 8].copy_from_slice(&block.to_le_bytes());
                }
            }
        }
        out
    }
}

// ── FILE_DIRECTORY attribute ────────────────────────────────────────────────

/// Directory bookkeeping attribute of a directory's file entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileDirectoryAttr {
    pub items_in_directory: u64,
    /// Advisory; recomputed from the last block on every insert.
    pub space_available_in_last_block: u16,
}

impl FileDirectoryAttr {
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let attr_size = read_le_u16(bytes, offset + 2)?;
        if usize::from(attr_size) != FILE_DIRECTORY_ATTR_SIZE {
            return Err(ParseError::InvalidField {
                field: "file_directory",
                reason: "unexpected attribute size",
            });
        }
        Ok(Self {
            items_in_directory: read_le_u64(bytes, offset + 4)?,
            space_available_in_last_block: read_le_u16(bytes, offset + 12)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FILE_DIRECTORY_ATTR_SIZE] {
        let mut out = [0_u8; FILE_DIRECTORY_ATTR_SIZE];
        out[0..2].copy_from_slice(&ATTRIBUTE_FILE_DIRECTORY.to_le_bytes());
        out[2..4].copy_from_slice(&(FILE_DIRECTORY_ATTR_SIZE as u16).to_le_bytes());
        out[4..12].copy_from_slice(&self.items_in_directory.to_le_bytes());
        out[12..14].copy_from_slice(&self.space_available_in_last_block.to_le_bytes());
        out
    }
}

// ── File entries ────────────────────────────────────────────────────────────

/// One attribute of a file entry. Attributes the core does not interpret
/// are preserved verbatim so a rewrite never drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAttribute {
    Data(FileDataAttr),
    Directory(FileDirectoryAttr),
    Other { attr_type: u16, raw: Vec<u8> },
}

impl FileAttribute {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Data(_) => FILE_DATA_ATTR_SIZE,
            Self::Directory(_) => FILE_DIRECTORY_ATTR_SIZE,
            Self::Other { raw, .. } => raw.len(),
        }
    }
}

/// An in-memory file entry: fixed header plus attribute list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub identifier: UniqueIdentifier,
    pub file_type: FileType,
    pub creation_time: u64,
    pub modification_time: u64,
    pub attributes: Vec<FileAttribute>,
}

impl FileEntry {
    /// Build a fresh entry with an empty DIRECT data stream; directories
    /// also get an empty `FILE_DIRECTORY` attribute.
    #[must_use]
    pub fn new(identifier: UniqueIdentifier, file_type: FileType, timestamp: u64) -> Self {
        let mut attributes = vec![FileAttribute::Data(FileDataAttr::new_direct())];
        if file_type == FileType::Directory {
            attributes.push(FileAttribute::Directory(FileDirectoryAttr::default()));
        }
        Self {
            identifier,
            file_type,
            creation_time: timestamp,
            modification_time: timestamp,
            attributes,
        }
    }

    /// Parse an entry; returns the entry and its total encoded length
    /// (through the `LIST_END` terminator).
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), ParseError> {
        let signature = ensure_slice(bytes, 0, 8)?;
        if signature != FILE_ENTRY_SIGNATURE {
            return Err(ParseError::InvalidSignature { what: "file entry" });
        }

        let identifier = UniqueIdentifier::from_bytes(read_fixed::<16>(bytes, 8)?);
        let file_type = FileType::from_raw(ensure_slice(bytes, 24, 1)?[0])?;
        let creation_time = read_le_u64(bytes, 25)?;
        let modification_time = read_le_u64(bytes, 33)?;

        let mut attributes = Vec::new();
        let mut pos = FILE_ENTRY_HEADER_SIZE;
        let total = loop {
            let attr_type = read_le_u16(bytes, pos)?;
            if attr_type == ATTRIBUTE_LIST_END {
                break pos + LIST_END_SIZE;
            }
            let attr_size = usize::from(read_le_u16(bytes, pos + 2)?);
            if attr_size < ATTRIBUTE_HEADER_SIZE {
                return Err(ParseError::InvalidField {
                    field: "attribute_size",
                    reason: "smaller than its header",
                });
            }
            let attribute = match attr_type {
                ATTRIBUTE_FILE_DATA => FileAttribute::Data(FileDataAttr::decode(bytes, pos)?),
                ATTRIBUTE_FILE_DIRECTORY => {
                    FileAttribute::Directory(FileDirectoryAttr::decode(bytes, pos)?)
                }
                _ => FileAttribute::Other {
                    attr_type,
                    raw: ensure_slice(bytes, pos, attr_size)?.to_vec(),
                },
            };
            attributes.push(attribute);
            pos += attr_size;
        };

        Ok((
            Self {
                identifier,
                file_type,
                creation_time,
                modification_time,
                attributes,
            },
            total,
        ))
    }

    /// Total encoded length, including the `LIST_END` terminator.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FILE_ENTRY_HEADER_SIZE
            + self
                .attributes
                .iter()
                .map(FileAttribute::encoded_len)
                .sum::<usize>()
            + LIST_END_SIZE
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(FILE_ENTRY_SIGNATURE);
        out.extend_from_slice(self.identifier.as_bytes());
        out.push(self.file_type.to_raw());
        out.extend_from_slice(&self.creation_time.to_le_bytes());
        out.extend_from_slice(&self.modification_time.to_le_bytes());
        for attribute in &self.attributes {
            match attribute {
                FileAttribute::Data(data) => out.extend_from_slice(&data.encode()),
                FileAttribute::Directory(dir) => out.extend_from_slice(&dir.encode()),
                FileAttribute::Other { raw, .. } => out.extend_from_slice(raw),
            }
        }
        out.extend_from_slice(&ATTRIBUTE_LIST_END.to_le_bytes());
        out.extend_from_slice(&(LIST_END_SIZE as u16).to_le_bytes());
        out
    }

    #[must_use]
    pub fn data(&self) -> Option<&FileDataAttr> {
        self.attributes.iter().find_map(|attr| match attr {
            FileAttribute::Data(data) => Some(data),
            _ => None,
        })
    }

    pub fn data_mut(&mut self) -> Option<&mut FileDataAttr> {
        self.attributes.iter_mut().find_map(|attr| match attr {
            FileAttribute::Data(data) => Some(data),
            _ => None,
        })
    }

    #[must_use]
    pub fn directory(&self) -> Option<&FileDirectoryAttr> {
        self.attributes.iter().find_map(|attr| match attr {
            FileAttribute::Directory(dir) => Some(dir),
            _ => None,
        })
    }

    pub fn directory_mut(&mut self) -> Option<&mut FileDirectoryAttr> {
        self.attributes.iter_mut().find_map(|attr| match attr {
            FileAttribute::Directory(dir) => Some(dir),
            _ => None,
        })
    }

    /// Both stream and directory attributes, mutably, in one pass.
    pub fn data_and_directory_mut(
        &mut self,
    ) -> (Option<&mut FileDataAttr>, Option<&mut FileDirectoryAttr>) {
        let mut data = None;
        let mut directory = None;
        for attribute in &mut self.attributes {
            match attribute {
                FileAttribute::Data(d) if data.is_none() => data = Some(d),
                FileAttribute::Directory(dir) if directory.is_none() => directory = Some(dir),
                _ => {}
            }
        }
        (data, directory)
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// A parsed directory entry, with the offsets needed to bind an open
/// node back to its on-disk location.
#[derive(Debug, Clone)]
pub struct DirectoryEntryInfo {
    pub name: Vec<u8>,
    pub file_entry: FileEntry,
    /// Offset of the embedded file entry from the start of this entry.
    pub file_entry_offset: usize,
    /// Length recorded in the `DIRECTORY_FILE` attribute header.
    pub file_entry_length: usize,
    /// Total entry length through the outer `LIST_END`.
    pub total_length: usize,
}

/// Parse the directory entry starting at `bytes[0]`.
pub fn parse_directory_entry(bytes: &[u8]) -> Result<DirectoryEntryInfo, ParseError> {
    let signature = ensure_slice(bytes, 0, DIRECTORY_ENTRY_HEADER_SIZE)?;
    if signature != DIRECTORY_ENTRY_SIGNATURE {
        return Err(ParseError::InvalidSignature {
            what: "directory entry",
        });
    }

    let mut name = None;
    let mut file_entry = None;
    let mut pos = DIRECTORY_ENTRY_HEADER_SIZE;
    let total_length = loop {
        let attr_type = read_le_u16(bytes, pos)?;
        if attr_type == ATTRIBUTE_LIST_END {
            break pos + LIST_END_SIZE;
        }
        let attr_size = usize::from(read_le_u16(bytes, pos + 2)?);
        if attr_size < ATTRIBUTE_HEADER_SIZE {
            return Err(ParseError::InvalidField {
                field: "attribute_size",
                reason: "smaller than its header",
            });
        }
        match attr_type {
            ATTRIBUTE_DIRECTORY_NAME => {
                let name_length = usize::from(ensure_slice(bytes, pos + 4, 1)?[0]);
                if DIRECTORY_NAME_ATTR_BASE_SIZE + name_length > attr_size {
                    return Err(ParseError::InvalidField {
                        field: "name_length",
                        reason: "name exceeds its attribute",
                    });
                }
                name = Some(
                    ensure_slice(bytes, pos + DIRECTORY_NAME_ATTR_BASE_SIZE, name_length)?
                        .to_vec(),
                );
            }
            ATTRIBUTE_DIRECTORY_FILE => {
                let entry_offset = pos + ATTRIBUTE_HEADER_SIZE;
                let entry_length = attr_size - ATTRIBUTE_HEADER_SIZE;
                let raw = ensure_slice(bytes, entry_offset, entry_length)?;
                let (entry, _) = FileEntry::parse(raw)?;
                file_entry = Some((entry, entry_offset, entry_length));
            }
            _ => {}
        }
        pos += attr_size;
    };

    let name = name.ok_or(ParseError::InvalidField {
        field: "directory_entry",
        reason: "missing name attribute",
    })?;
    let (file_entry, file_entry_offset, file_entry_length) =
        file_entry.ok_or(ParseError::InvalidField {
            field: "directory_entry",
            reason: "missing file attribute",
        })?;

    Ok(DirectoryEntryInfo {
        name,
        file_entry,
        file_entry_offset,
        file_entry_length,
        total_length,
    })
}

/// Length of the directory entry starting at `bytes[0]`, found by walking
/// its attribute list to `LIST_END`.
pub fn directory_entry_total_length(bytes: &[u8]) -> Result<usize, ParseError> {
    let signature = ensure_slice(bytes, 0, DIRECTORY_ENTRY_HEADER_SIZE)?;
    if signature != DIRECTORY_ENTRY_SIGNATURE {
        return Err(ParseError::InvalidSignature {
            what: "directory entry",
        });
    }
    let mut pos = DIRECTORY_ENTRY_HEADER_SIZE;
    loop {
        let attr_type = read_le_u16(bytes, pos)?;
        if attr_type == ATTRIBUTE_LIST_END {
            return Ok(pos + LIST_END_SIZE);
        }
        let attr_size = usize::from(read_le_u16(bytes, pos + 2)?);
        if attr_size < ATTRIBUTE_HEADER_SIZE {
            return Err(ParseError::InvalidField {
                field: "attribute_size",
                reason: "smaller than its header",
            });
        }
        pos += attr_size;
    }
}

/// Serialize a directory entry wrapping `entry` under `name`.
pub fn encode_directory_entry(name: &[u8], entry: &FileEntry) -> Result<Vec<u8>, ParseError> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "longer than 255 bytes",
        });
    }

    let entry_bytes = entry.encode();
    let name_attr_size = DIRECTORY_NAME_ATTR_BASE_SIZE + name.len();
    let file_attr_size = ATTRIBUTE_HEADER_SIZE + entry_bytes.len();

    let mut out = Vec::with_capacity(
        DIRECTORY_ENTRY_HEADER_SIZE + name_attr_size + file_attr_size + LIST_END_SIZE,
    );
    out.extend_from_slice(DIRECTORY_ENTRY_SIGNATURE);

    out.extend_from_slice(&ATTRIBUTE_DIRECTORY_NAME.to_le_bytes());
    out.extend_from_slice(&(name_attr_size as u16).to_le_bytes());
    out.push(name.len() as u8);
    out.extend_from_slice(name);

    out.extend_from_slice(&ATTRIBUTE_DIRECTORY_FILE.to_le_bytes());
    out.extend_from_slice(
        &u16::try_from(file_attr_size)
            .map_err(|_| ParseError::IntegerConversion {
                field: "file_attr_size",
            })?
            .to_le_bytes(),
    );
    out.extend_from_slice(&entry_bytes);

    out.extend_from_slice(&ATTRIBUTE_LIST_END.to_le_bytes());
    out.extend_from_slice(&(LIST_END_SIZE as u16).to_le_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_entry_round_trip() {
        let entry = FileEntry::new(
            UniqueIdentifier::from_bytes([3; 16]),
            FileType::File,
            1234,
        );
        let raw = entry.encode();
        assert_eq!(raw.len(), entry.encoded_len());
        // Header + data attribute + terminator.
        assert_eq!(
            raw.len(),
            FILE_ENTRY_HEADER_SIZE + FILE_DATA_ATTR_SIZE + LIST_END_SIZE
        );

        let (parsed, total) = FileEntry::parse(&raw).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(total, raw.len());
        assert_eq!(parsed.data().unwrap().indirection(), Indirection::Direct);
        assert!(parsed.directory().is_none());
    }

    #[test]
    fn directory_file_entry_has_directory_attribute() {
        let entry = FileEntry::new(
            UniqueIdentifier::from_bytes([9; 16]),
            FileType::Directory,
            0,
        );
        let raw = entry.encode();
        assert_eq!(
            raw.len(),
            FILE_ENTRY_HEADER_SIZE
                + FILE_DATA_ATTR_SIZE
                + FILE_DIRECTORY_ATTR_SIZE
                + LIST_END_SIZE
        );
        let (parsed, _) = FileEntry::parse(&raw).unwrap();
        assert_eq!(parsed.directory().unwrap().items_in_directory, 0);
    }

    #[test]
    fn unknown_attribute_preserved_verbatim() {
        let mut entry = FileEntry::new(
            UniqueIdentifier::from_bytes([1; 16]),
            FileType::File,
            0,
        );
        // A 24-byte security attribute, as the original format tool wrote.
        let mut raw_attr = vec![0_u8; 24];
        raw_attr[0..2].copy_from_slice(&1_u16.to_le_bytes());
        raw_attr[2..4].copy_from_slice(&24_u16.to_le_bytes());
        entry.attributes.insert(
            0,
            FileAttribute::Other {
                attr_type: 1,
                raw: raw_attr.clone(),
            },
        );

        let encoded = entry.encode();
        let (parsed, _) = FileEntry::parse(&encoded).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.encode(), encoded);
    }

    #[test]
    fn file_entry_rejects_bad_signature() {
        let mut raw = FileEntry::new(UniqueIdentifier::ZERO, FileType::File, 0).encode();
        raw[0] = b'X';
        assert!(matches!(
            FileEntry::parse(&raw),
            Err(ParseError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn data_attr_payload_round_trips() {
        let mut attr = FileDataAttr::new_direct();
        attr.size = 5;
        if let DataPayload::Direct(bytes) = &mut attr.payload {
            bytes[..5].copy_from_slice(b"hello");
        }
        let raw = attr.encode();
        assert_eq!(FileDataAttr::decode(&raw, 0).unwrap(), attr);

        let indirect = FileDataAttr {
            stream: STREAM_DEFAULT,
            extent_count: 2,
            size: 1024,
            payload: DataPayload::Indirect([
                GlobalExtent {
                    offset: 50,
                    count: 1,
                },
                GlobalExtent {
                    offset: 70,
                    count: 1,
                },
                GlobalExtent::ZERO,
                GlobalExtent::ZERO,
            ]),
        };
        let raw = indirect.encode();
        assert_eq!(FileDataAttr::decode(&raw, 0).unwrap(), indirect);

        let indirect2 = FileDataAttr {
            stream: STREAM_DEFAULT,
            extent_count: 5,
            size: 9999,
            payload: DataPayload::Indirect2([42, 0, 0, 0, 0, 0, 0, 0]),
        };
        let raw = indirect2.encode();
        assert_eq!(FileDataAttr::decode(&raw, 0).unwrap(), indirect2);
    }

    #[test]
    fn data_attr_rejects_indirect_3() {
        let mut raw = FileDataAttr::new_direct().encode();
        raw[5] = 3;
        assert!(FileDataAttr::decode(&raw, 0).is_err());
    }

    #[test]
    fn directory_entry_round_trip() {
        let child = FileEntry::new(
            UniqueIdentifier::from_bytes([5; 16]),
            FileType::File,
            77,
        );
        let raw = encode_directory_entry(b"hello.txt", &child).unwrap();

        let info = parse_directory_entry(&raw).unwrap();
        assert_eq!(info.name, b"hello.txt");
        assert_eq!(info.file_entry, child);
        assert_eq!(info.total_length, raw.len());
        assert_eq!(directory_entry_total_length(&raw).unwrap(), raw.len());
        // The embedded entry sits after the header, name attribute, and
        // file attribute header.
        assert_eq!(
            info.file_entry_offset,
            DIRECTORY_ENTRY_HEADER_SIZE
                + DIRECTORY_NAME_ATTR_BASE_SIZE
                + 9
                + ATTRIBUTE_HEADER_SIZE
        );
        assert_eq!(info.file_entry_length, child.encoded_len());
    }

    #[test]
    fn directory_entry_rejects_long_name() {
        let child = FileEntry::new(UniqueIdentifier::ZERO, FileType::File, 0);
        let name = vec![b'a'; 256];
        assert!(encode_directory_entry(&name, &child).is_err());
        assert!(encode_directory_entry(&name[..255], &child).is_ok());
    }

    #[test]
    fn directory_entry_rejects_bad_signature() {
        let child = FileEntry::new(UniqueIdentifier::ZERO, FileType::File, 0);
        let mut raw = encode_directory_entry(b"f", &child).unwrap();
        raw[0] = b'!';
        assert!(parse_directory_entry(&raw).is_err());
        assert!(directory_entry_total_length(&raw).is_err());
    }
}
