//! Shared table layouts: written by the session, read by the detours layer.
//!
//! Both tables are flat append-only arenas. Every record is:
//!
//! ```text
//! 7bit   storage size      (bytes that follow, key included)
//! 16     StringKey
//! ...    payload
//! ```
//!
//! Directory payload (the record's `TableOffset` points at its first byte):
//!
//! ```text
//! 7bit   prev table offset (TableOffset::INVALID for a first version)
//! 7bit   attributes        \
//! 7bit   volume serial      > first versions only
//! u64    file index        /
//! 7bit   item count
//! item*  String name, 7bit attributes, 7bit volume serial, u64 file index,
//!        and for non-directories u64 last write time, 7bit size
//! ```
//!
//! File-mapping payload: `String name, 7bit size`.

use crate::binary::{get_7bit_encoded_count, get_string_write_size, BinaryReader, BinaryWriter};
use crate::keys::StringKey;
use crate::win32::FILE_ATTRIBUTE_DIRECTORY;
use std::fmt;

pub const DIRECTORY_TABLE_FILE: &str = "directory_table.bin";
pub const FILE_MAPPING_TABLE_FILE: &str = "file_mapping_table.bin";
pub const MAPPING_FILE_PREFIX: &str = "uba-map-";

/// Default arena capacities. Files are sparse so the size is only reserved.
pub const DEFAULT_DIRECTORY_TABLE_CAPACITY: u64 = 64 * 1024 * 1024;
pub const DEFAULT_FILE_TABLE_CAPACITY: u64 = 16 * 1024 * 1024;

/// Size of a file that has not been resolved yet.
pub const INVALID_SIZE: u64 = u64::MAX;

pub const EMPTY_DIRECTORY_NAME: &str = "$d";
pub const EMPTY_FILE_NAME: &str = "$f";
pub const ORIGINAL_NAME: &str = "#";

/// Byte offset into a shared table arena.
///
/// Kept apart from pointers so an offset read out of one mapping is never
/// dereferenced as an address in another.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableOffset(pub u32);

impl TableOffset {
    pub const INVALID: TableOffset = TableOffset(u32::MAX);
    /// Marks an offset that refers to a directory's own version chain.
    pub const DIRECTORY_TAG: u32 = 0x8000_0000;

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn tagged(self) -> TableOffset {
        TableOffset(self.0 | Self::DIRECTORY_TAG)
    }

    pub fn is_tagged(self) -> bool {
        self.is_valid() && self.0 & Self::DIRECTORY_TAG != 0
    }

    pub fn untagged(self) -> TableOffset {
        TableOffset(self.0 & !Self::DIRECTORY_TAG)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TableOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "TableOffset({:#x})", self.0)
        } else {
            f.write_str("TableOffset(INVALID)")
        }
    }
}

/// Identifies a shared memory file in the shm directory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct MappingHandle(pub u64);

impl MappingHandle {
    pub const NONE: MappingHandle = MappingHandle(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn file_name(self) -> String {
        format!("{}{:x}", MAPPING_FILE_PREFIX, self.0)
    }
}

impl fmt::Display for MappingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Meaning of a name stored in the file-mapping table or returned by
/// `CreateFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedName<'a> {
    /// Empty name: deleted or not found.
    Missing,
    EmptyDirectory,
    EmptyFile,
    /// Content lives in a session mapping at `offset`.
    Mapping { handle: MappingHandle, offset: u64 },
    /// File written into shared memory by another process.
    SharedFile { handle: MappingHandle },
    /// Use the name the process asked for.
    Original,
    /// Real file on disk, possibly under a different name.
    Path(&'a str),
}

impl<'a> MappedName<'a> {
    pub fn parse(name: &'a str) -> MappedName<'a> {
        if name.is_empty() {
            return MappedName::Missing;
        }
        match name {
            EMPTY_DIRECTORY_NAME => return MappedName::EmptyDirectory,
            EMPTY_FILE_NAME => return MappedName::EmptyFile,
            ORIGINAL_NAME => return MappedName::Original,
            _ => {}
        }
        if let Some(rest) = name.strip_prefix('^') {
            if let Some((handle, offset)) = parse_handle_pair(rest) {
                return MappedName::Mapping { handle, offset };
            }
        }
        if let Some(rest) = name.strip_prefix(':') {
            if let Some((handle, _)) = parse_handle_pair(rest) {
                return MappedName::SharedFile { handle };
            }
        }
        MappedName::Path(name)
    }

    pub fn mapping(handle: MappingHandle, offset: u64) -> String {
        format!("^{:x}-{:x}", handle.0, offset)
    }

    pub fn shared_file(handle: MappingHandle) -> String {
        format!(":{:x}-0", handle.0)
    }
}

fn parse_handle_pair(s: &str) -> Option<(MappingHandle, u64)> {
    let (handle, offset) = s.split_once('-')?;
    let handle = u64::from_str_radix(handle, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;
    Some((MappingHandle(handle), offset))
}

/// The leading character that classifies a mapped name. Entries are remapped
/// when this changes.
pub fn name_sentinel(name: &str) -> Option<char> {
    match name.chars().next() {
        Some(c @ ('^' | ':' | '$' | '#')) => Some(c),
        Some(_) => Some('/'),
        None => None,
    }
}

/// Attributes of a directory itself, carried by first versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryInfo {
    pub attributes: u32,
    pub volume_serial: u32,
    pub file_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryItem {
    pub name: String,
    /// Zero marks a deleted entry.
    pub attributes: u32,
    pub volume_serial: u32,
    pub file_index: u64,
    pub last_write_time: u64,
    pub size: u64,
}

impl DirectoryItem {
    pub fn tombstone(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    pub fn write_size(&self) -> usize {
        let mut size = get_string_write_size(&self.name)
            + get_7bit_encoded_count(self.attributes as u64)
            + get_7bit_encoded_count(self.volume_serial as u64)
            + 8;
        if !self.is_directory() {
            size += 8 + get_7bit_encoded_count(self.size);
        }
        size
    }

    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_string(&self.name);
        writer.write_7bit_encoded(self.attributes as u64);
        writer.write_7bit_encoded(self.volume_serial as u64);
        writer.write_u64(self.file_index);
        if !self.is_directory() {
            writer.write_u64(self.last_write_time);
            writer.write_7bit_encoded(self.size);
        }
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        let name = reader.read_string();
        let attributes = reader.read_7bit_encoded() as u32;
        let volume_serial = reader.read_7bit_encoded() as u32;
        let file_index = reader.read_u64();
        let mut item = Self {
            name,
            attributes,
            volume_serial,
            file_index,
            last_write_time: 0,
            size: 0,
        };
        if !item.is_directory() {
            item.last_write_time = reader.read_u64();
            item.size = reader.read_7bit_encoded();
        }
        item
    }
}

/// One version of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryVersion {
    pub prev: TableOffset,
    /// Present only on first versions (`prev == INVALID`).
    pub info: Option<DirectoryInfo>,
    pub items: Vec<DirectoryItem>,
}

impl DirectoryVersion {
    pub fn first(info: DirectoryInfo, items: Vec<DirectoryItem>) -> Self {
        Self {
            prev: TableOffset::INVALID,
            info: Some(info),
            items,
        }
    }

    pub fn refresh(prev: TableOffset, items: Vec<DirectoryItem>) -> Self {
        Self {
            prev,
            info: None,
            items,
        }
    }

    fn payload_size(&self) -> usize {
        let mut size = get_7bit_encoded_count(self.prev.0 as u64);
        if let Some(info) = &self.info {
            size += get_7bit_encoded_count(info.attributes as u64)
                + get_7bit_encoded_count(info.volume_serial as u64)
                + 8;
        }
        size += get_7bit_encoded_count(self.items.len() as u64);
        size + self.items.iter().map(DirectoryItem::write_size).sum::<usize>()
    }
}

/// Header fields of a directory version, read at its table offset.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryVersionHeader {
    pub prev: TableOffset,
    pub info: Option<DirectoryInfo>,
    pub item_count: usize,
}

impl DirectoryVersionHeader {
    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        let prev = TableOffset(reader.read_7bit_encoded() as u32);
        let info = if prev.is_valid() {
            None
        } else {
            Some(DirectoryInfo {
                attributes: reader.read_7bit_encoded() as u32,
                volume_serial: reader.read_7bit_encoded() as u32,
                file_index: reader.read_u64(),
            })
        };
        let item_count = reader.read_7bit_encoded() as usize;
        Self {
            prev,
            info,
            item_count,
        }
    }
}

/// Encoded record plus the position of its table offset inside it.
pub struct EncodedRecord {
    pub bytes: Vec<u8>,
    pub payload_offset: usize,
}

fn encode_record(key: StringKey, payload_size: usize, write: impl FnOnce(&mut BinaryWriter<'_>)) -> EncodedRecord {
    let storage_size = 16 + payload_size;
    let prefix = get_7bit_encoded_count(storage_size as u64);
    let mut bytes = vec![0u8; prefix + storage_size];
    let mut writer = BinaryWriter::new(&mut bytes);
    writer.write_7bit_encoded(storage_size as u64);
    writer.write_string_key(key);
    let payload_offset = writer.position();
    write(&mut writer);
    debug_assert_eq!(writer.remaining(), 0);
    EncodedRecord {
        bytes,
        payload_offset,
    }
}

pub fn encode_directory_record(key: StringKey, version: &DirectoryVersion) -> EncodedRecord {
    encode_record(key, version.payload_size(), |writer| {
        writer.write_7bit_encoded(version.prev.0 as u64);
        if let Some(info) = &version.info {
            writer.write_7bit_encoded(info.attributes as u64);
            writer.write_7bit_encoded(info.volume_serial as u64);
            writer.write_u64(info.file_index);
        }
        writer.write_7bit_encoded(version.items.len() as u64);
        for item in &version.items {
            item.write(writer);
        }
    })
}

pub fn encode_file_mapping_record(key: StringKey, name: &str, size: u64) -> EncodedRecord {
    let payload = get_string_write_size(name) + get_7bit_encoded_count(size);
    encode_record(key, payload, |writer| {
        writer.write_string(name);
        writer.write_7bit_encoded(size);
    })
}

/// Storage-size prefix and key of the record at the reader's position.
/// Returns `None` when the buffer does not yet hold the whole record.
pub fn try_read_record_header(reader: &mut BinaryReader<'_>) -> Option<(StringKey, usize)> {
    let start = reader.position();
    let storage_size = reader.try_read_7bit_encoded()? as usize;
    if storage_size < 16 || reader.left() < storage_size {
        reader.set_position(start);
        return None;
    }
    let key = reader.read_string_key();
    Some((key, storage_size - 16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::to_string_key;
    use crate::win32::FILE_ATTRIBUTE_NORMAL;

    #[test]
    fn test_table_offset_tagging() {
        let offset = TableOffset(0x1234);
        assert!(!offset.is_tagged());
        assert!(offset.tagged().is_tagged());
        assert_eq!(offset.tagged().untagged(), offset);
        assert!(!TableOffset::INVALID.is_tagged());
    }

    #[test]
    fn test_mapped_name_parse() {
        assert_eq!(MappedName::parse(""), MappedName::Missing);
        assert_eq!(MappedName::parse("$d"), MappedName::EmptyDirectory);
        assert_eq!(MappedName::parse("#"), MappedName::Original);
        assert_eq!(
            MappedName::parse(&MappedName::mapping(MappingHandle(0xab), 0x40)),
            MappedName::Mapping {
                handle: MappingHandle(0xab),
                offset: 0x40
            }
        );
        assert_eq!(
            MappedName::parse(&MappedName::shared_file(MappingHandle(7))),
            MappedName::SharedFile {
                handle: MappingHandle(7)
            }
        );
        assert_eq!(MappedName::parse("^zz"), MappedName::Path("^zz"));
        assert_eq!(MappedName::parse("C:\\out\\a.obj"), MappedName::Path("C:\\out\\a.obj"));
    }

    #[test]
    fn test_name_sentinel() {
        assert_eq!(name_sentinel("^1-0"), Some('^'));
        assert_eq!(name_sentinel("c:\\x"), Some('/'));
        assert_eq!(name_sentinel("/x"), Some('/'));
        assert_eq!(name_sentinel(""), None);
    }

    #[test]
    fn test_directory_record_layout() {
        let key = to_string_key("c:\\proj");
        let version = DirectoryVersion::first(
            DirectoryInfo {
                attributes: FILE_ATTRIBUTE_DIRECTORY,
                volume_serial: 3,
                file_index: 99,
            },
            vec![
                DirectoryItem {
                    name: "a.cpp".into(),
                    attributes: FILE_ATTRIBUTE_NORMAL,
                    volume_serial: 3,
                    file_index: 100,
                    last_write_time: 5,
                    size: 1234,
                },
                DirectoryItem {
                    name: "src".into(),
                    attributes: FILE_ATTRIBUTE_DIRECTORY,
                    volume_serial: 3,
                    file_index: 101,
                    ..Default::default()
                },
            ],
        );
        let record = encode_directory_record(key, &version);

        let mut reader = BinaryReader::new(&record.bytes);
        let (read_key, payload) = try_read_record_header(&mut reader).unwrap();
        assert_eq!(read_key, key);
        assert_eq!(reader.position(), record.payload_offset);
        assert_eq!(reader.left(), payload);

        let header = DirectoryVersionHeader::read(&mut reader);
        assert_eq!(header.prev, TableOffset::INVALID);
        assert_eq!(header.info.unwrap().file_index, 99);
        assert_eq!(header.item_count, 2);
        assert_eq!(DirectoryItem::read(&mut reader), version.items[0]);
        assert_eq!(DirectoryItem::read(&mut reader), version.items[1]);
        assert_eq!(reader.left(), 0);
    }

    #[test]
    fn test_refresh_version_has_no_info() {
        let record = encode_directory_record(
            to_string_key("c:\\proj"),
            &DirectoryVersion::refresh(TableOffset(17), vec![DirectoryItem::tombstone("gone.h")]),
        );
        let mut reader = BinaryReader::at(&record.bytes, record.payload_offset);
        let header = DirectoryVersionHeader::read(&mut reader);
        assert_eq!(header.prev, TableOffset(17));
        assert!(header.info.is_none());
        let item = DirectoryItem::read(&mut reader);
        assert_eq!(item.attributes, 0);
        assert_eq!(item.name, "gone.h");
    }

    #[test]
    fn test_partial_record_header() {
        let record = encode_file_mapping_record(to_string_key("c:\\a.obj"), "^1-0", 10);
        let mut reader = BinaryReader::new(&record.bytes[..record.bytes.len() - 1]);
        assert!(try_read_record_header(&mut reader).is_none());
        assert_eq!(reader.position(), 0);
    }
}
