//! Writer side of the shared directory table.
//!
//! Every directory gets a first version when it is first listed. Later
//! changes are appended as refresh versions chained to the previous one, so
//! readers replay them oldest to newest. Removing a directory appends a new
//! first version with attributes 0.

use crate::shared_table::SharedTable;
use crate::SessionError;
use std::collections::HashMap;
use tracing::debug;
use uba_ipc::table_types::{encode_directory_record, DirectoryInfo, DirectoryItem, DirectoryVersion};
use uba_ipc::{to_string_key, StringKey, TableOffset};

pub struct DirectoryTableWriter {
    table: SharedTable,
    /// Latest version of every directory written so far.
    directories: HashMap<StringKey, TableOffset>,
    record_count: usize,
}

impl DirectoryTableWriter {
    pub fn new(table: SharedTable) -> Self {
        Self {
            table,
            directories: HashMap::new(),
            record_count: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.table.size()
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn directory_offset(&self, dir_key: &StringKey) -> Option<TableOffset> {
        self.directories.get(dir_key).copied()
    }

    /// Write the full listing of `dir_path` as a first version.
    pub fn write_directory(
        &mut self,
        dir_path: &str,
        info: DirectoryInfo,
        items: Vec<DirectoryItem>,
    ) -> Result<TableOffset, SessionError> {
        let key = to_string_key(dir_path);
        let count = items.len();
        let offset = self.append(key, &DirectoryVersion::first(info, items))?;
        debug!(dir = dir_path, offset = offset.0, items = count, "Wrote directory listing");
        Ok(offset)
    }

    /// Append changed entries to a directory that has already been written.
    /// Directories nobody has listed yet are left alone; their first listing
    /// will include the change.
    pub fn append_items(
        &mut self,
        dir_path: &str,
        items: Vec<DirectoryItem>,
    ) -> Result<Option<TableOffset>, SessionError> {
        let key = to_string_key(dir_path);
        let Some(prev) = self.directories.get(&key).copied() else {
            return Ok(None);
        };
        let offset = self.append(key, &DirectoryVersion::refresh(prev, items))?;
        debug!(dir = dir_path, offset = offset.0, prev = prev.0, "Appended directory version");
        Ok(Some(offset))
    }

    /// Mark a written directory as gone.
    pub fn remove_directory(&mut self, dir_path: &str) -> Result<Option<TableOffset>, SessionError> {
        let key = to_string_key(dir_path);
        if !self.directories.contains_key(&key) {
            return Ok(None);
        }
        let offset = self.append(key, &DirectoryVersion::first(DirectoryInfo::default(), Vec::new()))?;
        debug!(dir = dir_path, offset = offset.0, "Wrote directory tombstone");
        Ok(Some(offset))
    }

    fn append(&mut self, key: StringKey, version: &DirectoryVersion) -> Result<TableOffset, SessionError> {
        let record = encode_directory_record(key, version);
        let start = self.table.append(&record.bytes)?;
        let offset = TableOffset(start.0 + record.payload_offset as u32);
        self.directories.insert(key, offset);
        self.record_count += 1;
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uba_ipc::table_types::DirectoryVersionHeader;
    use uba_ipc::win32::{FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL};
    use uba_ipc::BinaryReader;

    fn writer(dir: &std::path::Path) -> DirectoryTableWriter {
        DirectoryTableWriter::new(SharedTable::create(&dir.join("dirs.bin"), 1 << 20, "directory").unwrap())
    }

    fn file(name: &str, size: u64) -> DirectoryItem {
        DirectoryItem {
            name: name.into(),
            attributes: FILE_ATTRIBUTE_NORMAL,
            volume_serial: 1,
            file_index: 7,
            last_write_time: 1,
            size,
        }
    }

    #[test]
    fn test_refresh_chains_to_previous_version() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        let dir_info = DirectoryInfo {
            attributes: FILE_ATTRIBUTE_DIRECTORY,
            volume_serial: 1,
            file_index: 2,
        };
        let first = w.write_directory("C:\\proj", dir_info, vec![file("a.h", 1)]).unwrap();
        let second = w.append_items("c:/PROJ", vec![file("b.h", 2)]).unwrap().unwrap();
        assert!(second.0 > first.0);
        assert_eq!(w.directory_offset(&to_string_key("C:\\proj")), Some(second));

        let mut reader = BinaryReader::at(w.table.bytes(), second.as_usize());
        let header = DirectoryVersionHeader::read(&mut reader);
        assert_eq!(header.prev, first);
        assert!(header.info.is_none());
        assert_eq!(header.item_count, 1);
    }

    #[test]
    fn test_append_to_unlisted_directory_is_noop() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        assert_eq!(w.append_items("C:\\other", vec![file("x", 1)]).unwrap(), None);
        assert_eq!(w.size(), 0);
    }

    #[test]
    fn test_remove_directory_writes_zero_attributes() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        w.write_directory("C:\\gone", DirectoryInfo { attributes: FILE_ATTRIBUTE_DIRECTORY, ..Default::default() }, vec![])
            .unwrap();
        let offset = w.remove_directory("C:\\gone").unwrap().unwrap();
        let mut reader = BinaryReader::at(w.table.bytes(), offset.as_usize());
        let header = DirectoryVersionHeader::read(&mut reader);
        assert_eq!(header.prev, TableOffset::INVALID);
        assert_eq!(header.info.unwrap().attributes, 0);
        assert_eq!(w.record_count(), 2);
    }
}
