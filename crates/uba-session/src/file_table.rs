//! Writer side of the shared file-mapping table.

use crate::shared_table::SharedTable;
use crate::SessionError;
use std::collections::HashMap;
use tracing::debug;
use uba_ipc::table_types::encode_file_mapping_record;
use uba_ipc::StringKey;

pub struct FileMappingTableWriter {
    table: SharedTable,
    /// Last (name, size) written per key, to skip redundant records.
    entries: HashMap<StringKey, (String, u64)>,
}

impl FileMappingTableWriter {
    pub fn new(table: SharedTable) -> Self {
        Self {
            table,
            entries: HashMap::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.table.size()
    }

    pub fn contains(&self, key: &StringKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &StringKey) -> Option<(&str, u64)> {
        self.entries.get(key).map(|(name, size)| (name.as_str(), *size))
    }

    /// Write an entry unless the table already holds the same name and size.
    /// Returns true when a record was appended.
    pub fn add(&mut self, key: StringKey, name: &str, size: u64) -> Result<bool, SessionError> {
        if let Some((old_name, old_size)) = self.entries.get(&key) {
            if old_name == name && *old_size == size {
                return Ok(false);
            }
        }
        let record = encode_file_mapping_record(key, name, size);
        self.table.append(&record.bytes)?;
        self.entries.insert(key, (name.to_string(), size));
        debug!(key = %key, name, size, "Wrote file mapping entry");
        Ok(true)
    }

    /// Publish a deletion: an empty name.
    pub fn mark_deleted(&mut self, key: StringKey) -> Result<bool, SessionError> {
        if !self.entries.contains_key(&key) {
            return Ok(false);
        }
        self.add(key, "", 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uba_ipc::to_string_key;

    #[test]
    fn test_duplicate_entries_are_skipped() {
        let temp = tempdir().unwrap();
        let table = SharedTable::create(&temp.path().join("files.bin"), 4096, "file").unwrap();
        let mut w = FileMappingTableWriter::new(table);
        let key = to_string_key("C:\\out\\a.obj");

        assert!(w.add(key, "^1-0", 10).unwrap());
        let size = w.size();
        assert!(!w.add(key, "^1-0", 10).unwrap());
        assert_eq!(w.size(), size);
        assert!(w.add(key, "^1-0", 20).unwrap());
        assert!(w.size() > size);
    }

    #[test]
    fn test_mark_deleted_only_known_keys() {
        let temp = tempdir().unwrap();
        let table = SharedTable::create(&temp.path().join("files.bin"), 4096, "file").unwrap();
        let mut w = FileMappingTableWriter::new(table);
        let key = to_string_key("C:\\out\\a.obj");
        assert!(!w.mark_deleted(key).unwrap());
        w.add(key, "#", 3).unwrap();
        assert!(w.mark_deleted(key).unwrap());
        assert_eq!(w.entry(&key), Some(("", 0)));
    }
}
