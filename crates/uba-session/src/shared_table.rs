//! File-backed append-only arena shared with detoured processes.

use crate::SessionError;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::info;
use uba_ipc::TableOffset;

pub struct SharedTable {
    mmap: MmapMut,
    size: usize,
    path: PathBuf,
    name: &'static str,
}

impl SharedTable {
    /// Create (or truncate) the arena at `path` with a fixed capacity.
    /// The file is sparse; only appended bytes consume memory.
    pub fn create(path: &Path, capacity: u64, name: &'static str) -> Result<Self, SessionError> {
        if capacity >= TableOffset::DIRECTORY_TAG as u64 {
            return Err(SessionError::InvalidCapacity(capacity));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        info!(path = %path.display(), capacity, table = name, "Created shared table");

        Ok(Self {
            mmap,
            size: 0,
            path: path.to_path_buf(),
            name,
        })
    }

    /// Append one encoded record; returns the offset of its first byte.
    pub fn append(&mut self, bytes: &[u8]) -> Result<TableOffset, SessionError> {
        let end = self.size + bytes.len();
        if end > self.mmap.len() {
            return Err(SessionError::TableFull {
                table: self.name,
                capacity: self.mmap.len() as u64,
            });
        }
        let offset = TableOffset(self.size as u32);
        self.mmap[self.size..end].copy_from_slice(bytes);
        self.size = end;
        Ok(offset)
    }

    pub fn size(&self) -> u32 {
        self.size as u32
    }

    pub fn capacity(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap[..self.size]
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_size() {
        let temp = tempdir().unwrap();
        let mut table = SharedTable::create(&temp.path().join("t.bin"), 64, "test").unwrap();
        assert_eq!(table.append(b"abc").unwrap(), TableOffset(0));
        assert_eq!(table.append(b"de").unwrap(), TableOffset(3));
        assert_eq!(table.size(), 5);
        assert_eq!(table.bytes(), b"abcde");
    }

    #[test]
    fn test_full_table_is_error() {
        let temp = tempdir().unwrap();
        let mut table = SharedTable::create(&temp.path().join("t.bin"), 4, "test").unwrap();
        table.append(b"abc").unwrap();
        let err = table.append(b"de").unwrap_err();
        assert!(matches!(err, SessionError::TableFull { .. }));
        assert_eq!(table.size(), 3);
    }

    #[test]
    fn test_file_sees_appended_bytes() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("t.bin");
        let mut table = SharedTable::create(&path, 16, "test").unwrap();
        table.append(b"xyz").unwrap();
        table.mmap.flush().unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 16);
        assert_eq!(&on_disk[..3], b"xyz");
    }

    #[test]
    fn test_capacity_must_leave_tag_bit() {
        let temp = tempdir().unwrap();
        let result = SharedTable::create(&temp.path().join("t.bin"), 1 << 31, "test");
        assert!(matches!(result, Err(SessionError::InvalidCapacity(_))));
    }
}
