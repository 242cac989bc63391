//! Process view of where file content lives.
//!
//! Entries come from three places: the session's file-mapping table (parsed
//! incrementally like the directory table), `CreateFile` replies, and files
//! this process keeps in memory. A deletion recorded here wins over any
//! directory table listing of the same path.

use memmap2::Mmap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use uba_config::{log_table_debug, log_table_warn};
use uba_ipc::path::{split_parent, trim_trailing_separators};
use uba_ipc::table_types::{name_sentinel, try_read_record_header};
use uba_ipc::{to_string_key, BinaryReader, MappedName, MappingHandle, StringKey, INVALID_SIZE};

use crate::memory_file::MemoryFile;
use crate::sync::{read, write};

/// Where the content of a file lives. Exactly one applies.
#[derive(Debug, Clone, Default)]
pub enum FileBacking {
    /// Nothing to read: empty files, directories, or not resolved yet.
    #[default]
    Unbacked,
    /// A real file; an empty path means the name the process asked for.
    Disk(String),
    /// Part of a mapping the session prepared.
    SessionMapping { handle: MappingHandle, offset: u64 },
    /// Written into shared memory by another process.
    SharedFile { handle: MappingHandle },
    /// Held by this process.
    Memory(Arc<MemoryFile>),
}

impl FileBacking {
    /// Backing described by a mapped name, `None` for a deletion.
    pub fn from_mapped_name(name: &str) -> Option<Self> {
        Some(match MappedName::parse(name) {
            MappedName::Missing => return None,
            MappedName::EmptyDirectory | MappedName::EmptyFile => FileBacking::Unbacked,
            MappedName::Mapping { handle, offset } => FileBacking::SessionMapping { handle, offset },
            MappedName::SharedFile { handle } => FileBacking::SharedFile { handle },
            MappedName::Original => FileBacking::Disk(String::new()),
            MappedName::Path(path) => FileBacking::Disk(path.to_string()),
        })
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, FileBacking::Memory(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// Mapped name as last reported by the session.
    pub name: String,
    /// Path the process used.
    pub original_name: String,
    /// `INVALID_SIZE` until known.
    pub size: u64,
    pub backing: FileBacking,
    pub deleted: bool,
    pub last_desired_access: u32,
}

impl FileInfo {
    pub fn memory_file(&self) -> Option<&Arc<MemoryFile>> {
        match &self.backing {
            FileBacking::Memory(file) => Some(file),
            _ => None,
        }
    }

    /// Path to open for a disk-backed entry.
    pub fn disk_path(&self) -> Option<&str> {
        match &self.backing {
            FileBacking::Disk(path) if path.is_empty() => Some(&self.original_name),
            FileBacking::Disk(path) => Some(path),
            _ => None,
        }
    }

    /// Current size, from the memory file when there is one.
    pub fn current_size(&self) -> u64 {
        match &self.backing {
            FileBacking::Memory(file) => file.written_size(),
            _ => self.size,
        }
    }
}

pub struct Tables {
    files: HashMap<StringKey, FileInfo>,
    /// Bytes of the shared table already applied.
    mem_position: u32,
}

impl Tables {
    pub fn get(&self, key: &StringKey) -> Option<&FileInfo> {
        self.files.get(key)
    }

    pub fn get_mut(&mut self, key: &StringKey) -> Option<&mut FileInfo> {
        self.files.get_mut(key)
    }

    pub fn mem_position(&self) -> u32 {
        self.mem_position
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub struct MappedFileTable {
    memory: Mmap,
    lookup: RwLock<Tables>,
}

/// Apply a mapped name and size reported for an existing entry.
fn apply_mapping(key: StringKey, info: &mut FileInfo, name: String, size: u64) {
    if name.is_empty() {
        info.deleted = true;
        info.last_desired_access = 0;
        return;
    }
    if let FileBacking::Memory(_) = info.backing {
        if name != info.name {
            log_table_warn!(
                "Remap ignored, memory file is live",
                key = key.to_string().as_str(),
                name = name.as_str()
            );
        }
        info.deleted = false;
        return;
    }
    if name != info.name {
        if name_sentinel(&name) == name_sentinel(&info.name) {
            // Same kind of backing in a new place: another disk path or mapping offset.
            log_table_debug!("Retargeted file", key = key.to_string().as_str(), name = name.as_str());
        } else {
            log_table_debug!(
                "Remapped file",
                key = key.to_string().as_str(),
                from = info.name.as_str(),
                name = name.as_str()
            );
        }
        if let Some(backing) = FileBacking::from_mapped_name(&name) {
            info.backing = backing;
        }
        info.name = name;
    }
    if size != INVALID_SIZE {
        info.size = size;
    }
    info.deleted = false;
}

impl MappedFileTable {
    pub fn init(memory: Mmap, table_size: u32) -> Self {
        let table = Self {
            memory,
            lookup: RwLock::new(Tables {
                files: HashMap::new(),
                mem_position: 0,
            }),
        };
        table.parse(table_size);
        table
    }

    pub fn lock_lookup(&self) -> RwLockWriteGuard<'_, Tables> {
        write(&self.lookup)
    }

    pub fn mem_position(&self) -> u32 {
        read(&self.lookup).mem_position
    }

    pub fn parse(&self, size: u32) -> usize {
        let mut tables = write(&self.lookup);
        self.parse_no_lock(&mut tables, size)
    }

    /// Apply records between the previous high-water mark and `size`.
    pub fn parse_no_lock(&self, tables: &mut Tables, size: u32) -> usize {
        if size <= tables.mem_position {
            return 0;
        }
        let end = (size as usize).min(self.memory.len());
        let mut reader = BinaryReader::at(&self.memory[..end], tables.mem_position as usize);
        let mut count = 0;
        while reader.left() > 0 {
            let Some((key, _)) = try_read_record_header(&mut reader) else {
                break;
            };
            let name = reader.read_string();
            let size = reader.read_7bit_encoded();
            match tables.files.get_mut(&key) {
                Some(info) => apply_mapping(key, info, name, size),
                None => {
                    let backing = FileBacking::from_mapped_name(&name);
                    tables.files.insert(
                        key,
                        FileInfo {
                            deleted: backing.is_none(),
                            backing: backing.unwrap_or_default(),
                            name,
                            original_name: String::new(),
                            size,
                            last_desired_access: 0,
                        },
                    );
                }
            }
            count += 1;
        }
        let from = tables.mem_position;
        tables.mem_position = reader.position() as u32;
        if count > 0 {
            log_table_debug!(
                "Parsed file mapping table",
                from = from,
                to = tables.mem_position,
                records = count
            );
        }
        count
    }

    /// Record the answer to a `CreateFile` message.
    pub fn insert_mapping(&self, key: StringKey, original_name: &str, name: &str, size: u64) -> FileInfo {
        let mut tables = write(&self.lookup);
        let info = tables.files.entry(key).or_insert_with(|| FileInfo {
            size: INVALID_SIZE,
            ..Default::default()
        });
        if info.original_name.is_empty() {
            info.original_name = original_name.to_string();
        }
        apply_mapping(key, info, name.to_string(), size);
        info.clone()
    }

    pub fn set_deleted(&self, key: StringKey, name: &str, deleted: bool) {
        let mut tables = write(&self.lookup);
        let info = tables.files.entry(key).or_default();
        if info.original_name.is_empty() {
            info.original_name = name.to_string();
        }
        info.deleted = deleted;
        info.last_desired_access = 0;
        if deleted {
            info.backing = FileBacking::Unbacked;
            info.name.clear();
            info.size = 0;
        }
    }

    pub fn is_deleted(&self, key: &StringKey) -> bool {
        read(&self.lookup).get(key).is_some_and(|info| info.deleted)
    }

    pub fn lookup(&self, key: &StringKey) -> Option<FileInfo> {
        read(&self.lookup).get(key).cloned()
    }

    /// Make `file` the content of `key`.
    pub fn insert_memory_file(&self, key: StringKey, original_name: &str, file: Arc<MemoryFile>) {
        let mut tables = write(&self.lookup);
        let info = tables.files.entry(key).or_default();
        info.original_name = original_name.to_string();
        info.name = original_name.to_string();
        info.size = file.written_size();
        info.backing = FileBacking::Memory(file);
        info.deleted = false;
    }

    pub fn memory_file(&self, key: &StringKey) -> Option<Arc<MemoryFile>> {
        read(&self.lookup).get(key).and_then(|info| info.memory_file().cloned())
    }

    pub fn update_size(&self, key: &StringKey, size: u64) {
        if let Some(info) = write(&self.lookup).get_mut(key) {
            info.size = size;
        }
    }

    pub fn set_last_desired_access(&self, key: &StringKey, access: u32) {
        if let Some(info) = write(&self.lookup).get_mut(key) {
            info.last_desired_access = access;
        }
    }

    pub fn remove(&self, key: &StringKey) -> Option<FileInfo> {
        write(&self.lookup).files.remove(key)
    }

    /// Move an entry to a new key, as a rename does.
    pub fn rename(&self, from: &StringKey, to: StringKey, new_name: &str) -> bool {
        let mut tables = write(&self.lookup);
        let Some(mut info) = tables.files.remove(from) else {
            return false;
        };
        info.original_name = new_name.to_string();
        if info.backing.is_memory() {
            info.name = new_name.to_string();
        }
        tables.files.insert(
            *from,
            FileInfo {
                original_name: info.original_name.clone(),
                deleted: true,
                ..Default::default()
            },
        );
        tables.files.insert(to, info);
        true
    }

    /// Live memory files whose path is directly inside `dir_path`.
    pub fn memory_files_in(&self, dir_path: &str) -> Vec<(String, Arc<MemoryFile>)> {
        let dir_key = to_string_key(trim_trailing_separators(dir_path));
        read(&self.lookup)
            .files
            .values()
            .filter_map(|info| {
                let file = info.memory_file()?;
                let (parent, name) = split_parent(&info.original_name)?;
                (to_string_key(parent) == dir_key).then(|| (name.to_string(), file.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::map_table;
    use std::path::Path;
    use tempfile::tempdir;
    use uba_ipc::to_string_key;
    use uba_session::file_table::FileMappingTableWriter;
    use uba_session::shared_table::SharedTable;

    fn writer(dir: &Path) -> FileMappingTableWriter {
        FileMappingTableWriter::new(SharedTable::create(&dir.join("files.bin"), 1 << 20, "file").unwrap())
    }

    fn reader(dir: &Path, size: u32) -> MappedFileTable {
        MappedFileTable::init(map_table(&dir.join("files.bin")).unwrap(), size)
    }

    #[test]
    fn test_parse_classifies_names() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        let a = to_string_key("C:\\a.h");
        let b = to_string_key("C:\\b.h");
        let c = to_string_key("C:\\c.h");
        w.add(a, &MappedName::mapping(MappingHandle(0x10), 0x20), 5).unwrap();
        w.add(b, "#", 7).unwrap();
        w.add(c, "$f", 0).unwrap();

        let table = reader(temp.path(), w.size());
        assert!(matches!(
            table.lookup(&a).unwrap().backing,
            FileBacking::SessionMapping { handle: MappingHandle(0x10), offset: 0x20 }
        ));
        let mut b_info = table.lookup(&b).unwrap();
        b_info.original_name = "C:\\b.h".into();
        assert_eq!(b_info.disk_path(), Some("C:\\b.h"));
        assert_eq!(b_info.size, 7);
        assert!(matches!(table.lookup(&c).unwrap().backing, FileBacking::Unbacked));
    }

    #[test]
    fn test_parse_is_incremental_and_idempotent() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        let key = to_string_key("C:\\x");
        w.add(key, "#", 1).unwrap();
        let first = w.size();
        w.add(key, "#", 2).unwrap();

        let table = reader(temp.path(), first);
        assert_eq!(table.lookup(&key).unwrap().size, 1);
        assert_eq!(table.parse(first), 0);
        assert_eq!(table.parse(w.size() - 1), 0);
        assert_eq!(table.parse(w.size()), 1);
        assert_eq!(table.lookup(&key).unwrap().size, 2);
        assert_eq!(table.mem_position(), w.size());
    }

    #[test]
    fn test_remap_on_new_name() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        let key = to_string_key("C:\\out\\a.obj");
        w.add(key, "#", 1).unwrap();
        w.add(key, &MappedName::shared_file(MappingHandle(9)), 300).unwrap();

        let table = reader(temp.path(), w.size());
        let info = table.lookup(&key).unwrap();
        assert!(matches!(info.backing, FileBacking::SharedFile { handle: MappingHandle(9) }));
        assert_eq!(info.size, 300);
    }

    #[test]
    fn test_retarget_within_same_backing_kind() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        let key = to_string_key("C:\\proj\\a.h");
        w.add(key, &MappedName::mapping(MappingHandle(0x10), 0x20), 5).unwrap();
        w.add(key, &MappedName::mapping(MappingHandle(0x10), 0x80), 6).unwrap();

        let table = reader(temp.path(), w.size());
        let info = table.lookup(&key).unwrap();
        assert!(matches!(
            info.backing,
            FileBacking::SessionMapping { handle: MappingHandle(0x10), offset: 0x80 }
        ));
        assert_eq!(info.size, 6);
    }

    #[test]
    fn test_live_memory_file_is_not_remapped() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        let table = reader(temp.path(), 0);
        let key = to_string_key("C:\\out\\a.obj");
        let file = Arc::new(MemoryFile::create_local("C:\\out\\a.obj", 1 << 20, false).unwrap());
        file.write_at(0, b"abc");
        table.insert_memory_file(key, "C:\\out\\a.obj", file.clone());

        w.add(key, "C:\\elsewhere\\a.obj", 99).unwrap();
        table.parse(w.size());
        let info = table.lookup(&key).unwrap();
        assert!(info.backing.is_memory());
        assert_eq!(info.current_size(), 3);
        assert!(Arc::ptr_eq(&table.memory_file(&key).unwrap(), &file));
    }

    #[test]
    fn test_deletion_from_session_and_locally() {
        let temp = tempdir().unwrap();
        let mut w = writer(temp.path());
        let key = to_string_key("C:\\a.h");
        w.add(key, "#", 1).unwrap();
        w.mark_deleted(key).unwrap();
        let table = reader(temp.path(), w.size());
        assert!(table.is_deleted(&key));

        let other = to_string_key("C:\\b.h");
        table.set_deleted(other, "C:\\b.h", true);
        assert!(table.is_deleted(&other));
        table.set_deleted(other, "C:\\b.h", false);
        assert!(!table.is_deleted(&other));
    }

    #[test]
    fn test_create_reply_and_rename() {
        let temp = tempdir().unwrap();
        let table = reader(temp.path(), 0);
        let from = to_string_key("C:\\out\\a.tmp");
        let to = to_string_key("C:\\out\\a.obj");
        let info = table.insert_mapping(from, "C:\\out\\a.tmp", "#", 4);
        assert_eq!(info.disk_path(), Some("C:\\out\\a.tmp"));

        assert!(table.rename(&from, to, "C:\\out\\a.obj"));
        assert!(table.is_deleted(&from));
        assert_eq!(table.lookup(&to).unwrap().disk_path(), Some("C:\\out\\a.obj"));
        assert!(!table.rename(&to_string_key("C:\\none"), to, "x"));
    }
}
