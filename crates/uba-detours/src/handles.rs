//! Synthetic handles handed to the tool.
//!
//! Values come from reserved ranges no real OS handle uses, so a trampoline
//! can tell from the value alone whether a handle belongs to this layer.
//! Each range is a block allocator: slots grow 256 at a time and freed slots
//! are reused.

use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, Mutex};
use uba_ipc::{StringKey, TableOffset};

use crate::directory_table::{DirectoryEntry, EntryInformation};
use crate::memory_file::MemoryFile;
use crate::sync::lock;

pub const FILE_HANDLE_BASE: u64 = 0x4000_0000_0000;
pub const LIST_DIRECTORY_HANDLE_BASE: u64 = 0x5000_0000_0000;
const RANGE_SIZE: u64 = 0x1000_0000_0000;
const BLOCK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetouredHandle(pub u64);

impl DetouredHandle {
    fn in_range(self, base: u64) -> bool {
        self.0 >= base && self.0 < base + RANGE_SIZE && self.0 % 4 == 0
    }

    pub fn is_file(self) -> bool {
        self.in_range(FILE_HANDLE_BASE)
    }

    pub fn is_list_directory(self) -> bool {
        self.in_range(LIST_DIRECTORY_HANDLE_BASE)
    }

    pub fn is_detoured(raw: u64) -> bool {
        let handle = DetouredHandle(raw);
        handle.is_file() || handle.is_list_directory()
    }
}

struct Slots<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
    live: usize,
}

pub struct HandleTable<T> {
    base: u64,
    slots: Mutex<Slots<T>>,
}

impl<T: Clone> HandleTable<T> {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub fn insert(&self, value: T) -> DetouredHandle {
        let mut slots = lock(&self.slots);
        if slots.free.is_empty() {
            let start = slots.entries.len();
            slots.entries.resize_with(start + BLOCK_SIZE, || None);
            // Lowest index handed out first.
            slots.free.extend((start..start + BLOCK_SIZE).rev());
        }
        let index = slots.free.pop().unwrap_or_default();
        slots.entries[index] = Some(value);
        slots.live += 1;
        DetouredHandle(self.base + 4 * index as u64)
    }

    fn index(&self, handle: DetouredHandle) -> Option<usize> {
        if handle.0 < self.base || handle.0 % 4 != 0 {
            return None;
        }
        Some(((handle.0 - self.base) / 4) as usize)
    }

    pub fn get(&self, handle: DetouredHandle) -> Option<T> {
        let index = self.index(handle)?;
        lock(&self.slots).entries.get(index)?.clone()
    }

    pub fn remove(&self, handle: DetouredHandle) -> Option<T> {
        let index = self.index(handle)?;
        let mut slots = lock(&self.slots);
        let value = slots.entries.get_mut(index)?.take()?;
        slots.free.push(index);
        slots.live -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.slots).entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    NotFound,
    FoundViaCache,
    FoundViaRpc,
}

/// Lifecycle of one file identity as the tool sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Unknown,
    Probed(ProbeResult),
    Opened,
    MemoryBacked,
    Closed,
}

#[derive(Clone, Copy)]
struct Identity {
    state: FileState,
    open_objects: u32,
}

/// File states by key. An identity stays open while any file object for
/// it is alive; attribute queries do not demote an open identity.
#[derive(Default)]
pub struct FileStates {
    identities: Mutex<HashMap<StringKey, Identity>>,
}

impl FileStates {
    pub fn get(&self, key: &StringKey) -> FileState {
        lock(&self.identities)
            .get(key)
            .map_or(FileState::Unknown, |identity| identity.state)
    }

    pub fn probed(&self, key: StringKey, result: ProbeResult) {
        let mut identities = lock(&self.identities);
        let identity = identities.entry(key).or_insert(Identity {
            state: FileState::Unknown,
            open_objects: 0,
        });
        if identity.open_objects == 0 {
            identity.state = FileState::Probed(result);
        }
    }

    pub fn opened(&self, key: StringKey, memory_backed: bool) {
        let mut identities = lock(&self.identities);
        let identity = identities.entry(key).or_insert(Identity {
            state: FileState::Unknown,
            open_objects: 0,
        });
        identity.open_objects += 1;
        if memory_backed {
            identity.state = FileState::MemoryBacked;
        } else if identity.state != FileState::MemoryBacked {
            identity.state = FileState::Opened;
        }
    }

    pub fn closed(&self, key: &StringKey) {
        let mut identities = lock(&self.identities);
        if let Some(identity) = identities.get_mut(key) {
            identity.open_objects = identity.open_objects.saturating_sub(1);
            if identity.open_objects == 0 {
                identity.state = FileState::Closed;
            }
        }
    }
}

pub enum FileSource {
    /// Opened only to query attributes; nothing to read.
    AttributesOnly(EntryInformation),
    Memory(Arc<MemoryFile>),
    /// Read-only content inside a session mapping.
    SessionMapping {
        view: Arc<Mmap>,
        offset: u64,
        size: u64,
    },
    Disk(File),
    Directory(EntryInformation),
    /// Zero-length file the session knows by name only.
    Empty,
}

pub struct FileObject {
    pub file_name: String,
    pub key: StringKey,
    pub ref_count: u32,
    /// Non-zero when the session must be told about the close.
    pub close_id: u32,
    pub desired_access: u32,
    pub delete_on_close: bool,
    pub new_name: String,
    /// The file info belongs to this object rather than the file table.
    pub owns_file_info: bool,
    pub position: u64,
    pub source: FileSource,
    pub dir_table_offset: TableOffset,
}

impl FileObject {
    pub fn new(file_name: &str, key: StringKey, desired_access: u32, source: FileSource) -> Self {
        Self {
            file_name: file_name.to_string(),
            key,
            ref_count: 1,
            close_id: 0,
            desired_access,
            delete_on_close: false,
            new_name: String::new(),
            owns_file_info: false,
            position: 0,
            source,
            dir_table_offset: TableOffset::INVALID,
        }
    }

    pub fn memory_file(&self) -> Option<&Arc<MemoryFile>> {
        match &self.source {
            FileSource::Memory(file) => Some(file),
            _ => None,
        }
    }
}

/// A file mapping object created over a detoured file.
#[derive(Clone)]
pub struct MappingObject {
    pub file: Arc<Mutex<FileObject>>,
    pub size: u64,
    pub writable: bool,
}

#[derive(Clone)]
pub enum HandleEntry {
    File(Arc<Mutex<FileObject>>),
    Mapping(MappingObject),
}

/// State of one `FindFirstFile` enumeration.
pub struct ListDirectoryHandle {
    pub dir_path: String,
    pattern: String,
    dir_info: EntryInformation,
    entries: Vec<DirectoryEntry>,
    /// -2 and -1 are "." and "..".
    cursor: i64,
}

impl ListDirectoryHandle {
    pub fn new(dir_path: &str, pattern: &str, dir_info: EntryInformation, entries: Vec<DirectoryEntry>) -> Self {
        Self {
            dir_path: dir_path.to_string(),
            pattern: pattern.to_string(),
            dir_info,
            entries,
            cursor: -2,
        }
    }

    pub fn next_entry(&mut self) -> Option<DirectoryEntry> {
        while self.cursor < 0 {
            let name = if self.cursor == -2 { "." } else { ".." };
            self.cursor += 1;
            if wildcard_match(&self.pattern, name) {
                return Some(DirectoryEntry {
                    name: name.to_string(),
                    info: self.dir_info,
                });
            }
        }
        while let Some(entry) = self.entries.get(self.cursor as usize) {
            self.cursor += 1;
            if wildcard_match(&self.pattern, &entry.name) {
                return Some(entry.clone());
            }
        }
        None
    }
}

/// Case-insensitive match with `*` and `?`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().flat_map(char::to_lowercase).collect();
    let name: Vec<char> = name.chars().flat_map(char::to_lowercase).collect();
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((sp, sn)) = star {
            p = sp + 1;
            n = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_spaced_and_reused() {
        let table: HandleTable<u32> = HandleTable::new(FILE_HANDLE_BASE);
        let a = table.insert(1);
        let b = table.insert(2);
        assert_eq!(a.0, FILE_HANDLE_BASE);
        assert_eq!(b.0, FILE_HANDLE_BASE + 4);
        assert!(a.is_file());
        assert!(!a.is_list_directory());

        assert_eq!(table.remove(a), Some(1));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.insert(3), a);
        assert_eq!(table.get(b), Some(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_table_grows_in_blocks() {
        let table: HandleTable<usize> = HandleTable::new(LIST_DIRECTORY_HANDLE_BASE);
        let handles: Vec<_> = (0..BLOCK_SIZE + 1).map(|i| table.insert(i)).collect();
        assert_eq!(table.capacity(), 2 * BLOCK_SIZE);
        assert_eq!(table.get(handles[BLOCK_SIZE]), Some(BLOCK_SIZE));
        assert!(handles[BLOCK_SIZE].is_list_directory());
    }

    #[test]
    fn test_foreign_values_are_not_detoured() {
        assert!(!DetouredHandle::is_detoured(0x1234));
        assert!(!DetouredHandle::is_detoured(FILE_HANDLE_BASE + 2));
        assert!(DetouredHandle::is_detoured(LIST_DIRECTORY_HANDLE_BASE + 8));
        let table: HandleTable<u8> = HandleTable::new(FILE_HANDLE_BASE);
        assert_eq!(table.get(DetouredHandle(0x10)), None);
    }

    #[test]
    fn test_wildcards() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*.CPP", "main.cpp"));
        assert!(wildcard_match("a?c*", "abcdef"));
        assert!(!wildcard_match("*.h", "main.cpp"));
        assert!(wildcard_match("*a*b", "xxaxxb"));
        assert!(!wildcard_match("a", "ab"));
    }

    #[test]
    fn test_listing_starts_with_dot_entries() {
        let info = EntryInformation::default();
        let entries = vec![
            DirectoryEntry { name: "a.h".into(), info },
            DirectoryEntry { name: "b.cpp".into(), info },
        ];
        let mut all = ListDirectoryHandle::new("C:\\proj", "*", info, entries.clone());
        let names: Vec<String> = std::iter::from_fn(|| all.next_entry()).map(|e| e.name).collect();
        assert_eq!(names, vec![".", "..", "a.h", "b.cpp"]);

        let mut cpp = ListDirectoryHandle::new("C:\\proj", "*.cpp", info, entries);
        assert_eq!(cpp.next_entry().unwrap().name, "b.cpp");
        assert!(cpp.next_entry().is_none());
    }
}
