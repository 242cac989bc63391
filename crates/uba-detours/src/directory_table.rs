//! Reader side of the shared directory table.
//!
//! The session appends directory records to a memory-mapped arena. Parsing
//! only indexes records by directory key; listings are materialized into a
//! directory's `files` map the first time someone looks inside it, by
//! walking its version chain back to what was already materialized and
//! replaying the versions oldest to newest.
//!
//! Locking: `lookup` guards the key to directory map and the parse position.
//! Each directory has its own mutex around its materialized listing so
//! different directories can be populated concurrently.

use memmap2::Mmap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use uba_config::log_table_debug;
use uba_ipc::path::{is_separator, trim_trailing_separators};
use uba_ipc::table_types::{try_read_record_header, DirectoryInfo, DirectoryItem, DirectoryVersionHeader};
use uba_ipc::win32::FILE_ATTRIBUTE_DIRECTORY;
use uba_ipc::{to_string_key, BinaryReader, StringKey, StringKeyHasher, TableOffset};

use crate::fatal;
use crate::sync::{lock, read, write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exists {
    Yes,
    No,
    /// No ancestor is known; ask the session.
    Maybe,
}

/// Metadata of one directory entry as the session reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryInformation {
    pub attributes: u32,
    pub volume_serial: u32,
    pub file_index: u64,
    pub last_write_time: u64,
    pub size: u64,
}

impl EntryInformation {
    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }
}

impl From<&DirectoryItem> for EntryInformation {
    fn from(item: &DirectoryItem) -> Self {
        Self {
            attributes: item.attributes,
            volume_serial: item.volume_serial,
            file_index: item.file_index,
            last_write_time: item.last_write_time,
            size: item.size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub info: EntryInformation,
}

struct DirectoryState {
    /// Newest version already replayed into `files`.
    parse_offset: TableOffset,
    /// Child key to the offset of its item; tagged for directories.
    files: HashMap<StringKey, TableOffset>,
    /// Children in the order the session first listed them.
    order: Vec<StringKey>,
}

pub struct Directory {
    table_offset: AtomicU32,
    state: Mutex<DirectoryState>,
}

impl Directory {
    fn new(table_offset: TableOffset) -> Self {
        Self {
            table_offset: AtomicU32::new(table_offset.0),
            state: Mutex::new(DirectoryState {
                parse_offset: TableOffset::INVALID,
                files: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Latest version of the listing, INVALID for a known-missing directory.
    pub fn table_offset(&self) -> TableOffset {
        TableOffset(self.table_offset.load(Ordering::Acquire))
    }

    pub fn parse_offset(&self) -> TableOffset {
        lock(&self.state).parse_offset
    }

    pub fn file_count(&self) -> usize {
        lock(&self.state).files.len()
    }
}

pub struct Lookup {
    directories: HashMap<StringKey, Arc<Directory>>,
    /// Bytes of the table already indexed.
    memory_size: u32,
}

impl Lookup {
    pub fn get(&self, key: &StringKey) -> Option<&Arc<Directory>> {
        self.directories.get(key)
    }

    pub fn len(&self) -> usize {
        self.directories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }

    pub fn memory_size(&self) -> u32 {
        self.memory_size
    }

    /// Snapshot of key and table offset of every directory, sorted by key.
    pub fn offsets(&self) -> Vec<(StringKey, TableOffset)> {
        let mut offsets: Vec<_> = self
            .directories
            .iter()
            .map(|(key, dir)| (*key, dir.table_offset()))
            .collect();
        offsets.sort_by_key(|(key, _)| *key);
        offsets
    }
}

pub struct DirectoryTable {
    memory: Mmap,
    lookup: RwLock<Lookup>,
    /// Untagged item offset of a directory entry to that directory's key,
    /// so its own version chain can be found from the parent's item.
    directory_items: Mutex<HashMap<TableOffset, StringKey>>,
}

impl DirectoryTable {
    /// Bind to the mapped table and index the first `table_size` bytes.
    /// `table_count` sizes the lookup up front.
    pub fn init(memory: Mmap, table_count: usize, table_size: u32) -> Self {
        let table = Self {
            memory,
            lookup: RwLock::new(Lookup {
                directories: HashMap::with_capacity(table_count),
                memory_size: 0,
            }),
            directory_items: Mutex::new(HashMap::new()),
        };
        table.parse_directory_table(table_size);
        table
    }

    pub fn lock_lookup(&self) -> RwLockWriteGuard<'_, Lookup> {
        write(&self.lookup)
    }

    pub fn memory_size(&self) -> u32 {
        read(&self.lookup).memory_size
    }

    pub fn directory_count(&self) -> usize {
        read(&self.lookup).len()
    }

    pub fn parse_directory_table(&self, size: u32) -> usize {
        let mut lookup = write(&self.lookup);
        self.parse_directory_table_no_lock(&mut lookup, size)
    }

    /// Index records between the previous high-water mark and `size`.
    /// Sizes at or below the mark are a no-op. A record that is not fully
    /// inside `size` is left for the next call. Returns the record count.
    pub fn parse_directory_table_no_lock(&self, lookup: &mut Lookup, size: u32) -> usize {
        if size <= lookup.memory_size {
            return 0;
        }
        let end = (size as usize).min(self.memory.len());
        let mut reader = BinaryReader::at(&self.memory[..end], lookup.memory_size as usize);
        let mut count = 0;
        while reader.left() > 0 {
            let Some((key, payload_len)) = try_read_record_header(&mut reader) else {
                break;
            };
            let offset = TableOffset(reader.position() as u32);
            match lookup.directories.get(&key) {
                // Redefined: only the head moves, the listing refreshes lazily.
                Some(dir) => dir.table_offset.store(offset.0, Ordering::Release),
                None => {
                    lookup.directories.insert(key, Arc::new(Directory::new(offset)));
                }
            }
            reader.skip(payload_len);
            count += 1;
        }
        let from = lookup.memory_size;
        lookup.memory_size = reader.position() as u32;
        if count > 0 {
            log_table_debug!(
                "Parsed directory table",
                from = from,
                to = lookup.memory_size,
                records = count
            );
        }
        count
    }

    /// Bring `dir.files` up to date with the directory's newest version.
    /// `hasher` is seeded with the directory's path.
    pub fn populate_directory(&self, hasher: &StringKeyHasher, dir: &Directory) {
        let head = dir.table_offset();
        let mut state = lock(&dir.state);
        if !head.is_valid() || head == state.parse_offset {
            return;
        }

        // Collect versions newer than what is materialized. Reaching a first
        // version means the directory was rewritten: start from scratch.
        let mut chain = Vec::new();
        let mut offset = head;
        let mut rescan = false;
        loop {
            chain.push(offset);
            let header = self.read_header(offset);
            if !header.prev.is_valid() {
                rescan = state.parse_offset.is_valid();
                break;
            }
            if header.prev == state.parse_offset {
                break;
            }
            if header.prev.0 >= offset.0 {
                fatal!("Directory version chain at {:?} does not move backwards", offset);
            }
            offset = header.prev;
        }
        if rescan {
            state.files.clear();
            state.order.clear();
        }

        let mut directory_items = lock(&self.directory_items);
        for &version in chain.iter().rev() {
            let mut reader = BinaryReader::at(&self.memory, version.as_usize());
            let header = DirectoryVersionHeader::read(&mut reader);
            for _ in 0..header.item_count {
                let item_offset = TableOffset(reader.position() as u32);
                let item = DirectoryItem::read(&mut reader);
                let key = hasher.clone().update("\\").update(&item.name).finalize();
                let stored = if item.is_directory() {
                    directory_items.insert(item_offset, key);
                    item_offset.tagged()
                } else {
                    item_offset
                };
                if state.files.insert(key, stored).is_none() {
                    state.order.push(key);
                }
            }
        }
        state.parse_offset = head;
        log_table_debug!("Populated directory", versions = chain.len(), files = state.files.len());
    }

    fn read_header(&self, offset: TableOffset) -> DirectoryVersionHeader {
        if offset.as_usize() >= self.memory.len() {
            fatal!("Directory table offset {:?} is outside the table", offset);
        }
        DirectoryVersionHeader::read(&mut BinaryReader::at(&self.memory, offset.as_usize()))
    }

    /// Walk a chain back to its first version.
    fn first_version_info(&self, head: TableOffset) -> DirectoryInfo {
        let mut offset = head;
        loop {
            let header = self.read_header(offset);
            match header.info {
                Some(info) => return info,
                None if header.prev.0 < offset.0 => offset = header.prev,
                None => fatal!("Directory version chain at {:?} does not move backwards", offset),
            }
        }
    }

    pub fn entry_exists(&self, key: StringKey, name: &str, check_if_dir: bool) -> (Exists, TableOffset) {
        let lookup = read(&self.lookup);
        self.entry_exists_no_lock(&lookup, key, name, check_if_dir)
    }

    /// Find the nearest known ancestor of `name` and answer from its
    /// listing. `key` is the key of the whole of `name`.
    pub fn entry_exists_no_lock(
        &self,
        lookup: &Lookup,
        key: StringKey,
        name: &str,
        check_if_dir: bool,
    ) -> (Exists, TableOffset) {
        let trimmed = trim_trailing_separators(name);
        let (name, key, check_if_dir) = if trimmed.len() == name.len() {
            (name, key, check_if_dir)
        } else {
            // `dir\` names the directory itself; the caller's key covers the separator.
            (trimmed, to_string_key(trimmed), true)
        };
        if let Some(dir) = lookup.directories.get(&key) {
            // The entry is itself a listed directory.
            let offset = dir.table_offset();
            if !offset.is_valid() {
                return (Exists::No, TableOffset::INVALID);
            }
            if self.first_version_info(offset).attributes == 0 {
                return (Exists::No, TableOffset::INVALID);
            }
        }

        // Separator positions; ancestors are the prefixes ending at them.
        let separators: Vec<usize> = name
            .char_indices()
            .filter(|(_, c)| is_separator(*c))
            .map(|(i, _)| i)
            .collect();

        for (depth, &end) in separators.iter().enumerate().rev() {
            let ancestor = &name[..end];
            let mut hasher = StringKeyHasher::new();
            hasher.update(ancestor);
            let ancestor_key = hasher.finalize();
            let Some(dir) = lookup.directories.get(&ancestor_key) else {
                continue;
            };
            if !dir.table_offset().is_valid() {
                return (Exists::No, TableOffset::INVALID);
            }
            self.populate_directory(&hasher, dir);

            // The component right below the known ancestor.
            let child_end = separators.get(depth + 1).copied().unwrap_or(name.len());
            let is_entry = child_end == name.len();
            let child_key = if is_entry {
                key
            } else {
                hasher.clone().update(&name[end..child_end]).finalize()
            };

            let offset = lock(&dir.state).files.get(&child_key).copied();
            let Some(offset) = offset else {
                return (Exists::No, TableOffset::INVALID);
            };
            let attributes = self.item_attributes(offset);
            if attributes == 0 {
                return (Exists::No, TableOffset::INVALID);
            }
            let is_dir = attributes & FILE_ATTRIBUTE_DIRECTORY != 0;
            if is_entry {
                if check_if_dir && !is_dir {
                    return (Exists::No, TableOffset::INVALID);
                }
                return (Exists::Yes, offset);
            }
            if !is_dir {
                // A file where a directory should be.
                return (Exists::No, TableOffset::INVALID);
            }
            // An intermediate directory the session has not listed yet.
            return (Exists::Maybe, TableOffset::INVALID);
        }
        (Exists::Maybe, TableOffset::INVALID)
    }

    fn item_attributes(&self, offset: TableOffset) -> u32 {
        let mut reader = BinaryReader::at(&self.memory, offset.untagged().as_usize());
        let _name = reader.read_string();
        reader.read_7bit_encoded() as u32
    }

    pub fn get_entry_information(&self, offset: TableOffset) -> Option<(EntryInformation, String)> {
        let lookup = read(&self.lookup);
        self.get_entry_information_no_lock(&lookup, offset)
    }

    /// Decode the item at `offset`. A tagged offset is a directory entry and
    /// resolves through that directory's own chain; attributes 0 anywhere
    /// means the entry is gone.
    pub fn get_entry_information_no_lock(
        &self,
        lookup: &Lookup,
        offset: TableOffset,
    ) -> Option<(EntryInformation, String)> {
        if !offset.is_valid() {
            return None;
        }
        let item_offset = offset.untagged();
        if item_offset.as_usize() >= self.memory.len() {
            return None;
        }
        let item = DirectoryItem::read(&mut BinaryReader::at(&self.memory, item_offset.as_usize()));
        if item.attributes == 0 {
            return None;
        }
        let mut info = EntryInformation::from(&item);
        if offset.is_tagged() {
            let child_key = lock(&self.directory_items).get(&item_offset).copied();
            if let Some(dir) = child_key.and_then(|key| lookup.directories.get(&key)) {
                let head = dir.table_offset();
                if !head.is_valid() {
                    return None;
                }
                let dir_info = self.first_version_info(head);
                if dir_info.attributes == 0 {
                    return None;
                }
                info.attributes = dir_info.attributes;
                info.volume_serial = dir_info.volume_serial;
                info.file_index = dir_info.file_index;
            }
        }
        Some((info, item.name))
    }

    /// Replace every component of `path` with the name the session listed,
    /// as far as the table knows the directories.
    pub fn get_final_path(&self, path: &str) -> String {
        let lookup = read(&self.lookup);
        let path = trim_trailing_separators(path);
        let mut result = String::with_capacity(path.len());
        let mut hasher = StringKeyHasher::new();
        let mut start = 0;
        for (i, c) in path.char_indices().chain(std::iter::once((path.len(), '\\'))) {
            if i != path.len() && !is_separator(c) {
                continue;
            }
            let component = &path[start..i];
            let dir = if start == 0 {
                None
            } else {
                lookup.directories.get(&hasher.finalize())
            };
            let mut child = hasher.clone();
            if start > 0 {
                child.update("\\");
            }
            child.update(component);

            let mut resolved = component;
            let mut listed_name = None;
            if let Some(dir) = dir {
                self.populate_directory(&hasher, dir);
                let offset = lock(&dir.state).files.get(&child.finalize()).copied();
                if let Some(offset) = offset {
                    let mut reader = BinaryReader::at(&self.memory, offset.untagged().as_usize());
                    listed_name = reader.try_read_string();
                }
            }
            if let Some(name) = &listed_name {
                resolved = name.as_str();
            }
            if start > 0 {
                result.push('\\');
            }
            result.push_str(resolved);
            hasher = child;
            start = i + 1;
        }
        result
    }

    /// Live children of a listed directory, in listing order.
    pub fn list_directory(&self, dir_path: &str) -> Option<Vec<DirectoryEntry>> {
        let lookup = read(&self.lookup);
        let dir_path = trim_trailing_separators(dir_path);
        let mut hasher = StringKeyHasher::new();
        hasher.update(dir_path);
        let dir = lookup.directories.get(&hasher.finalize())?;
        if !dir.table_offset().is_valid() || self.first_version_info(dir.table_offset()).attributes == 0 {
            return None;
        }
        self.populate_directory(&hasher, dir);
        let offsets: Vec<TableOffset> = {
            let state = lock(&dir.state);
            state.order.iter().filter_map(|key| state.files.get(key).copied()).collect()
        };
        Some(
            offsets
                .into_iter()
                .filter_map(|offset| self.get_entry_information_no_lock(&lookup, offset))
                .map(|(info, name)| DirectoryEntry { name, info })
                .collect(),
        )
    }

    /// `Some(INVALID)` for a negative entry, `None` when nothing is known.
    pub fn directory_offset(&self, dir_key: &StringKey) -> Option<TableOffset> {
        read(&self.lookup).get(dir_key).map(|dir| dir.table_offset())
    }

    /// Remember that the session has no such directory.
    pub fn add_negative(&self, dir_key: StringKey) {
        let mut lookup = write(&self.lookup);
        Self::add_negative_no_lock(&mut lookup, dir_key);
    }

    pub fn add_negative_no_lock(lookup: &mut Lookup, dir_key: StringKey) {
        lookup
            .directories
            .entry(dir_key)
            .or_insert_with(|| Arc::new(Directory::new(TableOffset::INVALID)));
    }
}
