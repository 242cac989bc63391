//! Detoured file system operations.
//!
//! Each operation answers from memory files and the two table caches when
//! it can, asks the session when it must, and falls through to the real OS
//! only for paths the layer does not virtualize. Results use Win32 error
//! codes so the trampolines can hand them back unchanged.
//!
//! A file object moves through
//! `Unknown -> Probed -> Opened | MemoryBacked -> Closed`. The last close of
//! a written output reports it to the session, which then publishes it to
//! every other process of the build.

use memmap2::Mmap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use uba_config::{log_detours_debug, log_detours_warn};
use uba_ipc::path::{is_drive_root, join, split_parent};
use uba_ipc::table_types::EMPTY_DIRECTORY_NAME;
use uba_ipc::win32::{
    has_write_access, FILE_APPEND_DATA, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL, FILE_READ_DATA,
    FILE_WRITE_DATA, GENERIC_READ, GENERIC_WRITE, INVALID_FILE_ATTRIBUTES, MOVEFILE_REPLACE_EXISTING,
};
use uba_ipc::{to_string_key, MappedName, MappingHandle, StringKey, TableOffset, Win32Error, INVALID_SIZE};

use crate::context::ProcessVirtualizationContext;
use crate::directory_table::{DirectoryEntry, EntryInformation};
use crate::handles::{
    DetouredHandle, FileObject, FileSource, HandleEntry, ListDirectoryHandle, MappingObject, ProbeResult,
};
use crate::mapped_file_table::{FileBacking, FileInfo};
use crate::memory_file::{next_mapping_handle, MemoryFile};
use crate::stats::{add, bump};
use crate::sync::lock;
use crate::true_functions::info_from_metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CreationDisposition {
    CreateNew = 1,
    CreateAlways = 2,
    OpenExisting = 3,
    OpenAlways = 4,
    TruncateExisting = 5,
}

impl CreationDisposition {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => CreationDisposition::CreateNew,
            2 => CreationDisposition::CreateAlways,
            3 => CreationDisposition::OpenExisting,
            4 => CreationDisposition::OpenAlways,
            5 => CreationDisposition::TruncateExisting,
            _ => return None,
        })
    }

    /// Creates the file when it is missing.
    pub fn creates(self) -> bool {
        matches!(
            self,
            CreationDisposition::CreateNew | CreationDisposition::CreateAlways | CreationDisposition::OpenAlways
        )
    }

    pub fn truncates(self) -> bool {
        matches!(self, CreationDisposition::CreateAlways | CreationDisposition::TruncateExisting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMethod {
    Begin,
    Current,
    End,
}

impl MoveMethod {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MoveMethod::Begin),
            1 => Some(MoveMethod::Current),
            2 => Some(MoveMethod::End),
            _ => None,
        }
    }
}

/// Answer to an attribute query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    pub exists: bool,
    /// Win32 error when `exists` is false.
    pub last_error: u32,
    pub info: EntryInformation,
    /// Answered by the layer rather than the real file system.
    pub use_cache: bool,
}

impl FileAttributes {
    fn found(info: EntryInformation, use_cache: bool) -> Self {
        Self {
            exists: true,
            last_error: 0,
            info,
            use_cache,
        }
    }

    fn missing(error: Win32Error, use_cache: bool) -> Self {
        Self {
            exists: false,
            last_error: error.code(),
            info: EntryInformation {
                attributes: INVALID_FILE_ATTRIBUTES,
                ..Default::default()
            },
            use_cache,
        }
    }
}

enum ViewBytes {
    Memory(Arc<MemoryFile>),
    Session(Arc<Mmap>),
    Copied(Vec<u8>),
}

/// A view created by [`ProcessVirtualizationContext::map_view_of_file`].
pub struct MappedView {
    bytes: ViewBytes,
    /// Start of the view inside `bytes`.
    offset: u64,
    len: u64,
    writable: bool,
}

impl MappedView {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let slice = |bytes: &[u8]| {
            let start = (self.offset as usize).min(bytes.len());
            let end = self.offset.saturating_add(self.len).min(bytes.len() as u64) as usize;
            bytes[start..end].to_vec()
        };
        match &self.bytes {
            ViewBytes::Memory(file) => {
                let mut content = file.with_view(slice);
                // Mapped but unwritten bytes read as zeros.
                content.resize(self.len as usize, 0);
                content
            }
            ViewBytes::Session(view) => slice(&view[..]),
            ViewBytes::Copied(bytes) => slice(bytes.as_slice()),
        }
    }

    /// Store through a writable view of a memory file.
    pub fn write_at(&self, at: u64, data: &[u8]) -> Result<usize, Win32Error> {
        let end = at.checked_add(data.len() as u64).ok_or(Win32Error::INVALID_PARAMETER)?;
        match &self.bytes {
            ViewBytes::Memory(file) if self.writable && end <= self.len => Ok(file.write_at(self.offset + at, data)),
            _ => Err(Win32Error::ACCESS_DENIED),
        }
    }
}

fn memory_file_info(file: &MemoryFile) -> EntryInformation {
    EntryInformation {
        attributes: FILE_ATTRIBUTE_NORMAL,
        volume_serial: file.volume_serial(),
        file_index: file.file_index(),
        last_write_time: file.file_time(),
        size: file.written_size(),
    }
}

fn directory_info() -> EntryInformation {
    EntryInformation {
        attributes: FILE_ATTRIBUTE_DIRECTORY,
        ..Default::default()
    }
}

const CONTENT_ACCESS: u32 = GENERIC_READ | GENERIC_WRITE | FILE_READ_DATA | FILE_WRITE_DATA | FILE_APPEND_DATA;

impl ProcessVirtualizationContext {
    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub fn get_file_attributes(&self, path: &str) -> FileAttributes {
        bump(&self.stats.attribute_queries);
        let calls = self.stats.rpc_calls();
        let attributes = self.query_attributes(path);
        let probe = if !attributes.exists {
            ProbeResult::NotFound
        } else if self.stats.rpc_calls() == calls {
            ProbeResult::FoundViaCache
        } else {
            ProbeResult::FoundViaRpc
        };
        self.file_states.probed(to_string_key(path), probe);
        attributes
    }

    fn query_attributes(&self, path: &str) -> FileAttributes {
        let rules = &self.options.rules;
        if !rules.can_detour(path) {
            return self.attributes_from_os(path);
        }
        let key = to_string_key(path);
        if let Some(info) = self.mapped_file_table.lookup(&key) {
            if let Some(file) = info.memory_file() {
                return FileAttributes::found(memory_file_info(file), true);
            }
            if info.deleted {
                return FileAttributes::missing(Win32Error::FILE_NOT_FOUND, true);
            }
        }
        if rules.keep_in_memory(path, false) {
            // Only ever exists as a memory file.
            return FileAttributes::missing(Win32Error::FILE_NOT_FOUND, true);
        }
        if is_drive_root(path) {
            return FileAttributes::found(directory_info(), true);
        }
        if self.options.allow_directory_cache {
            let offset = self.rpc_get_entry_offset(key, path, false);
            return match self.directory_table.get_entry_information(offset) {
                Some((info, _)) => FileAttributes::found(info, true),
                None => FileAttributes::missing(Win32Error::FILE_NOT_FOUND, true),
            };
        }
        self.attributes_from_os(path)
    }

    fn attributes_from_os(&self, path: &str) -> FileAttributes {
        bump(&self.stats.attribute_passthrough);
        match self.true_functions.metadata(path) {
            Ok(info) => FileAttributes::found(info, false),
            Err(e) => FileAttributes::missing(e, false),
        }
    }

    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    pub fn create_file(
        &self,
        path: &str,
        desired_access: u32,
        disposition: CreationDisposition,
        delete_on_close: bool,
    ) -> Result<DetouredHandle, Win32Error> {
        bump(&self.stats.create_file_calls);
        let rules = &self.options.rules;
        let key = to_string_key(path);
        if !rules.can_detour(path) {
            bump(&self.stats.create_file_passthrough);
            let file = self.true_functions.open(path, desired_access, disposition)?;
            return Ok(self.insert_file(FileObject::new(path, key, desired_access, FileSource::Disk(file))));
        }

        let is_write = has_write_access(desired_access);
        let throw_away = is_write && rules.is_throw_away(path);
        let is_output = rules.is_output_file(path);
        let keep_in_memory =
            rules.keep_in_memory(path, is_write) || ((is_write || delete_on_close) && is_output) || throw_away;

        if let Some(file) = self.mapped_file_table.memory_file(&key) {
            if disposition == CreationDisposition::CreateNew {
                return Err(Win32Error::FILE_EXISTS);
            }
            if disposition.truncates() {
                file.set_size(0);
            }
            return Ok(self.insert_memory_handle(path, key, desired_access, delete_on_close, file, false));
        }

        if rules.needs_shared_memory(path) {
            return self.open_temp_file(path, key, desired_access, delete_on_close, is_write);
        }

        if keep_in_memory {
            if !throw_away
                && matches!(
                    disposition,
                    CreationDisposition::OpenExisting | CreationDisposition::TruncateExisting
                )
            {
                return Err(Win32Error::FILE_NOT_FOUND);
            }
            let reserve = self.options.memory_file_reserve;
            let file = if is_output && !throw_away {
                MemoryFile::create_shared(self.shm_dir(), next_mapping_handle(), path, reserve)
            } else {
                MemoryFile::create_local(path, reserve, throw_away)
            }
            .map_err(|e| memory_file_error(path, e))?;
            let file = Arc::new(file);
            bump(&self.stats.memory_files_created);
            self.mapped_file_table.insert_memory_file(key, path, file.clone());
            return Ok(self.insert_memory_handle(path, key, desired_access, delete_on_close, file, true));
        }

        if self.mapped_file_table.is_deleted(&key) && !disposition.creates() {
            return Err(Win32Error::FILE_NOT_FOUND);
        }

        if desired_access & CONTENT_ACCESS == 0 && !delete_on_close {
            return self.open_attributes_only(path, key, desired_access);
        }
        if is_write || delete_on_close {
            return self.open_for_write(path, key, desired_access, disposition, delete_on_close);
        }
        self.open_for_read(path, key, desired_access, disposition)
    }

    /// No content is read, so the handle needs nothing but the attributes.
    fn open_attributes_only(&self, path: &str, key: StringKey, access: u32) -> Result<DetouredHandle, Win32Error> {
        let attributes = self.get_file_attributes(path);
        if !attributes.exists {
            return Err(Win32Error(attributes.last_error));
        }
        let source = if attributes.info.is_directory() {
            FileSource::Directory(attributes.info)
        } else {
            FileSource::AttributesOnly(attributes.info)
        };
        Ok(self.insert_file(FileObject::new(path, key, access, source)))
    }

    fn open_for_read(
        &self,
        path: &str,
        key: StringKey,
        access: u32,
        disposition: CreationDisposition,
    ) -> Result<DetouredHandle, Win32Error> {
        let known = |info: &FileInfo| !info.deleted && !info.name.is_empty();
        let mut dir_table_offset = TableOffset::INVALID;
        if self.options.allow_directory_cache {
            let offset = self.rpc_get_entry_offset(key, path, false);
            if offset.is_valid() {
                if let Some((info, _)) = self.directory_table.get_entry_information(offset) {
                    if info.is_directory() {
                        let mut object = FileObject::new(path, key, access, FileSource::Directory(info));
                        object.dir_table_offset = offset;
                        return Ok(self.insert_file(object));
                    }
                }
                dir_table_offset = offset;
            } else if !self.mapped_file_table.lookup(&key).is_some_and(|info| known(&info)) {
                return Err(Win32Error::FILE_NOT_FOUND);
            }
        }

        let info = match self.mapped_file_table.lookup(&key) {
            Some(info) if known(&info) => info,
            _ => {
                let reply = self.rpc_create_file(path, key, access, true);
                if reply.name.is_empty() {
                    return Err(Win32Error::FILE_NOT_FOUND);
                }
                self.mapped_file_table
                    .lookup(&key)
                    .ok_or(Win32Error::FILE_NOT_FOUND)?
            }
        };

        let source = self.source_for(path, key, &info, access, disposition)?;
        let mut object = FileObject::new(path, key, access, source);
        object.dir_table_offset = dir_table_offset;
        self.mapped_file_table.set_last_desired_access(&key, access);
        Ok(self.insert_file(object))
    }

    fn source_for(
        &self,
        path: &str,
        key: StringKey,
        info: &FileInfo,
        access: u32,
        disposition: CreationDisposition,
    ) -> Result<FileSource, Win32Error> {
        Ok(match &info.backing {
            FileBacking::Unbacked if info.name == EMPTY_DIRECTORY_NAME => FileSource::Directory(directory_info()),
            FileBacking::Unbacked => FileSource::Empty,
            FileBacking::Disk(real) => {
                let real = if real.is_empty() { path } else { real.as_str() };
                FileSource::Disk(self.true_functions.open(real, access, disposition)?)
            }
            FileBacking::SessionMapping { handle, offset } => {
                let view = self
                    .session_mapping(*handle)
                    .map_err(|e| memory_file_error(path, e))?;
                FileSource::SessionMapping {
                    view,
                    offset: *offset,
                    size: info.size,
                }
            }
            FileBacking::SharedFile { handle } => {
                let size = if info.size == INVALID_SIZE { 0 } else { info.size };
                let file = MemoryFile::open_shared(
                    self.shm_dir(),
                    *handle,
                    path,
                    size,
                    self.options.memory_file_reserve,
                )
                .map_err(|e| memory_file_error(path, e))?;
                let file = Arc::new(file);
                self.mapped_file_table.insert_memory_file(key, path, file.clone());
                FileSource::Memory(file)
            }
            FileBacking::Memory(file) => FileSource::Memory(file.clone()),
        })
    }

    /// Writes go to disk under the name the session hands out; the close
    /// id tells the session which open the later close belongs to.
    fn open_for_write(
        &self,
        path: &str,
        key: StringKey,
        access: u32,
        disposition: CreationDisposition,
        delete_on_close: bool,
    ) -> Result<DetouredHandle, Win32Error> {
        let reply = self.rpc_create_file(path, key, access, false);
        let real = match MappedName::parse(&reply.name) {
            MappedName::Path(real) => real.to_string(),
            _ => path.to_string(),
        };
        let file = match self.true_functions.open(&real, access, disposition) {
            Ok(file) => file,
            Err(e) => {
                if reply.close_id != 0 {
                    self.rpc_update_close_handle("", reply.close_id, false, "", MappingHandle::NONE, 0, false);
                }
                return Err(e);
            }
        };
        // Content under this key is changing; the session republishes it on close.
        self.mapped_file_table.remove(&key);
        let mut object = FileObject::new(path, key, access, FileSource::Disk(file));
        object.close_id = reply.close_id;
        object.delete_on_close = delete_on_close;
        log_detours_debug!("Opened for write", file = path, close_id = reply.close_id);
        Ok(self.insert_file(object))
    }

    /// Intermediate files shared between processes of one tool invocation.
    fn open_temp_file(
        &self,
        path: &str,
        key: StringKey,
        access: u32,
        delete_on_close: bool,
        is_write: bool,
    ) -> Result<DetouredHandle, Win32Error> {
        let reserve = self.options.memory_file_reserve;
        let file = match self.rpc_open_temp_file(key, path) {
            Some((handle, size)) => MemoryFile::open_shared(self.shm_dir(), handle, path, size, reserve),
            None if is_write => MemoryFile::create_shared(self.shm_dir(), next_mapping_handle(), path, reserve),
            None => return Err(Win32Error::FILE_NOT_FOUND),
        }
        .map_err(|e| memory_file_error(path, e))?;
        let file = Arc::new(file);
        bump(&self.stats.memory_files_created);
        self.mapped_file_table.insert_memory_file(key, path, file.clone());
        Ok(self.insert_memory_handle(path, key, access, delete_on_close, file, true))
    }

    fn insert_memory_handle(
        &self,
        path: &str,
        key: StringKey,
        access: u32,
        delete_on_close: bool,
        file: Arc<MemoryFile>,
        owns_file_info: bool,
    ) -> DetouredHandle {
        let mut object = FileObject::new(path, key, access, FileSource::Memory(file));
        object.delete_on_close = delete_on_close;
        object.owns_file_info = owns_file_info;
        self.insert_file(object)
    }

    fn insert_file(&self, object: FileObject) -> DetouredHandle {
        self.file_states.opened(object.key, object.memory_file().is_some());
        self.files.insert(HandleEntry::File(Arc::new(Mutex::new(object))))
    }

    fn file_object(&self, handle: DetouredHandle) -> Result<Arc<Mutex<FileObject>>, Win32Error> {
        match self.files.get(handle) {
            Some(HandleEntry::File(object)) => Ok(object),
            _ => Err(Win32Error::INVALID_HANDLE),
        }
    }

    // ------------------------------------------------------------------
    // Handle operations
    // ------------------------------------------------------------------

    pub fn read_file(&self, handle: DetouredHandle, buf: &mut [u8]) -> Result<usize, Win32Error> {
        let object = self.file_object(handle)?;
        let mut object = lock(&object);
        let position = object.position;
        let count = match &mut object.source {
            FileSource::Memory(file) => file.read_at(position, buf),
            FileSource::SessionMapping { view, offset, size } => {
                if position >= *size {
                    0
                } else {
                    let start = (*offset + position) as usize;
                    let count = ((*size - position) as usize).min(buf.len());
                    let available = view.len().saturating_sub(start).min(count);
                    buf[..available].copy_from_slice(&view[start..start + available]);
                    available
                }
            }
            FileSource::Disk(file) => {
                file.seek(SeekFrom::Start(position)).map_err(|e| Win32Error::from(&e))?;
                file.read(buf).map_err(|e| Win32Error::from(&e))?
            }
            FileSource::Empty => 0,
            FileSource::AttributesOnly(_) | FileSource::Directory(_) => return Err(Win32Error::ACCESS_DENIED),
        };
        object.position += count as u64;
        Ok(count)
    }

    pub fn write_file(&self, handle: DetouredHandle, data: &[u8]) -> Result<usize, Win32Error> {
        let object = self.file_object(handle)?;
        let mut object = lock(&object);
        if !has_write_access(object.desired_access) {
            return Err(Win32Error::ACCESS_DENIED);
        }
        let position = object.position;
        let count = match &mut object.source {
            FileSource::Memory(file) => {
                add(&self.stats.memory_bytes_written, data.len() as u64);
                file.write_at(position, data)
            }
            FileSource::Disk(file) => {
                file.seek(SeekFrom::Start(position)).map_err(|e| Win32Error::from(&e))?;
                file.write_all(data).map_err(|e| Win32Error::from(&e))?;
                data.len()
            }
            _ => return Err(Win32Error::ACCESS_DENIED),
        };
        object.position += count as u64;
        Ok(count)
    }

    fn object_size(object: &FileObject) -> Result<u64, Win32Error> {
        Ok(match &object.source {
            FileSource::Memory(file) => file.written_size(),
            FileSource::SessionMapping { size, .. } => *size,
            FileSource::Disk(file) => file.metadata().map_err(|e| Win32Error::from(&e))?.len(),
            FileSource::AttributesOnly(info) => info.size,
            FileSource::Directory(_) | FileSource::Empty => 0,
        })
    }

    /// Move the file pointer; returns the new position.
    pub fn set_file_pointer(&self, handle: DetouredHandle, distance: i64, method: MoveMethod) -> Result<u64, Win32Error> {
        let object = self.file_object(handle)?;
        let mut object = lock(&object);
        let base = match method {
            MoveMethod::Begin => 0,
            MoveMethod::Current => object.position,
            MoveMethod::End => Self::object_size(&object)?,
        };
        let position = (base as i64).checked_add(distance).ok_or(Win32Error::INVALID_PARAMETER)?;
        if position < 0 {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        object.position = position as u64;
        Ok(object.position)
    }

    pub fn get_file_size(&self, handle: DetouredHandle) -> Result<u64, Win32Error> {
        let object = self.file_object(handle)?;
        let object = lock(&object);
        Self::object_size(&object)
    }

    /// Truncate or extend the file to the current file pointer.
    pub fn set_end_of_file(&self, handle: DetouredHandle) -> Result<(), Win32Error> {
        let object = self.file_object(handle)?;
        let object = lock(&object);
        if !has_write_access(object.desired_access) {
            return Err(Win32Error::ACCESS_DENIED);
        }
        match &object.source {
            FileSource::Memory(file) => file.set_size(object.position),
            FileSource::Disk(file) => file.set_len(object.position).map_err(|e| Win32Error::from(&e))?,
            _ => return Err(Win32Error::ACCESS_DENIED),
        }
        Ok(())
    }

    pub fn get_file_information_by_handle(&self, handle: DetouredHandle) -> Result<EntryInformation, Win32Error> {
        let object = self.file_object(handle)?;
        let object = lock(&object);
        if let FileSource::Memory(file) = &object.source {
            return Ok(memory_file_info(file));
        }
        if let Some((info, _)) = self.directory_table.get_entry_information(object.dir_table_offset) {
            return Ok(info);
        }
        Ok(match &object.source {
            FileSource::AttributesOnly(info) | FileSource::Directory(info) => *info,
            FileSource::Disk(file) => info_from_metadata(&file.metadata().map_err(|e| Win32Error::from(&e))?),
            _ => EntryInformation {
                attributes: FILE_ATTRIBUTE_NORMAL,
                size: Self::object_size(&object)?,
                ..Default::default()
            },
        })
    }

    /// Rename the file when its last handle closes.
    pub fn set_rename_on_close(&self, handle: DetouredHandle, new_name: &str) -> Result<(), Win32Error> {
        let object = self.file_object(handle)?;
        lock(&object).new_name = new_name.to_string();
        Ok(())
    }

    /// A mapping object over the file. A `max_size` of zero maps the whole
    /// file; a larger writable mapping extends a memory file.
    pub fn create_file_mapping(
        &self,
        handle: DetouredHandle,
        max_size: u64,
        writable: bool,
    ) -> Result<DetouredHandle, Win32Error> {
        let file = self.file_object(handle)?;
        let size = {
            let object = lock(&file);
            if writable && !has_write_access(object.desired_access) {
                return Err(Win32Error::ACCESS_DENIED);
            }
            let current = Self::object_size(&object)?;
            if max_size > current {
                match object.memory_file() {
                    Some(memory) if writable => memory.set_size(max_size),
                    _ => return Err(Win32Error::INVALID_PARAMETER),
                }
            }
            if max_size == 0 {
                current
            } else {
                max_size
            }
        };
        Ok(self.files.insert(HandleEntry::Mapping(MappingObject { file, size, writable })))
    }

    /// View `len` bytes at `offset` of a mapping; zero maps to the end.
    pub fn map_view_of_file(&self, mapping: DetouredHandle, offset: u64, len: u64) -> Result<MappedView, Win32Error> {
        let Some(HandleEntry::Mapping(mapping)) = self.files.get(mapping) else {
            return Err(Win32Error::INVALID_HANDLE);
        };
        if offset > mapping.size {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let len = if len == 0 { mapping.size - offset } else { len };
        match offset.checked_add(len) {
            Some(end) if end <= mapping.size => {}
            _ => return Err(Win32Error::INVALID_PARAMETER),
        }
        let mut object = lock(&mapping.file);
        let (bytes, offset) = match &mut object.source {
            FileSource::Memory(file) => (ViewBytes::Memory(file.clone()), offset),
            FileSource::SessionMapping { view, offset: base, .. } => (ViewBytes::Session(view.clone()), *base + offset),
            FileSource::Disk(file) => {
                let mut content = Vec::new();
                file.seek(SeekFrom::Start(0)).map_err(|e| Win32Error::from(&e))?;
                file.read_to_end(&mut content).map_err(|e| Win32Error::from(&e))?;
                (ViewBytes::Copied(content), offset)
            }
            _ => (ViewBytes::Copied(Vec::new()), offset),
        };
        Ok(MappedView {
            bytes,
            offset,
            len,
            writable: mapping.writable,
        })
    }

    pub fn duplicate_handle(&self, handle: DetouredHandle) -> Result<DetouredHandle, Win32Error> {
        let entry = self.files.get(handle).ok_or(Win32Error::INVALID_HANDLE)?;
        if let HandleEntry::File(object) = &entry {
            lock(object).ref_count += 1;
        }
        Ok(self.files.insert(entry))
    }

    pub fn close_handle(&self, handle: DetouredHandle) -> Result<(), Win32Error> {
        bump(&self.stats.close_handle_calls);
        if handle.is_list_directory() {
            return self.find_close(handle);
        }
        let entry = self.files.remove(handle).ok_or(Win32Error::INVALID_HANDLE)?;
        let HandleEntry::File(object) = entry else {
            return Ok(());
        };
        let mut object = lock(&object);
        object.ref_count = object.ref_count.saturating_sub(1);
        if object.ref_count > 0 {
            return Ok(());
        }
        let key = object.key;
        self.finish_file(&mut object);
        self.file_states.closed(&key);
        Ok(())
    }

    /// Last close of a file object: settle memory files and tell the
    /// session about written outputs.
    fn finish_file(&self, object: &mut FileObject) {
        let rules = &self.options.rules;
        let is_write = has_write_access(object.desired_access);
        let mut mapping_handle = MappingHandle::NONE;
        let mut written = 0;

        if let Some(file) = object.memory_file().cloned() {
            if is_write {
                file.close_write();
            }
            let is_output = rules.is_output_file(&object.file_name);
            if (object.delete_on_close || is_write) && is_output && !file.is_throw_away() {
                if file.mark_reported() {
                    let target = if object.new_name.is_empty() {
                        object.file_name.clone()
                    } else {
                        object.new_name.clone()
                    };
                    let target_key = to_string_key(&target);
                    let reply = self.rpc_create_file(&target, target_key, GENERIC_WRITE, false);
                    object.close_id = reply.close_id;
                    if !object.new_name.is_empty() {
                        self.mapped_file_table.rename(&object.key, target_key, &target);
                        object.file_name = target;
                        object.key = target_key;
                        object.new_name.clear();
                    }
                }
                mapping_handle = file.mapping_handle();
                written = file.written_size();
            } else if is_write && rules.needs_shared_memory(&object.file_name) {
                self.rpc_create_temp_file(object.key, &object.file_name, file.mapping_handle(), file.written_size());
            }
            self.mapped_file_table.update_size(&object.key, file.written_size());
        } else if let FileSource::Disk(file) = &object.source {
            if object.close_id != 0 {
                written = file.metadata().map(|m| m.len()).unwrap_or_default();
            }
        }

        if object.close_id != 0 {
            self.rpc_update_close_handle(
                &object.file_name,
                object.close_id,
                object.delete_on_close,
                &object.new_name,
                mapping_handle,
                written,
                true,
            );
            log_detours_debug!(
                "Reported close",
                file = object.file_name.as_str(),
                close_id = object.close_id,
                written = written
            );
        }
        if object.delete_on_close {
            if object.owns_file_info && object.close_id == 0 {
                self.mapped_file_table.remove(&object.key);
            }
            self.mapped_file_table.set_deleted(object.key, &object.file_name, true);
        }
        // Drop an OS handle now rather than whenever the last clone of the
        // object goes away.
        object.source = FileSource::Empty;
    }

    // ------------------------------------------------------------------
    // Path operations
    // ------------------------------------------------------------------

    pub fn delete_file(&self, path: &str) -> Result<(), Win32Error> {
        if !self.options.rules.can_detour(path) {
            return self.true_functions.delete_file(path);
        }
        let key = to_string_key(path);
        if let Some(file) = self.mapped_file_table.memory_file(&key) {
            if file.is_reported() && self.options.rules.is_output_file(path) {
                return self.rpc_delete_file(path, key, 0);
            }
            self.mapped_file_table.set_deleted(key, path, true);
            log_detours_debug!("Deleted memory file", file = path);
            return Ok(());
        }
        if self.mapped_file_table.is_deleted(&key) {
            return Err(Win32Error::FILE_NOT_FOUND);
        }
        self.rpc_delete_file(path, key, 0)
    }

    pub fn create_directory(&self, path: &str) -> Result<(), Win32Error> {
        if !self.options.rules.can_detour(path) {
            return self.true_functions.create_directory(path);
        }
        self.rpc_create_directory(path, to_string_key(path))
    }

    pub fn remove_directory(&self, path: &str) -> Result<(), Win32Error> {
        if !self.options.rules.can_detour(path) {
            return self.true_functions.remove_directory(path);
        }
        self.rpc_remove_directory(path, to_string_key(path))
    }

    pub fn move_file(&self, from: &str, to: &str, flags: u32) -> Result<(), Win32Error> {
        let rules = &self.options.rules;
        if !rules.can_detour(from) || !rules.can_detour(to) {
            return self
                .true_functions
                .move_file(from, to, flags & MOVEFILE_REPLACE_EXISTING != 0);
        }
        let from_key = to_string_key(from);
        let Some(file) = self.mapped_file_table.memory_file(&from_key) else {
            return self.rpc_move_file(from, to, flags);
        };

        if flags & MOVEFILE_REPLACE_EXISTING == 0 && self.get_file_attributes(to).exists {
            return Err(Win32Error::ALREADY_EXISTS);
        }
        if file.is_reported() && rules.is_output_file(from) {
            return self.rpc_move_file(from, to, flags);
        }
        let to_key = to_string_key(to);
        self.mapped_file_table.rename(&from_key, to_key, to);
        log_detours_debug!("Moved memory file", from = from, to = to);

        // Written under a temporary name, now an output under its final one.
        if rules.is_output_file(to) && !file.is_local_only() && file.mark_reported() {
            let reply = self.rpc_create_file(to, to_key, GENERIC_WRITE, false);
            if reply.close_id != 0 {
                self.rpc_update_close_handle(
                    to,
                    reply.close_id,
                    false,
                    "",
                    file.mapping_handle(),
                    file.written_size(),
                    true,
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory enumeration
    // ------------------------------------------------------------------

    /// Start enumerating `path`, a directory followed by a wildcard pattern.
    pub fn find_first_file(&self, path: &str) -> Result<(DetouredHandle, DirectoryEntry), Win32Error> {
        bump(&self.stats.find_first_file_calls);
        let (dir, pattern) = split_parent(path).ok_or(Win32Error::INVALID_PARAMETER)?;
        let mut entries = self.list_directory_entries(dir)?;

        entries.retain(|entry| !self.mapped_file_table.is_deleted(&to_string_key(&join(dir, &entry.name))));
        for (name, file) in self.mapped_file_table.memory_files_in(dir) {
            if !entries.iter().any(|entry| entry.name.eq_ignore_ascii_case(&name)) {
                entries.push(DirectoryEntry {
                    name,
                    info: memory_file_info(&file),
                });
            }
        }

        let dir_attributes = self.get_file_attributes(dir);
        let dir_info = if dir_attributes.exists {
            dir_attributes.info
        } else {
            directory_info()
        };
        let mut listing = ListDirectoryHandle::new(dir, pattern, dir_info, entries);
        let first = listing.next_entry().ok_or(Win32Error::FILE_NOT_FOUND)?;
        let handle = self.list_directories.insert(Arc::new(Mutex::new(listing)));
        Ok((handle, first))
    }

    fn list_directory_entries(&self, dir: &str) -> Result<Vec<DirectoryEntry>, Win32Error> {
        if !self.options.allow_directory_cache || !self.options.rules.can_detour(dir) {
            return self.true_functions.list_directory(dir);
        }
        if let Some(entries) = self.directory_table.list_directory(dir) {
            return Ok(entries);
        }
        let key = to_string_key(dir);
        if self.directory_table.directory_offset(&key).is_none() {
            self.rpc_update_directory(key, dir);
            if let Some(entries) = self.directory_table.list_directory(dir) {
                return Ok(entries);
            }
        }
        Err(Win32Error::PATH_NOT_FOUND)
    }

    pub fn find_next_file(&self, handle: DetouredHandle) -> Result<DirectoryEntry, Win32Error> {
        let listing = self.list_directories.get(handle).ok_or(Win32Error::INVALID_HANDLE)?;
        let next = lock(&listing).next_entry();
        next.ok_or(Win32Error::NO_MORE_FILES)
    }

    pub fn find_close(&self, handle: DetouredHandle) -> Result<(), Win32Error> {
        self.list_directories
            .remove(handle)
            .map(|_| ())
            .ok_or(Win32Error::INVALID_HANDLE)
    }

    /// Path of an open file with every component spelled the way the
    /// session listed it.
    pub fn get_final_path_name(&self, handle: DetouredHandle) -> Result<String, Win32Error> {
        let object = self.file_object(handle)?;
        let object = lock(&object);
        if object.memory_file().is_some() {
            return Ok(object.file_name.clone());
        }
        Ok(self.directory_table.get_final_path(&object.file_name))
    }
}

fn memory_file_error(path: &str, error: std::io::Error) -> Win32Error {
    log_detours_warn!(
        "Memory file unavailable",
        file = path,
        error = error.to_string().as_str()
    );
    Win32Error::from(&error)
}
