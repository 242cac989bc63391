//! Request handling for the session.
//!
//! The handler owns the file system view and both shared table writers. Every
//! change to the view is published into the tables before the reply is sent,
//! and every reply carries the new table sizes so the client parses exactly
//! what the change produced.

use crate::directory_table::DirectoryTableWriter;
use crate::file_system::{Content, Node, SessionFileSystem};
use crate::file_table::FileMappingTableWriter;
use crate::shared_table::SharedTable;
use crate::SessionError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use uba_config::{log_session_debug, log_session_info, log_session_warn, SessionConfig};
use uba_ipc::messages::{
    CreateFileReply, CreateTempFileReply, FileOperationReply, OpenTempFileReply, TempFileUpdate,
    UpdateCloseHandleReply, UpdateDirectoryReply, UpdateTablesReply,
};
use uba_ipc::path::split_parent;
use uba_ipc::table_types::{
    DirectoryItem, DIRECTORY_TABLE_FILE, EMPTY_DIRECTORY_NAME, EMPTY_FILE_NAME, FILE_MAPPING_TABLE_FILE,
    ORIGINAL_NAME,
};
use uba_ipc::win32::{has_write_access, MOVEFILE_REPLACE_EXISTING};
use uba_ipc::{
    to_string_key, BinaryReader, MappedName, MappingHandle, Reply, Request, StringKey, TableOffset, Win32Error,
};

/// Session mapping handles start here; process-created shared files use
/// `pid << 20 | n`, which stays below it.
pub const SESSION_MAPPING_BASE: u64 = 1 << 48;

#[derive(Debug, Clone)]
struct TempFile {
    mapping_handle: MappingHandle,
    size: u64,
}

pub struct SessionHandler {
    shm_dir: PathBuf,
    fs: SessionFileSystem,
    directories: DirectoryTableWriter,
    files: FileMappingTableWriter,
    temp_files: HashMap<StringKey, TempFile>,
    /// Outputs opened for writing, by close id.
    open_writes: HashMap<u32, String>,
    /// Directories a client asked for before they existed.
    missing_directories: HashSet<StringKey>,
    next_close_id: u32,
    next_mapping_handle: u64,
}

impl SessionHandler {
    pub fn new(config: &SessionConfig, host_passthrough: bool) -> Result<Self, SessionError> {
        std::fs::create_dir_all(&config.shm_dir)?;
        let directories = SharedTable::create(
            &config.shm_dir.join(DIRECTORY_TABLE_FILE),
            config.directory_table_capacity,
            "directory",
        )?;
        let files = SharedTable::create(
            &config.shm_dir.join(FILE_MAPPING_TABLE_FILE),
            config.file_table_capacity,
            "file",
        )?;
        log_session_info!(
            "Session tables created",
            shm_dir = config.shm_dir.display().to_string().as_str(),
            host_passthrough = host_passthrough
        );
        Ok(Self {
            shm_dir: config.shm_dir.clone(),
            fs: SessionFileSystem::new(host_passthrough),
            directories: DirectoryTableWriter::new(directories),
            files: FileMappingTableWriter::new(files),
            temp_files: HashMap::new(),
            open_writes: HashMap::new(),
            missing_directories: HashSet::new(),
            next_close_id: 0,
            next_mapping_handle: SESSION_MAPPING_BASE,
        })
    }

    pub fn shm_dir(&self) -> &Path {
        &self.shm_dir
    }

    pub fn directory_table_size(&self) -> u32 {
        self.directories.size()
    }

    pub fn file_table_size(&self) -> u32 {
        self.files.size()
    }

    pub fn file_system(&mut self) -> &mut SessionFileSystem {
        &mut self.fs
    }

    // ------------------------------------------------------------------
    // Coordinator-side changes
    // ------------------------------------------------------------------

    pub fn add_directory(&mut self, path: &str) -> Result<(), SessionError> {
        let first_missing = self.first_missing(path);
        self.fs.add_directory(path);
        self.publish_created(&first_missing, path)
    }

    /// Register a file whose content is on the host disk at `path`.
    pub fn add_disk_file(&mut self, path: &str, size: u64) -> Result<(), SessionError> {
        let first_missing = self.first_missing(path);
        self.fs.add_file(path, size, Content::Disk);
        self.publish_created(&first_missing, path)
    }

    /// Register a file whose content the session serves from shared memory.
    pub fn add_virtual_file(&mut self, path: &str, content: &[u8]) -> Result<MappingHandle, SessionError> {
        self.add_virtual_files(&[(path, content)])
    }

    /// Pack several files into one session mapping.
    pub fn add_virtual_files(&mut self, entries: &[(&str, &[u8])]) -> Result<MappingHandle, SessionError> {
        self.next_mapping_handle += 1;
        let handle = MappingHandle(self.next_mapping_handle);

        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for (_, content) in entries {
            offsets.push(data.len() as u64);
            data.extend_from_slice(content);
        }
        std::fs::write(self.shm_dir.join(handle.file_name()), &data)?;

        for ((path, content), offset) in entries.iter().zip(offsets) {
            let first_missing = self.first_missing(path);
            self.fs
                .add_file(path, content.len() as u64, Content::Mapping { handle, offset });
            self.publish_created(&first_missing, path)?;
        }
        log_session_debug!("Wrote session mapping", handle = handle.0, files = entries.len());
        Ok(handle)
    }

    /// Delete a file on the coordinator side.
    pub fn remove_file(&mut self, path: &str) -> Result<(), SessionError> {
        if self.fs.remove(path).is_some() {
            self.publish_removed(path)?;
            self.files.mark_deleted(to_string_key(path))?;
        }
        Ok(())
    }

    /// Write a directory listing ahead of any client asking for it.
    pub fn preload_directory(&mut self, path: &str) -> Result<TableOffset, SessionError> {
        if let Some(offset) = self.directories.directory_offset(&to_string_key(path)) {
            return Ok(offset);
        }
        Ok(self.write_listing(path)?.unwrap_or(TableOffset::INVALID))
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Decode a request, handle it and encode the reply.
    pub fn handle_bytes(&mut self, request: &[u8]) -> Result<Vec<u8>, SessionError> {
        let request = Request::read(&mut BinaryReader::new(request))?;
        Ok(self.handle_request(request)?.to_bytes())
    }

    pub fn handle_request(&mut self, request: Request) -> Result<Reply, SessionError> {
        log_session_debug!("Request", kind = format!("{:?}", request.message_type()).as_str());
        let reply = match request {
            Request::UpdateDirectory { dir_key, dir_name } => {
                Reply::UpdateDirectory(self.update_directory(dir_key, &dir_name)?)
            }
            Request::UpdateTables => Reply::UpdateTables(self.update_tables()),
            Request::CreateFile {
                file_name,
                file_key,
                access,
            } => Reply::CreateFile(self.create_file(&file_name, file_key, access)?),
            Request::UpdateCloseHandle {
                file_name,
                close_id,
                delete_on_close,
                new_name,
                mapping_handle,
                mapping_written,
                success,
            } => Reply::UpdateCloseHandle(self.update_close_handle(
                &file_name,
                close_id,
                delete_on_close,
                &new_name,
                mapping_handle,
                mapping_written,
                success,
            )?),
            Request::DeleteFile {
                file_name, file_key, ..
            } => {
                let result = self.delete_file(&file_name, file_key);
                Reply::FileOperation(self.file_operation_reply(result)?)
            }
            Request::CreateDirectory { dir_name, .. } => {
                let result = self.create_directory(&dir_name);
                Reply::FileOperation(self.file_operation_reply(result)?)
            }
            Request::RemoveDirectory { dir_name, .. } => {
                let result = self.remove_directory(&dir_name);
                Reply::FileOperation(self.file_operation_reply(result)?)
            }
            Request::MoveFile {
                from,
                from_key,
                to,
                to_key,
                flags,
            } => {
                let result = self.move_file(&from, from_key, &to, to_key, flags);
                Reply::FileOperation(self.file_operation_reply(result)?)
            }
            Request::CreateTempFile {
                file_key,
                file_name,
                mapping_handle,
                size,
            } => {
                log_session_debug!("Temp file update", file = file_name.as_str(), size = size);
                self.temp_files.insert(file_key, TempFile { mapping_handle, size });
                Reply::CreateTempFile(CreateTempFileReply { success: true })
            }
            Request::OpenTempFile { file_key, .. } => {
                let reply = match self.temp_files.get(&file_key) {
                    Some(temp) => OpenTempFileReply {
                        mapping_handle: temp.mapping_handle,
                        size: temp.size,
                    },
                    None => OpenTempFileReply {
                        mapping_handle: MappingHandle::NONE,
                        size: 0,
                    },
                };
                Reply::OpenTempFile(reply)
            }
        };
        Ok(reply)
    }

    fn update_directory(&mut self, dir_key: StringKey, dir_name: &str) -> Result<UpdateDirectoryReply, SessionError> {
        let table_offset = match self.directories.directory_offset(&dir_key) {
            Some(offset) => offset,
            None => match self.write_listing(dir_name)? {
                Some(offset) => offset,
                None => {
                    self.missing_directories.insert(dir_key);
                    TableOffset::INVALID
                }
            },
        };
        Ok(UpdateDirectoryReply {
            table_offset,
            directory_table_size: self.directories.size(),
            file_table_size: self.files.size(),
        })
    }

    fn update_tables(&self) -> UpdateTablesReply {
        UpdateTablesReply {
            directory_table_size: self.directories.size(),
            file_table_size: self.files.size(),
            temp_files: self
                .temp_files
                .iter()
                .map(|(key, temp)| TempFileUpdate {
                    file_key: *key,
                    mapping_handle: temp.mapping_handle,
                    size: temp.size,
                })
                .collect(),
        }
    }

    fn create_file(&mut self, file_name: &str, file_key: StringKey, access: u32) -> Result<CreateFileReply, SessionError> {
        let mut close_id = 0;
        let (name, size) = if has_write_access(access) {
            self.next_close_id += 1;
            close_id = self.next_close_id;
            self.open_writes.insert(close_id, file_name.to_string());
            (ORIGINAL_NAME.to_string(), 0)
        } else {
            match self.fs.lookup(file_name).cloned() {
                None => (String::new(), 0),
                Some(node) if node.is_directory() => (EMPTY_DIRECTORY_NAME.to_string(), 0),
                Some(node) => {
                    let name = mapped_name(&node, file_name);
                    self.files.add(file_key, &name, node.size)?;
                    (name, node.size)
                }
            }
        };
        Ok(CreateFileReply {
            name,
            size,
            close_id,
            directory_table_size: self.directories.size(),
            file_table_size: self.files.size(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn update_close_handle(
        &mut self,
        file_name: &str,
        close_id: u32,
        delete_on_close: bool,
        new_name: &str,
        mapping_handle: MappingHandle,
        mapping_written: u64,
        success: bool,
    ) -> Result<UpdateCloseHandleReply, SessionError> {
        if close_id != 0 && self.open_writes.remove(&close_id).is_none() {
            log_session_warn!("Close for unknown close id", close_id = close_id, file = file_name);
        }
        if success {
            if delete_on_close {
                if self.fs.delete_file(file_name).is_ok() {
                    self.publish_removed(file_name)?;
                }
                self.files.mark_deleted(to_string_key(file_name))?;
            } else {
                self.register_output(file_name, new_name, mapping_handle, mapping_written)?;
            }
        }
        Ok(UpdateCloseHandleReply {
            directory_table_size: self.directories.size(),
        })
    }

    fn register_output(
        &mut self,
        file_name: &str,
        new_name: &str,
        mapping_handle: MappingHandle,
        written: u64,
    ) -> Result<(), SessionError> {
        let final_name = if new_name.is_empty() { file_name } else { new_name };
        let renamed = final_name != file_name;
        let replaces_old = renamed && self.fs.exists(file_name);
        let first_missing = self.first_missing(final_name);

        if mapping_handle.is_none() {
            if renamed && self.fs.host_passthrough() {
                if let Err(e) = self.fs.move_entry(file_name, final_name, true) {
                    log_session_warn!("Rename on close failed", file = file_name, error = e.code());
                }
            }
            let node = self.fs.refresh_from_disk(final_name, written).clone();
            self.files.add(to_string_key(final_name), &mapped_name(&node, final_name), node.size)?;
        } else {
            self.fs
                .add_file(final_name, written, Content::Shared { handle: mapping_handle });
            self.files
                .add(to_string_key(final_name), &MappedName::shared_file(mapping_handle), written)?;
        }

        if replaces_old {
            self.fs.remove(file_name);
            self.publish_removed(file_name)?;
            self.files.mark_deleted(to_string_key(file_name))?;
        }
        log_session_debug!("Registered output", file = final_name, size = written);
        self.publish_created(&first_missing, final_name)
    }

    fn delete_file(&mut self, file_name: &str, file_key: StringKey) -> Result<Result<(), Win32Error>, SessionError> {
        if let Err(e) = self.fs.delete_file(file_name) {
            return Ok(Err(e));
        }
        self.temp_files.remove(&file_key);
        self.publish_removed(file_name)?;
        self.files.mark_deleted(file_key)?;
        Ok(Ok(()))
    }

    fn create_directory(&mut self, dir_name: &str) -> Result<Result<(), Win32Error>, SessionError> {
        if let Err(e) = self.fs.create_directory(dir_name) {
            return Ok(Err(e));
        }
        self.publish_entry(dir_name)?;
        // An empty listing replaces any negative entry the client holds.
        if self.directories.directory_offset(&to_string_key(dir_name)).is_none() {
            self.write_listing(dir_name)?;
        }
        Ok(Ok(()))
    }

    fn remove_directory(&mut self, dir_name: &str) -> Result<Result<(), Win32Error>, SessionError> {
        if let Err(e) = self.fs.remove_directory(dir_name) {
            return Ok(Err(e));
        }
        self.publish_removed(dir_name)?;
        self.directories.remove_directory(dir_name)?;
        Ok(Ok(()))
    }

    fn move_file(
        &mut self,
        from: &str,
        from_key: StringKey,
        to: &str,
        to_key: StringKey,
        flags: u32,
    ) -> Result<Result<(), Win32Error>, SessionError> {
        let first_missing = self.first_missing(to);
        let moved = match self.fs.move_entry(from, to, flags & MOVEFILE_REPLACE_EXISTING != 0) {
            Ok(node) => node,
            Err(e) => return Ok(Err(e)),
        };
        self.publish_removed(from)?;
        if moved.is_directory() {
            self.directories.remove_directory(from)?;
        }
        if let Some((name, size)) = self.files.entry(&from_key).map(|(n, s)| (n.to_string(), s)) {
            if !name.is_empty() {
                let name = if name == ORIGINAL_NAME { from.to_string() } else { name };
                self.files.add(to_key, &name, size)?;
            }
            self.files.mark_deleted(from_key)?;
        }
        self.publish_created(&first_missing, to)?;
        Ok(Ok(()))
    }

    fn file_operation_reply(&self, result: Result<Result<(), Win32Error>, SessionError>) -> Result<FileOperationReply, SessionError> {
        let (success, error_code) = match result? {
            Ok(()) => (true, 0),
            Err(e) => (false, e.code()),
        };
        Ok(FileOperationReply {
            success,
            error_code,
            directory_table_size: self.directories.size(),
        })
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    fn write_listing(&mut self, path: &str) -> Result<Option<TableOffset>, SessionError> {
        let Some(children) = self.fs.list(path) else {
            return Ok(None);
        };
        let Some(info) = self.fs.lookup(path).map(Node::info) else {
            return Ok(None);
        };
        let items = children.iter().map(Node::to_item).collect();
        Ok(Some(self.directories.write_directory(path, info, items)?))
    }

    /// Topmost ancestor of `path`, or `path` itself, that does not exist yet.
    fn first_missing(&mut self, path: &str) -> String {
        let mut target = path;
        while let Some((parent, _)) = split_parent(target) {
            if self.fs.exists(parent) {
                break;
            }
            target = parent;
        }
        target.to_string()
    }

    /// Publish a new or changed subtree rooted at `first_missing`, which
    /// contains `path`.
    fn publish_created(&mut self, first_missing: &str, path: &str) -> Result<(), SessionError> {
        self.publish_entry(first_missing)?;
        let mut dir = path;
        while let Some((parent, _)) = split_parent(dir) {
            if parent.len() <= first_missing.len() {
                break;
            }
            self.refresh_tracked_directory(parent)?;
            dir = parent;
        }
        Ok(())
    }

    /// Append the entry at `path` to its parent's listing.
    fn publish_entry(&mut self, path: &str) -> Result<(), SessionError> {
        let Some(node) = self.fs.lookup(path).cloned() else {
            return Ok(());
        };
        if let Some((parent, _)) = split_parent(path) {
            self.directories.append_items(parent, vec![node.to_item()])?;
        }
        if node.is_directory() {
            self.refresh_tracked_directory(path)?;
        }
        Ok(())
    }

    fn publish_removed(&mut self, path: &str) -> Result<(), SessionError> {
        if let Some((parent, name)) = split_parent(path) {
            self.directories.append_items(parent, vec![DirectoryItem::tombstone(name)])?;
        }
        Ok(())
    }

    /// Rewrite a directory that a client has seen as missing or removed.
    fn refresh_tracked_directory(&mut self, path: &str) -> Result<(), SessionError> {
        let key = to_string_key(path);
        if self.missing_directories.remove(&key) || self.directories.directory_offset(&key).is_some() {
            self.write_listing(path)?;
        }
        Ok(())
    }
}

/// Name handed to a reader of `node`, opened as `requested`.
fn mapped_name(node: &Node, requested: &str) -> String {
    match node.content {
        Content::Mapping { .. } | Content::Shared { .. } if node.size == 0 => EMPTY_FILE_NAME.to_string(),
        Content::Mapping { handle, offset } => MappedName::mapping(handle, offset),
        Content::Shared { handle } => MappedName::shared_file(handle),
        Content::Disk if node.path == requested => ORIGINAL_NAME.to_string(),
        Content::Disk => node.path.clone(),
    }
}
