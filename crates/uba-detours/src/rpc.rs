//! Messages to the session.
//!
//! A call encodes the request, holds the communication lock for the round
//! trip and decodes the reply. Every reply reports how far the session has
//! written its tables; the directory table is caught up first, then the
//! file-mapping table, before the caller sees the result. A broken
//! connection leaves the process with no consistent view of the file system
//! and is fatal.

use uba_config::{log_rpc_debug, log_rpc_warn};
use uba_ipc::messages::{
    CreateFileReply, CreateTempFileReply, FileOperationReply, OpenTempFileReply, UpdateCloseHandleReply,
    UpdateDirectoryReply, UpdateTablesReply,
};
use uba_ipc::path::{split_parent, trim_trailing_separators};
use uba_ipc::{
    to_string_key, BinaryReader, BinaryWriter, MappingHandle, Request, StringKey, TableOffset, Win32Error,
};

use crate::context::ProcessVirtualizationContext;
use crate::directory_table::{DirectoryTable, Exists};
use crate::fatal;
use crate::stats::{add, bump};
use crate::sync::lock;

impl ProcessVirtualizationContext {
    fn rpc_call(&self, request: &Request) -> Vec<u8> {
        let (sent, reply) = {
            let mut communication = lock(&self.communication);
            let communication = &mut *communication;
            let mut writer = BinaryWriter::new(&mut communication.send_buffer);
            request.write(&mut writer);
            let len = writer.position();
            match communication.transport.call(&communication.send_buffer[..len]) {
                Ok(reply) => (len, reply),
                Err(e) => fatal!("Message {:?} to session failed: {}", request.message_type(), e),
            }
        };
        bump(&self.stats.rpc_calls);
        add(&self.stats.rpc_bytes_sent, sent as u64);
        add(&self.stats.rpc_bytes_received, reply.len() as u64);
        log_rpc_debug!(
            "Round trip",
            kind = format!("{:?}", request.message_type()).as_str(),
            sent = sent,
            received = reply.len()
        );
        reply
    }

    fn apply_table_sizes(&self, directory_table_size: u32, file_table_size: Option<u32>) {
        let records = self.directory_table.parse_directory_table(directory_table_size);
        add(&self.stats.directory_table_records, records as u64);
        if let Some(size) = file_table_size {
            let records = self.mapped_file_table.parse(size);
            add(&self.stats.file_table_records, records as u64);
        }
    }

    /// Ask the session to list `dir_name`. Returns the offset of its latest
    /// version, INVALID when the session has no such directory; that answer
    /// is cached so the next lookup below it needs no message.
    pub fn rpc_update_directory(&self, dir_key: StringKey, dir_name: &str) -> TableOffset {
        let reply = self.rpc_call(&Request::UpdateDirectory {
            dir_key,
            dir_name: dir_name.to_string(),
        });
        let reply = UpdateDirectoryReply::read(&mut BinaryReader::new(&reply));
        {
            let mut lookup = self.directory_table.lock_lookup();
            let records = self
                .directory_table
                .parse_directory_table_no_lock(&mut lookup, reply.directory_table_size);
            add(&self.stats.directory_table_records, records as u64);
            if reply.table_offset.is_valid() {
                bump(&self.stats.directories_populated);
            } else {
                DirectoryTable::add_negative_no_lock(&mut lookup, dir_key);
            }
        }
        let records = self.mapped_file_table.parse(reply.file_table_size);
        add(&self.stats.file_table_records, records as u64);
        reply.table_offset
    }

    /// Offset of the directory table item for `path`, INVALID when it does
    /// not exist. Answers locally unless no ancestor of `path` is known, in
    /// which case the parent is requested once and the lookup retried.
    pub fn rpc_get_entry_offset(&self, key: StringKey, path: &str, check_if_dir: bool) -> TableOffset {
        let (exists, offset) = self.directory_table.entry_exists(key, path, check_if_dir);
        match exists {
            Exists::Yes => {
                bump(&self.stats.entry_exists_yes);
                return offset;
            }
            Exists::No => {
                bump(&self.stats.entry_exists_no);
                return TableOffset::INVALID;
            }
            Exists::Maybe => bump(&self.stats.entry_exists_maybe),
        }
        let Some((parent, _)) = split_parent(trim_trailing_separators(path)) else {
            return TableOffset::INVALID;
        };
        if parent.is_empty() {
            return TableOffset::INVALID;
        }
        self.rpc_update_directory(to_string_key(parent), parent);
        match self.directory_table.entry_exists(key, path, check_if_dir) {
            (Exists::Yes, offset) => offset,
            _ => TableOffset::INVALID,
        }
    }

    /// Open `file_name` through the session. With `update_table` the answer
    /// is recorded in the file-mapping table under `file_key`.
    pub fn rpc_create_file(
        &self,
        file_name: &str,
        file_key: StringKey,
        access: u32,
        update_table: bool,
    ) -> CreateFileReply {
        let reply = self.rpc_call(&Request::CreateFile {
            file_name: file_name.to_string(),
            file_key,
            access,
        });
        let reply = CreateFileReply::read(&mut BinaryReader::new(&reply));
        self.apply_table_sizes(reply.directory_table_size, Some(reply.file_table_size));
        if update_table && !reply.name.is_empty() {
            self.mapped_file_table
                .insert_mapping(file_key, file_name, &reply.name, reply.size);
        }
        reply
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rpc_update_close_handle(
        &self,
        file_name: &str,
        close_id: u32,
        delete_on_close: bool,
        new_name: &str,
        mapping_handle: MappingHandle,
        mapping_written: u64,
        success: bool,
    ) {
        let reply = self.rpc_call(&Request::UpdateCloseHandle {
            file_name: file_name.to_string(),
            close_id,
            delete_on_close,
            new_name: new_name.to_string(),
            mapping_handle,
            mapping_written,
            success,
        });
        let reply = UpdateCloseHandleReply::read(&mut BinaryReader::new(&reply));
        self.apply_table_sizes(reply.directory_table_size, None);
    }

    /// Catch up with both tables and with shared files other processes of
    /// the tool have grown.
    pub fn rpc_update_tables(&self) {
        let reply = self.rpc_call(&Request::UpdateTables);
        let reply = UpdateTablesReply::read(&mut BinaryReader::new(&reply));
        self.apply_table_sizes(reply.directory_table_size, Some(reply.file_table_size));
        for temp in &reply.temp_files {
            if let Some(file) = self.mapped_file_table.memory_file(&temp.file_key) {
                if file.mapping_handle() == temp.mapping_handle {
                    file.grow_committed_to(temp.size);
                }
            }
        }
    }

    fn file_operation(&self, request: Request) -> Result<(), Win32Error> {
        let reply = self.rpc_call(&request);
        let reply = FileOperationReply::read(&mut BinaryReader::new(&reply));
        self.apply_table_sizes(reply.directory_table_size, None);
        if reply.success {
            Ok(())
        } else {
            Err(Win32Error(reply.error_code))
        }
    }

    pub fn rpc_delete_file(&self, file_name: &str, file_key: StringKey, close_id: u32) -> Result<(), Win32Error> {
        self.file_operation(Request::DeleteFile {
            file_name: file_name.to_string(),
            file_key,
            close_id,
        })?;
        self.mapped_file_table.set_deleted(file_key, file_name, true);
        Ok(())
    }

    pub fn rpc_create_directory(&self, dir_name: &str, dir_key: StringKey) -> Result<(), Win32Error> {
        self.file_operation(Request::CreateDirectory {
            dir_name: dir_name.to_string(),
            dir_key,
        })
    }

    pub fn rpc_remove_directory(&self, dir_name: &str, dir_key: StringKey) -> Result<(), Win32Error> {
        self.file_operation(Request::RemoveDirectory {
            dir_name: dir_name.to_string(),
            dir_key,
        })
    }

    pub fn rpc_move_file(&self, from: &str, to: &str, flags: u32) -> Result<(), Win32Error> {
        let from_key = to_string_key(from);
        let to_key = to_string_key(to);
        self.file_operation(Request::MoveFile {
            from: from.to_string(),
            from_key,
            to: to.to_string(),
            to_key,
            flags,
        })?;
        // The reply does not carry the file table; move our entry ourselves.
        if !self.mapped_file_table.rename(&from_key, to_key, to) {
            self.mapped_file_table.set_deleted(from_key, from, true);
        }
        Ok(())
    }

    /// Tell the session a shared file now holds `size` bytes.
    pub fn rpc_create_temp_file(
        &self,
        file_key: StringKey,
        file_name: &str,
        mapping_handle: MappingHandle,
        size: u64,
    ) -> bool {
        let reply = self.rpc_call(&Request::CreateTempFile {
            file_key,
            file_name: file_name.to_string(),
            mapping_handle,
            size,
        });
        let reply = CreateTempFileReply::read(&mut BinaryReader::new(&reply));
        if !reply.success {
            log_rpc_warn!("Session refused temp file", file = file_name, handle = mapping_handle.0);
        }
        reply.success
    }

    /// Shared file another process registered under `file_key`.
    pub fn rpc_open_temp_file(&self, file_key: StringKey, file_name: &str) -> Option<(MappingHandle, u64)> {
        let reply = self.rpc_call(&Request::OpenTempFile {
            file_key,
            file_name: file_name.to_string(),
        });
        let reply = OpenTempFileReply::read(&mut BinaryReader::new(&reply));
        if reply.mapping_handle.is_none() {
            None
        } else {
            Some((reply.mapping_handle, reply.size))
        }
    }
}
