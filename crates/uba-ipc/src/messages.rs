//! RPC messages between the detours layer and the session.
//!
//! A request is one message-type byte followed by its payload. The reply layout
//! is fixed per message type, so replies carry no type byte.

use crate::binary::{BinaryReader, BinaryWriter};
use crate::keys::StringKey;
use crate::table_types::{MappingHandle, TableOffset};
use crate::IpcError;

/// Upper bound for one request. Paths are limited to 32k characters.
pub const SEND_MAX_SIZE: usize = 128 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    UpdateDirectory = 1,
    UpdateTables = 2,
    CreateFile = 3,
    UpdateCloseHandle = 4,
    DeleteFile = 5,
    CreateDirectory = 6,
    RemoveDirectory = 7,
    MoveFile = 8,
    CreateTempFile = 9,
    OpenTempFile = 10,
}

impl TryFrom<u8> for MessageType {
    type Error = IpcError;

    fn try_from(value: u8) -> Result<Self, IpcError> {
        Ok(match value {
            1 => Self::UpdateDirectory,
            2 => Self::UpdateTables,
            3 => Self::CreateFile,
            4 => Self::UpdateCloseHandle,
            5 => Self::DeleteFile,
            6 => Self::CreateDirectory,
            7 => Self::RemoveDirectory,
            8 => Self::MoveFile,
            9 => Self::CreateTempFile,
            10 => Self::OpenTempFile,
            other => return Err(IpcError::UnknownMessage(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    UpdateDirectory {
        dir_key: StringKey,
        dir_name: String,
    },
    UpdateTables,
    CreateFile {
        file_name: String,
        file_key: StringKey,
        access: u32,
    },
    UpdateCloseHandle {
        file_name: String,
        close_id: u32,
        delete_on_close: bool,
        new_name: String,
        mapping_handle: MappingHandle,
        mapping_written: u64,
        success: bool,
    },
    DeleteFile {
        file_name: String,
        file_key: StringKey,
        close_id: u32,
    },
    CreateDirectory {
        dir_name: String,
        dir_key: StringKey,
    },
    RemoveDirectory {
        dir_name: String,
        dir_key: StringKey,
    },
    MoveFile {
        from: String,
        from_key: StringKey,
        to: String,
        to_key: StringKey,
        flags: u32,
    },
    CreateTempFile {
        file_key: StringKey,
        file_name: String,
        mapping_handle: MappingHandle,
        size: u64,
    },
    OpenTempFile {
        file_key: StringKey,
        file_name: String,
    },
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::UpdateDirectory { .. } => MessageType::UpdateDirectory,
            Request::UpdateTables => MessageType::UpdateTables,
            Request::CreateFile { .. } => MessageType::CreateFile,
            Request::UpdateCloseHandle { .. } => MessageType::UpdateCloseHandle,
            Request::DeleteFile { .. } => MessageType::DeleteFile,
            Request::CreateDirectory { .. } => MessageType::CreateDirectory,
            Request::RemoveDirectory { .. } => MessageType::RemoveDirectory,
            Request::MoveFile { .. } => MessageType::MoveFile,
            Request::CreateTempFile { .. } => MessageType::CreateTempFile,
            Request::OpenTempFile { .. } => MessageType::OpenTempFile,
        }
    }

    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_byte(self.message_type() as u8);
        match self {
            Request::UpdateDirectory { dir_key, dir_name } => {
                writer.write_string_key(*dir_key);
                writer.write_string(dir_name);
            }
            Request::UpdateTables => {}
            Request::CreateFile {
                file_name,
                file_key,
                access,
            } => {
                writer.write_string(file_name);
                writer.write_string_key(*file_key);
                writer.write_u32(*access);
            }
            Request::UpdateCloseHandle {
                file_name,
                close_id,
                delete_on_close,
                new_name,
                mapping_handle,
                mapping_written,
                success,
            } => {
                writer.write_string(file_name);
                writer.write_u32(*close_id);
                writer.write_bool(*delete_on_close);
                writer.write_string(new_name);
                writer.write_u64(mapping_handle.0);
                writer.write_u64(*mapping_written);
                writer.write_bool(*success);
            }
            Request::DeleteFile {
                file_name,
                file_key,
                close_id,
            } => {
                writer.write_string(file_name);
                writer.write_string_key(*file_key);
                writer.write_u32(*close_id);
            }
            Request::CreateDirectory { dir_name, dir_key }
            | Request::RemoveDirectory { dir_name, dir_key } => {
                writer.write_string(dir_name);
                writer.write_string_key(*dir_key);
            }
            Request::MoveFile {
                from,
                from_key,
                to,
                to_key,
                flags,
            } => {
                writer.write_string(from);
                writer.write_string_key(*from_key);
                writer.write_string(to);
                writer.write_string_key(*to_key);
                writer.write_u32(*flags);
            }
            Request::CreateTempFile {
                file_key,
                file_name,
                mapping_handle,
                size,
            } => {
                writer.write_string_key(*file_key);
                writer.write_string(file_name);
                writer.write_u64(mapping_handle.0);
                writer.write_7bit_encoded(*size);
            }
            Request::OpenTempFile {
                file_key,
                file_name,
            } => {
                writer.write_string_key(*file_key);
                writer.write_string(file_name);
            }
        }
    }

    /// Decode a request. Unlike replies, requests come from an untrusted peer
    /// so every field is bounds-checked.
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self, IpcError> {
        let message_type = MessageType::try_from(take_byte(reader)?)?;
        let request = match message_type {
            MessageType::UpdateDirectory => Request::UpdateDirectory {
                dir_key: take_key(reader)?,
                dir_name: take_string(reader)?,
            },
            MessageType::UpdateTables => Request::UpdateTables,
            MessageType::CreateFile => Request::CreateFile {
                file_name: take_string(reader)?,
                file_key: take_key(reader)?,
                access: take_u32(reader)?,
            },
            MessageType::UpdateCloseHandle => Request::UpdateCloseHandle {
                file_name: take_string(reader)?,
                close_id: take_u32(reader)?,
                delete_on_close: take_byte(reader)? != 0,
                new_name: take_string(reader)?,
                mapping_handle: MappingHandle(take_u64(reader)?),
                mapping_written: take_u64(reader)?,
                success: take_byte(reader)? != 0,
            },
            MessageType::DeleteFile => Request::DeleteFile {
                file_name: take_string(reader)?,
                file_key: take_key(reader)?,
                close_id: take_u32(reader)?,
            },
            MessageType::CreateDirectory => Request::CreateDirectory {
                dir_name: take_string(reader)?,
                dir_key: take_key(reader)?,
            },
            MessageType::RemoveDirectory => Request::RemoveDirectory {
                dir_name: take_string(reader)?,
                dir_key: take_key(reader)?,
            },
            MessageType::MoveFile => Request::MoveFile {
                from: take_string(reader)?,
                from_key: take_key(reader)?,
                to: take_string(reader)?,
                to_key: take_key(reader)?,
                flags: take_u32(reader)?,
            },
            MessageType::CreateTempFile => Request::CreateTempFile {
                file_key: take_key(reader)?,
                file_name: take_string(reader)?,
                mapping_handle: MappingHandle(take_u64(reader)?),
                size: take_7bit(reader)?,
            },
            MessageType::OpenTempFile => Request::OpenTempFile {
                file_key: take_key(reader)?,
                file_name: take_string(reader)?,
            },
        };
        Ok(request)
    }
}

fn take_byte(reader: &mut BinaryReader<'_>) -> Result<u8, IpcError> {
    if reader.left() < 1 {
        return Err(IpcError::Malformed("truncated byte"));
    }
    Ok(reader.read_byte())
}

fn take_u32(reader: &mut BinaryReader<'_>) -> Result<u32, IpcError> {
    if reader.left() < 4 {
        return Err(IpcError::Malformed("truncated u32"));
    }
    Ok(reader.read_u32())
}

fn take_u64(reader: &mut BinaryReader<'_>) -> Result<u64, IpcError> {
    if reader.left() < 8 {
        return Err(IpcError::Malformed("truncated u64"));
    }
    Ok(reader.read_u64())
}

fn take_key(reader: &mut BinaryReader<'_>) -> Result<StringKey, IpcError> {
    if reader.left() < 16 {
        return Err(IpcError::Malformed("truncated key"));
    }
    Ok(reader.read_string_key())
}

fn take_7bit(reader: &mut BinaryReader<'_>) -> Result<u64, IpcError> {
    reader
        .try_read_7bit_encoded()
        .ok_or(IpcError::Malformed("truncated 7-bit value"))
}

fn take_string(reader: &mut BinaryReader<'_>) -> Result<String, IpcError> {
    reader
        .try_read_string()
        .ok_or(IpcError::Malformed("truncated string"))
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateDirectoryReply {
    pub table_offset: TableOffset,
    pub directory_table_size: u32,
    pub file_table_size: u32,
}

impl UpdateDirectoryReply {
    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_u32(self.table_offset.0);
        writer.write_u32(self.directory_table_size);
        writer.write_u32(self.file_table_size);
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        Self {
            table_offset: TableOffset(reader.read_u32()),
            directory_table_size: reader.read_u32(),
            file_table_size: reader.read_u32(),
        }
    }
}

/// Growth of a shared-memory temp file another process is writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempFileUpdate {
    pub file_key: StringKey,
    pub mapping_handle: MappingHandle,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateTablesReply {
    pub directory_table_size: u32,
    pub file_table_size: u32,
    pub temp_files: Vec<TempFileUpdate>,
}

impl UpdateTablesReply {
    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_u32(self.directory_table_size);
        writer.write_u32(self.file_table_size);
        writer.write_7bit_encoded(self.temp_files.len() as u64);
        for temp in &self.temp_files {
            writer.write_string_key(temp.file_key);
            writer.write_u64(temp.mapping_handle.0);
            writer.write_7bit_encoded(temp.size);
        }
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        let directory_table_size = reader.read_u32();
        let file_table_size = reader.read_u32();
        let count = reader.read_7bit_encoded() as usize;
        let temp_files = (0..count)
            .map(|_| TempFileUpdate {
                file_key: reader.read_string_key(),
                mapping_handle: MappingHandle(reader.read_u64()),
                size: reader.read_7bit_encoded(),
            })
            .collect();
        Self {
            directory_table_size,
            file_table_size,
            temp_files,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFileReply {
    /// Final name; see `MappedName` for the sentinel forms.
    pub name: String,
    pub size: u64,
    pub close_id: u32,
    pub directory_table_size: u32,
    pub file_table_size: u32,
}

impl CreateFileReply {
    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_string(&self.name);
        writer.write_7bit_encoded(self.size);
        writer.write_u32(self.close_id);
        writer.write_u32(self.directory_table_size);
        writer.write_u32(self.file_table_size);
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        Self {
            name: reader.read_string(),
            size: reader.read_7bit_encoded(),
            close_id: reader.read_u32(),
            directory_table_size: reader.read_u32(),
            file_table_size: reader.read_u32(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCloseHandleReply {
    pub directory_table_size: u32,
}

impl UpdateCloseHandleReply {
    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_u32(self.directory_table_size);
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        Self {
            directory_table_size: reader.read_u32(),
        }
    }
}

/// Reply to delete, move and directory create/remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOperationReply {
    pub success: bool,
    pub error_code: u32,
    pub directory_table_size: u32,
}

impl FileOperationReply {
    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_bool(self.success);
        writer.write_u32(self.error_code);
        writer.write_u32(self.directory_table_size);
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        Self {
            success: reader.read_bool(),
            error_code: reader.read_u32(),
            directory_table_size: reader.read_u32(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTempFileReply {
    pub success: bool,
}

impl CreateTempFileReply {
    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_bool(self.success);
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        Self {
            success: reader.read_bool(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTempFileReply {
    /// `MappingHandle::NONE` when no temp file is registered under the key.
    pub mapping_handle: MappingHandle,
    pub size: u64,
}

impl OpenTempFileReply {
    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        writer.write_u64(self.mapping_handle.0);
        writer.write_7bit_encoded(self.size);
    }

    pub fn read(reader: &mut BinaryReader<'_>) -> Self {
        Self {
            mapping_handle: MappingHandle(reader.read_u64()),
            size: reader.read_7bit_encoded(),
        }
    }
}

/// Any reply, as produced by the session's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    UpdateDirectory(UpdateDirectoryReply),
    UpdateTables(UpdateTablesReply),
    CreateFile(CreateFileReply),
    UpdateCloseHandle(UpdateCloseHandleReply),
    FileOperation(FileOperationReply),
    CreateTempFile(CreateTempFileReply),
    OpenTempFile(OpenTempFileReply),
}

impl Reply {
    pub fn write(&self, writer: &mut BinaryWriter<'_>) {
        match self {
            Reply::UpdateDirectory(r) => r.write(writer),
            Reply::UpdateTables(r) => r.write(writer),
            Reply::CreateFile(r) => r.write(writer),
            Reply::UpdateCloseHandle(r) => r.write(writer),
            Reply::FileOperation(r) => r.write(writer),
            Reply::CreateTempFile(r) => r.write(writer),
            Reply::OpenTempFile(r) => r.write(writer),
        }
    }

    /// Encode into a freshly sized buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.max_size()];
        let len = {
            let mut writer = BinaryWriter::new(&mut buf);
            self.write(&mut writer);
            writer.position()
        };
        buf.truncate(len);
        buf
    }

    fn max_size(&self) -> usize {
        use crate::binary::get_string_write_size;
        match self {
            Reply::UpdateTables(r) => 8 + 10 + r.temp_files.len() * (16 + 8 + 10),
            Reply::CreateFile(r) => get_string_write_size(&r.name) + 10 + 12,
            _ => 32,
        }
    }
}
