//! # uba-ipc
//!
//! Everything both sides of the virtualization layer must agree on:
//! - `binary`: the flat-buffer codec (7-bit integers, UTF-8 strings, keys)
//! - `keys`: `StringKey`, `CasKey`, `Guid` and the normalizing path hasher
//! - `table_types`: record layouts of the shared directory and file tables
//! - `messages`: RPC requests and replies
//! - `transport`: framing and the Unix-socket transport
//! - `win32`: attribute, access and error constants

pub mod binary;
pub mod keys;
pub mod messages;
pub mod path;
pub mod table_types;
pub mod transport;
pub mod win32;

pub use binary::{BinaryReader, BinaryWriter};
pub use keys::{to_string_key, CasKey, Guid, StringKey, StringKeyHasher};
pub use messages::{MessageType, Reply, Request};
pub use table_types::{MappedName, MappingHandle, TableOffset, INVALID_SIZE};
pub use transport::Transport;
pub use win32::Win32Error;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message type {0}")]
    UnknownMessage(u8),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("session unavailable: {0}")]
    Unavailable(String),
}

/// Default session socket path
pub fn default_socket_path() -> &'static str {
    "/tmp/uba-session.sock"
}
