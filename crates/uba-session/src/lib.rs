//! # uba-session
//!
//! Session side of the UBA virtualization layer.
//!
//! The session owns the authoritative file system view of a build. It is the
//! only writer of the two shared tables in the shm directory:
//! - `directory_table.bin`: append-only directory listings and their versions
//! - `file_mapping_table.bin`: where the content of each opened file lives
//!
//! Detoured processes read those tables directly and fall back to RPC
//! messages, answered by [`SessionHandler`], when their view is incomplete.

pub mod directory_table;
pub mod file_system;
pub mod file_table;
pub mod handler;
pub mod shared_table;
pub mod socket;
pub mod transport;

pub use handler::SessionHandler;
pub use transport::InProcessTransport;

use uba_ipc::IpcError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{table} table is full ({capacity} bytes)")]
    TableFull { table: &'static str, capacity: u64 },
    #[error("table capacity {0} does not fit a table offset")]
    InvalidCapacity(u64),
    #[error(transparent)]
    Ipc(#[from] IpcError),
}
