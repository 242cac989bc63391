//! # uba-detours
//!
//! File system virtualization layer loaded into a build tool process.
//!
//! ## Architecture
//!
//! A detoured call first consults two process-local caches built from tables
//! the session shares through memory-mapped files:
//! - [`DirectoryTable`]: directory listings, answering "does this path exist"
//! - [`MappedFileTable`]: where the content of a file lives, and deletions
//!
//! Only when those caches cannot answer does the call issue an RPC message to
//! the session. Every reply carries the new table sizes, so the caches are
//! brought up to date (directory table first, then file table) before the
//! call completes. Outputs can stay in memory as [`MemoryFile`]s that look
//! like ordinary files to the tool.
//!
//! All state lives in one [`ProcessVirtualizationContext`], attached once per
//! process. The `extern "C"` trampolines in [`ffi`] dereference it.

#![allow(clippy::missing_safety_doc)]

/// Log at error level, then abort the process.
///
/// Used where continuing would let the tool observe an impossible file state.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!(component = "DETOURS", "FATAL: {}", format_args!($($arg)*));
        panic!($($arg)*)
    }};
}

pub mod context;
pub mod directory_table;
pub mod ffi;
pub mod functions;
pub mod handles;
pub mod mapped_file_table;
pub mod memory_file;
pub mod rpc;
pub mod rules;
pub mod shm;
pub mod stats;
mod sync;
pub mod true_functions;

#[derive(Debug, thiserror::Error)]
pub enum DetoursError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ipc(#[from] uba_ipc::IpcError),
    #[error(transparent)]
    Config(#[from] uba_config::ConfigError),
    #[error("a virtualization context is already attached")]
    AlreadyAttached,
}

#[cfg(unix)]
pub use context::attach_from_config;
pub use context::{attach, current, detach, DetoursOptions, ProcessVirtualizationContext};
pub use directory_table::{DirectoryEntry, DirectoryTable, EntryInformation, Exists};
pub use functions::{CreationDisposition, FileAttributes, MappedView, MoveMethod};
pub use handles::{DetouredHandle, FileSource, FileState, ProbeResult};
pub use mapped_file_table::{FileBacking, FileInfo, MappedFileTable};
pub use memory_file::MemoryFile;
pub use rules::{Rules, ToolProfile};
pub use stats::{DetoursStats, StatsSnapshot};
pub use true_functions::{OsFunctions, TrueFunctions};
