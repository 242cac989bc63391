//! Per-process counters for the virtualization layer.
//!
//! Counting is a relaxed `fetch_add`, cheap enough to stay on in release
//! builds. `to_json` is written to the log at detach.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DetoursStats {
    // ── RPC ──
    pub rpc_calls: AtomicU64,
    pub rpc_bytes_sent: AtomicU64,
    pub rpc_bytes_received: AtomicU64,

    // ── Table lookups ──
    pub entry_exists_yes: AtomicU64,
    pub entry_exists_no: AtomicU64,
    pub entry_exists_maybe: AtomicU64,
    pub directories_populated: AtomicU64,
    pub directory_table_records: AtomicU64,
    pub file_table_records: AtomicU64,

    // ── Detoured calls ──
    pub attribute_queries: AtomicU64,
    pub attribute_passthrough: AtomicU64,
    pub create_file_calls: AtomicU64,
    pub create_file_passthrough: AtomicU64,
    pub close_handle_calls: AtomicU64,
    pub find_first_file_calls: AtomicU64,

    // ── Memory files ──
    pub memory_files_created: AtomicU64,
    pub memory_bytes_written: AtomicU64,
}

/// Plain copy of the counters, for serialization and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub rpc_calls: u64,
    pub rpc_bytes_sent: u64,
    pub rpc_bytes_received: u64,
    pub entry_exists_yes: u64,
    pub entry_exists_no: u64,
    pub entry_exists_maybe: u64,
    pub directories_populated: u64,
    pub directory_table_records: u64,
    pub file_table_records: u64,
    pub attribute_queries: u64,
    pub attribute_passthrough: u64,
    pub create_file_calls: u64,
    pub create_file_passthrough: u64,
    pub close_handle_calls: u64,
    pub find_first_file_calls: u64,
    pub memory_files_created: u64,
    pub memory_bytes_written: u64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

impl DetoursStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpc_calls(&self) -> u64 {
        self.rpc_calls.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            rpc_calls: load(&self.rpc_calls),
            rpc_bytes_sent: load(&self.rpc_bytes_sent),
            rpc_bytes_received: load(&self.rpc_bytes_received),
            entry_exists_yes: load(&self.entry_exists_yes),
            entry_exists_no: load(&self.entry_exists_no),
            entry_exists_maybe: load(&self.entry_exists_maybe),
            directories_populated: load(&self.directories_populated),
            directory_table_records: load(&self.directory_table_records),
            file_table_records: load(&self.file_table_records),
            attribute_queries: load(&self.attribute_queries),
            attribute_passthrough: load(&self.attribute_passthrough),
            create_file_calls: load(&self.create_file_calls),
            create_file_passthrough: load(&self.create_file_passthrough),
            close_handle_calls: load(&self.close_handle_calls),
            find_first_file_calls: load(&self.find_first_file_calls),
            memory_files_created: load(&self.memory_files_created),
            memory_bytes_written: load(&self.memory_bytes_written),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_default()
    }
}
