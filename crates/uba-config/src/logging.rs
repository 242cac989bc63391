//! Structured logging utilities for UBA components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use uba_config::{log_rpc_debug, log_table_warn};
//!
//! log_rpc_debug!("UpdateDirectory", offset = reply.table_offset.0);
//! log_table_warn!("Remap ignored, memory file is live", size = size);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const DETOURS: &'static str = "DETOURS";
    pub const RPC: &'static str = "RPC";
    pub const TABLE: &'static str = "TABLE";
    pub const MEMFILE: &'static str = "MEMFILE";
    pub const SESSION: &'static str = "SESSION";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

// === DETOURS logging macros ===

#[macro_export]
macro_rules! log_detours_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "DETOURS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_detours_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DETOURS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_detours_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DETOURS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_detours_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DETOURS", $($key = $value,)* $msg)
    };
}

// === RPC logging macros ===

#[macro_export]
macro_rules! log_rpc_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "RPC", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_rpc_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "RPC", $($key = $value,)* $msg)
    };
}

// === TABLE logging macros ===

#[macro_export]
macro_rules! log_table_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "TABLE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_table_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "TABLE", $($key = $value,)* $msg)
    };
}

// === MEMFILE logging macros ===

#[macro_export]
macro_rules! log_memfile_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "MEMFILE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_memfile_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "MEMFILE", $($key = $value,)* $msg)
    };
}

// === SESSION logging macros ===

#[macro_export]
macro_rules! log_session_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "SESSION", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_session_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "SESSION", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_session_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "SESSION", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_session_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "SESSION", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    // A host process may already have installed a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
