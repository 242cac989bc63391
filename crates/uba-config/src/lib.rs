//! # uba-config
//!
//! Configuration for the session and the detours layer.
//!
//! Loads configuration from:
//! 1. `~/.uba/config.toml` (global)
//! 2. `.uba/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|e| e.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|e| e.into_inner()) = new_config;
    Ok(())
}

pub const ENV_SOCKET: &str = "UBA_SOCKET";
pub const ENV_SHM_DIR: &str = "UBA_SHM_DIR";
pub const ENV_LOG: &str = "UBA_LOG";
pub const ENV_TOOL_PROFILE: &str = "UBA_TOOL_PROFILE";
pub const ENV_ALLOW_DIRECTORY_CACHE: &str = "UBA_ALLOW_DIRECTORY_CACHE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub detours: DetoursConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        let project_path = Path::new(".uba/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config.merge(Self::from_file(project_path)?);
        }

        config.apply_overrides(std::env::vars())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.uba/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".uba/config.toml"))
    }

    /// Merge a project config over this one. Only values that differ from
    /// the defaults replace ours.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.session.socket != defaults.session.socket {
            self.session.socket = other.session.socket;
        }
        if other.session.shm_dir != defaults.session.shm_dir {
            self.session.shm_dir = other.session.shm_dir;
        }
        if other.session.directory_table_capacity != defaults.session.directory_table_capacity {
            self.session.directory_table_capacity = other.session.directory_table_capacity;
        }
        if other.session.file_table_capacity != defaults.session.file_table_capacity {
            self.session.file_table_capacity = other.session.file_table_capacity;
        }
        if other.detours.allow_directory_cache != defaults.detours.allow_directory_cache {
            self.detours.allow_directory_cache = other.detours.allow_directory_cache;
        }
        if other.detours.tool_profile.is_some() {
            self.detours.tool_profile = other.detours.tool_profile;
        }
        if other.detours.memory_file_reserve != defaults.detours.memory_file_reserve {
            self.detours.memory_file_reserve = other.detours.memory_file_reserve;
        }
        if !other.detours.keep_in_memory_extensions.is_empty() {
            self.detours.keep_in_memory_extensions = other.detours.keep_in_memory_extensions;
        }
        if other.log.level != defaults.log.level {
            self.log.level = other.log.level;
        }
    }

    /// Apply `UBA_*` overrides from an environment snapshot.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_SOCKET => self.session.socket = PathBuf::from(value),
                ENV_SHM_DIR => self.session.shm_dir = PathBuf::from(value),
                ENV_LOG => self.log.level = value,
                ENV_TOOL_PROFILE => self.detours.tool_profile = Some(value),
                ENV_ALLOW_DIRECTORY_CACHE => {
                    self.detours.allow_directory_cache = match value.as_str() {
                        "1" | "true" | "TRUE" | "yes" => true,
                        "0" | "false" | "FALSE" | "no" => false,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                key: ENV_ALLOW_DIRECTORY_CACHE,
                                value,
                            })
                        }
                    };
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Environment for a child process that should load the detours layer
    /// with this configuration.
    pub fn detours_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (ENV_SOCKET.to_string(), self.session.socket.display().to_string()),
            (ENV_SHM_DIR.to_string(), self.session.shm_dir.display().to_string()),
            (ENV_LOG.to_string(), self.log.level.clone()),
            (
                ENV_ALLOW_DIRECTORY_CACHE.to_string(),
                if self.detours.allow_directory_cache { "1" } else { "0" }.to_string(),
            ),
        ];
        if let Some(profile) = &self.detours.tool_profile {
            env.push((ENV_TOOL_PROFILE.to_string(), profile.clone()));
        }
        env
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Session (coordinator) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Unix socket the session listens on
    pub socket: PathBuf,
    /// Directory holding the shared tables and mapping files
    pub shm_dir: PathBuf,
    /// Reserved size of the directory table arena
    pub directory_table_capacity: u64,
    /// Reserved size of the file-mapping table arena
    pub file_table_capacity: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let shm_dir = if cfg!(target_os = "linux") {
            PathBuf::from("/dev/shm/uba")
        } else {
            std::env::temp_dir().join("uba")
        };
        Self {
            socket: PathBuf::from(uba_ipc::default_socket_path()),
            shm_dir,
            directory_table_capacity: uba_ipc::table_types::DEFAULT_DIRECTORY_TABLE_CAPACITY,
            file_table_capacity: uba_ipc::table_types::DEFAULT_FILE_TABLE_CAPACITY,
        }
    }
}

/// Detours layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetoursConfig {
    /// Answer attribute queries from the directory table
    pub allow_directory_cache: bool,
    /// Force a tool profile (cl, clang, link, default); detected from the
    /// executable name when unset
    pub tool_profile: Option<String>,
    /// Address space reserved per memory file
    pub memory_file_reserve: u64,
    /// Output extensions kept in memory instead of written to disk
    pub keep_in_memory_extensions: Vec<String>,
}

impl Default for DetoursConfig {
    fn default() -> Self {
        Self {
            allow_directory_cache: true,
            tool_profile: None,
            memory_file_reserve: 256 * 1024 * 1024,
            keep_in_memory_extensions: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    pub fn log_level(&self) -> logging::LogLevel {
        logging::LogLevel::parse(&self.level).unwrap_or(logging::LogLevel::Info)
    }
}
