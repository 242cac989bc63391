//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated socket paths
//! - A private shared-memory directory for the tables
//! - A scratch project root
//!
//! # Usage
//!
//! ```ignore
//! use uba_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.session.shm_dir and config.session.socket are private to this test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Small capacities keep sparse table files cheap in tests.
const TEST_DIRECTORY_TABLE_CAPACITY: u64 = 4 * 1024 * 1024;
const TEST_FILE_TABLE_CAPACITY: u64 = 1024 * 1024;
const TEST_MEMORY_FILE_RESERVE: u64 = 16 * 1024 * 1024;

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Unique socket path for this test
    pub socket_path: PathBuf,
    /// Shared-memory directory for tables and mapping files
    pub shm_dir: PathBuf,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let project_root = root.join("project");
        let shm_dir = root.join("shm");
        std::fs::create_dir_all(&project_root)?;
        std::fs::create_dir_all(&shm_dir)?;

        let socket_path = root.join(format!("uba-test-{}.sock", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            socket_path,
            shm_dir,
            project_root,
            test_id,
        })
    }

    /// Config pointing every path at this environment
    pub fn config(&self) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.session.socket = self.socket_path.clone();
        cfg.session.shm_dir = self.shm_dir.clone();
        cfg.session.directory_table_capacity = TEST_DIRECTORY_TABLE_CAPACITY;
        cfg.session.file_table_capacity = TEST_FILE_TABLE_CAPACITY;
        cfg.detours.memory_file_reserve = TEST_MEMORY_FILE_RESERVE;
        cfg.log.level = "debug".to_string();
        cfg
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test directory
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Environment for a child process loading the detours layer
    pub fn detours_env(&self) -> Vec<(String, String)> {
        self.config().detours_env()
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
