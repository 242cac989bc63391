//! Process-wide state of the layer.
//!
//! One [`ProcessVirtualizationContext`] holds the table caches, the session
//! connection, the handle allocators and the counters. It is created before
//! the first detoured call and published through a single static pointer;
//! trampolines borrow it through [`current`].

use memmap2::Mmap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use uba_config::{log_detours_debug, log_detours_info, Config};
use uba_ipc::messages::SEND_MAX_SIZE;
use uba_ipc::table_types::{DIRECTORY_TABLE_FILE, FILE_MAPPING_TABLE_FILE};
use uba_ipc::{to_string_key, MappingHandle, Transport};

use crate::directory_table::DirectoryTable;
use crate::handles::{
    FileState, FileStates, HandleEntry, HandleTable, ListDirectoryHandle, FILE_HANDLE_BASE, LIST_DIRECTORY_HANDLE_BASE,
};
use crate::mapped_file_table::MappedFileTable;
use crate::rules::Rules;
use crate::shm::{map_table, mapping_path};
use crate::stats::DetoursStats;
use crate::sync::lock;
use crate::true_functions::TrueFunctions;
use crate::DetoursError;

/// Expected number of directories; sizes the lookup up front.
const DEFAULT_DIRECTORY_TABLE_COUNT: usize = 4096;

#[derive(Debug, Clone)]
pub struct DetoursOptions {
    /// Where the session keeps its tables and mapping files.
    pub shm_dir: PathBuf,
    pub rules: Rules,
    /// Answer attribute queries and opens from the directory table.
    pub allow_directory_cache: bool,
    pub memory_file_reserve: u64,
    pub directory_table_count: usize,
}

impl DetoursOptions {
    pub fn from_config(config: &Config, application: &str) -> Self {
        Self {
            shm_dir: config.session.shm_dir.clone(),
            rules: Rules::from_config(&config.detours, application),
            allow_directory_cache: config.detours.allow_directory_cache,
            memory_file_reserve: config.detours.memory_file_reserve,
            directory_table_count: DEFAULT_DIRECTORY_TABLE_COUNT,
        }
    }
}

/// The session connection and the buffer requests are encoded into.
pub(crate) struct Communication {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) send_buffer: Box<[u8]>,
}

impl Communication {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            send_buffer: vec![0u8; SEND_MAX_SIZE].into_boxed_slice(),
        }
    }
}

pub struct ProcessVirtualizationContext {
    pub(crate) options: DetoursOptions,
    pub(crate) directory_table: DirectoryTable,
    pub(crate) mapped_file_table: MappedFileTable,
    /// Held for a whole request/reply round trip.
    pub(crate) communication: Mutex<Communication>,
    pub(crate) true_functions: Box<dyn TrueFunctions>,
    pub(crate) files: HandleTable<HandleEntry>,
    pub(crate) list_directories: HandleTable<Arc<Mutex<ListDirectoryHandle>>>,
    pub(crate) file_states: FileStates,
    session_mappings: Mutex<HashMap<MappingHandle, Arc<Mmap>>>,
    pub(crate) stats: DetoursStats,
}

impl ProcessVirtualizationContext {
    /// Map the session's tables and catch up with everything published so
    /// far.
    pub fn new(
        options: DetoursOptions,
        transport: Box<dyn Transport>,
        true_functions: Box<dyn TrueFunctions>,
    ) -> Result<Self, DetoursError> {
        let directory_memory = map_table(&options.shm_dir.join(DIRECTORY_TABLE_FILE))?;
        let file_memory = map_table(&options.shm_dir.join(FILE_MAPPING_TABLE_FILE))?;
        let context = Self {
            directory_table: DirectoryTable::init(directory_memory, options.directory_table_count, 0),
            mapped_file_table: MappedFileTable::init(file_memory, 0),
            communication: Mutex::new(Communication::new(transport)),
            true_functions,
            files: HandleTable::new(FILE_HANDLE_BASE),
            list_directories: HandleTable::new(LIST_DIRECTORY_HANDLE_BASE),
            file_states: FileStates::default(),
            session_mappings: Mutex::new(HashMap::new()),
            stats: DetoursStats::new(),
            options,
        };
        context.rpc_update_tables();
        log_detours_info!(
            "Virtualization context ready",
            profile = context.options.rules.profile().as_str(),
            directories = context.directory_table.directory_count(),
            directory_cache = context.options.allow_directory_cache
        );
        Ok(context)
    }

    pub fn options(&self) -> &DetoursOptions {
        &self.options
    }

    pub fn rules(&self) -> &Rules {
        &self.options.rules
    }

    pub fn stats(&self) -> &DetoursStats {
        &self.stats
    }

    /// Where `path` stands between its first attribute query and its last close.
    pub fn file_state(&self, path: &str) -> FileState {
        self.file_states.get(&to_string_key(path))
    }

    pub fn directory_table(&self) -> &DirectoryTable {
        &self.directory_table
    }

    pub fn mapped_file_table(&self) -> &MappedFileTable {
        &self.mapped_file_table
    }

    pub fn shm_dir(&self) -> &Path {
        &self.options.shm_dir
    }

    /// View of a mapping file the session prepared. Views are kept for the
    /// life of the process.
    pub(crate) fn session_mapping(&self, handle: MappingHandle) -> std::io::Result<Arc<Mmap>> {
        let mut mappings = lock(&self.session_mappings);
        if let Some(view) = mappings.get(&handle) {
            return Ok(view.clone());
        }
        let view = Arc::new(map_table(&mapping_path(&self.options.shm_dir, handle))?);
        log_detours_debug!("Mapped session mapping", handle = handle.0, size = view.len());
        mappings.insert(handle, view.clone());
        Ok(view)
    }
}

static CONTEXT: AtomicPtr<ProcessVirtualizationContext> = AtomicPtr::new(ptr::null_mut());

/// Publish `context` for the trampolines.
pub fn attach(context: ProcessVirtualizationContext) -> Result<&'static ProcessVirtualizationContext, DetoursError> {
    let raw = Box::into_raw(Box::new(context));
    match CONTEXT.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(unsafe { &*raw }),
        Err(_) => {
            drop(unsafe { Box::from_raw(raw) });
            Err(DetoursError::AlreadyAttached)
        }
    }
}

/// Build a context from the layered configuration and connect to the
/// session socket it names.
#[cfg(unix)]
pub fn attach_from_config(application: &str) -> Result<&'static ProcessVirtualizationContext, DetoursError> {
    use crate::true_functions::OsFunctions;
    use uba_ipc::transport::UnixTransport;

    let config = Config::load()?;
    let transport = UnixTransport::connect(&config.session.socket)?;
    let options = DetoursOptions::from_config(&config, application);
    attach(ProcessVirtualizationContext::new(
        options,
        Box::new(transport),
        Box::new(OsFunctions),
    )?)
}

pub fn current() -> Option<&'static ProcessVirtualizationContext> {
    let raw = CONTEXT.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        Some(unsafe { &*raw })
    }
}

/// Tear down the attached context and log its counters.
///
/// # Safety
///
/// No reference obtained from [`attach`] or [`current`] may be used after
/// this returns.
pub unsafe fn detach() -> bool {
    let raw = CONTEXT.swap(ptr::null_mut(), Ordering::AcqRel);
    if raw.is_null() {
        return false;
    }
    let context = Box::from_raw(raw);
    log_detours_info!("Detached", stats = context.stats.to_json().as_str());
    drop(context);
    true
}
