//! Files in the session's shared-memory directory.

use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use uba_ipc::MappingHandle;

/// Map a whole table file read-only. The session keeps appending to it, so
/// the mapping always covers the table's full capacity.
pub fn map_table(path: &Path) -> std::io::Result<Mmap> {
    let file = File::open(path)?;
    unsafe { Mmap::map(&file) }
}

pub fn mapping_path(shm_dir: &Path, handle: MappingHandle) -> PathBuf {
    shm_dir.join(handle.file_name())
}
