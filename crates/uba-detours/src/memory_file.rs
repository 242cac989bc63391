//! In-process stand-in for a file the tool writes.
//!
//! A memory file reserves `reserve_size` bytes up front and grows its
//! committed and mapped ranges as content is written:
//!
//! ```text
//! 0 <= written <= committed <= mapped <= reserve
//! ```
//!
//! Local files live in an anonymous mapping. Shared files are backed by
//! `<shm_dir>/uba-map-<handle>` so the session and other processes can read
//! the content after the handle is closed; committing grows the file and
//! mapping more of it replaces the view.
//!
//! Throw-away files keep one commit block as a window. Bytes past it are
//! counted in the size but discarded.

#[cfg(unix)]
use memmap2::UncheckedAdvice;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use uba_config::{log_memfile_debug, log_memfile_warn};
use uba_ipc::win32::file_time_now;
use uba_ipc::MappingHandle;

use crate::fatal;
use crate::shm::mapping_path;
use crate::sync::lock;

pub const COMMIT_GRANULARITY: u64 = 64 * 1024;
pub const MAPPING_GRANULARITY: u64 = 1024 * 1024;
pub const MEMORY_FILE_VOLUME_SERIAL: u32 = 1;

/// File indices of memory files count down from the top so they never
/// collide with indices reported by a real volume.
static MEMORY_FILE_INDEX: AtomicU64 = AtomicU64::new(u64::MAX);
static MAPPING_HANDLE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// A mapping handle unique to this process. Values stay below the range the
/// session uses for its own mappings.
pub fn next_mapping_handle() -> MappingHandle {
    let counter = MAPPING_HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let pid = std::process::id() as u64 & 0x0fff_ffff;
    MappingHandle(pid << 20 | (counter & 0xf_ffff))
}

enum Backing {
    Local(MmapMut),
    Shared {
        file: File,
        path: PathBuf,
        view: Option<MmapMut>,
    },
}

struct MemoryFileState {
    backing: Backing,
    written: u64,
    committed: u64,
    mapped: u64,
}

impl MemoryFileState {
    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Local(map) => &map[..self.mapped as usize],
            Backing::Shared { view: Some(view), .. } => &view[..],
            Backing::Shared { view: None, .. } => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let mapped = self.mapped as usize;
        match &mut self.backing {
            Backing::Local(map) => &mut map[..mapped],
            Backing::Shared { view: Some(view), .. } => &mut view[..],
            Backing::Shared { view: None, .. } => &mut [],
        }
    }
}

pub struct MemoryFile {
    name: String,
    state: Mutex<MemoryFileState>,
    mapping_handle: MappingHandle,
    reserve_size: u64,
    is_local_only: bool,
    is_throw_away: bool,
    is_reported: AtomicBool,
    file_index: u64,
    volume_serial: u32,
    file_time: AtomicU64,
}

impl MemoryFile {
    /// A file only this process sees.
    pub fn create_local(name: &str, reserve_size: u64, is_throw_away: bool) -> std::io::Result<Self> {
        let reserve_size = if is_throw_away {
            COMMIT_GRANULARITY
        } else {
            reserve_size.max(COMMIT_GRANULARITY)
        };
        let map = MmapOptions::new().len(reserve_size as usize).map_anon()?;
        log_memfile_debug!("Created local memory file", name = name, reserve = reserve_size);
        Ok(Self::new(name, Backing::Local(map), MappingHandle::NONE, reserve_size, true, is_throw_away))
    }

    /// A file in the shm directory that outlives this process.
    pub fn create_shared(
        shm_dir: &Path,
        handle: MappingHandle,
        name: &str,
        reserve_size: u64,
    ) -> std::io::Result<Self> {
        let path = mapping_path(shm_dir, handle);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        log_memfile_debug!(
            "Created shared memory file",
            name = name,
            handle = handle.0,
            reserve = reserve_size
        );
        let backing = Backing::Shared {
            file,
            path,
            view: None,
        };
        Ok(Self::new(name, backing, handle, reserve_size.max(COMMIT_GRANULARITY), false, false))
    }

    /// Take over a shared file another process wrote, `size` bytes long.
    pub fn open_shared(
        shm_dir: &Path,
        handle: MappingHandle,
        name: &str,
        size: u64,
        reserve_size: u64,
    ) -> std::io::Result<Self> {
        let path = mapping_path(shm_dir, handle);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let committed = file.metadata()?.len().max(size);
        if committed > file.metadata()?.len() {
            file.set_len(committed)?;
        }
        let reserve_size = reserve_size.max(align_up(committed, COMMIT_GRANULARITY));
        let mapped = align_up(committed, MAPPING_GRANULARITY).min(reserve_size);
        let view = if mapped > 0 {
            Some(unsafe { MmapOptions::new().len(mapped as usize).map_mut(&file)? })
        } else {
            None
        };
        let mut memory_file = Self::new(
            name,
            Backing::Shared { file, path, view },
            handle,
            reserve_size,
            false,
            false,
        );
        {
            let state = memory_file.state.get_mut().unwrap_or_else(|e| e.into_inner());
            state.written = size;
            state.committed = committed;
            state.mapped = mapped;
        }
        // Already known to the session.
        memory_file.is_reported = AtomicBool::new(true);
        log_memfile_debug!("Opened shared memory file", name = name, handle = handle.0, size = size);
        Ok(memory_file)
    }

    fn new(
        name: &str,
        backing: Backing,
        mapping_handle: MappingHandle,
        reserve_size: u64,
        is_local_only: bool,
        is_throw_away: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MemoryFileState {
                backing,
                written: 0,
                committed: 0,
                mapped: 0,
            }),
            mapping_handle,
            reserve_size,
            is_local_only,
            is_throw_away,
            is_reported: AtomicBool::new(false),
            file_index: MEMORY_FILE_INDEX.fetch_sub(1, Ordering::Relaxed),
            volume_serial: MEMORY_FILE_VOLUME_SERIAL,
            file_time: AtomicU64::new(file_time_now()),
        }
    }

    /// Write `data` at `offset`, growing the file as needed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> usize {
        let end = offset + data.len() as u64;
        let mut state = lock(&self.state);
        if self.is_throw_away {
            self.ensure_committed_locked(&mut state, end.min(self.reserve_size));
            if offset < self.reserve_size {
                let keep = (self.reserve_size - offset).min(data.len() as u64) as usize;
                let start = offset as usize;
                state.bytes_mut()[start..start + keep].copy_from_slice(&data[..keep]);
            }
        } else {
            self.ensure_committed_locked(&mut state, end);
            let start = offset as usize;
            state.bytes_mut()[start..end as usize].copy_from_slice(data);
        }
        state.written = state.written.max(end);
        self.file_time.store(file_time_now(), Ordering::Relaxed);
        data.len()
    }

    /// Copy content at `offset` into `buf`; returns the byte count, zero at
    /// end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let state = lock(&self.state);
        if offset >= state.written {
            return 0;
        }
        let count = (state.written - offset).min(buf.len() as u64) as usize;
        let bytes = state.bytes();
        let start = offset as usize;
        let available = bytes.len().saturating_sub(start).min(count);
        buf[..available].copy_from_slice(&bytes[start..start + available]);
        buf[available..count].fill(0);
        count
    }

    /// Make `[0, end)` writable.
    pub fn ensure_committed(&self, end: u64) {
        let mut state = lock(&self.state);
        self.ensure_committed_locked(&mut state, end);
    }

    /// Make `[0, end)` addressable without committing it.
    pub fn ensure_mapped(&self, end: u64) {
        let mut state = lock(&self.state);
        self.ensure_mapped_locked(&mut state, end);
    }

    fn ensure_committed_locked(&self, state: &mut MemoryFileState, end: u64) {
        if end <= state.committed {
            return;
        }
        if end > self.reserve_size {
            fatal!(
                "Memory file {} needs {} bytes, reserve is {}",
                self.name,
                end,
                self.reserve_size
            );
        }
        let committed = align_up(end, COMMIT_GRANULARITY).min(self.reserve_size);
        self.ensure_mapped_locked(state, committed);
        if let Backing::Shared { file, path, .. } = &state.backing {
            if let Err(e) = file.set_len(committed) {
                fatal!("Failed to commit {} bytes of {}: {}", committed, path.display(), e);
            }
        }
        state.committed = committed;
    }

    fn ensure_mapped_locked(&self, state: &mut MemoryFileState, end: u64) {
        if end <= state.mapped {
            return;
        }
        if end > self.reserve_size {
            fatal!(
                "Memory file {} needs a {} byte view, reserve is {}",
                self.name,
                end,
                self.reserve_size
            );
        }
        let mapped = align_up(end, MAPPING_GRANULARITY).min(self.reserve_size);
        if let Backing::Shared { file, path, view } = &mut state.backing {
            // A larger view replaces the old one; content lives in the file.
            match unsafe { MmapOptions::new().len(mapped as usize).map_mut(&*file) } {
                Ok(new_view) => *view = Some(new_view),
                Err(e) => fatal!("Failed to map {} bytes of {}: {}", mapped, path.display(), e),
            }
        }
        state.mapped = mapped;
    }

    /// Truncate or extend to `size`. Shrunk bytes are zeroed so a later
    /// extension reads zeros.
    pub fn set_size(&self, size: u64) {
        let mut state = lock(&self.state);
        if size > state.written {
            if !self.is_throw_away {
                self.ensure_committed_locked(&mut state, size);
            }
        } else {
            let from = size as usize;
            let to = (state.written as usize).min(state.bytes().len());
            if from < to {
                state.bytes_mut()[from..to].fill(0);
            }
        }
        state.written = size;
    }

    /// Another process grew a shared file to `size`.
    pub fn grow_committed_to(&self, size: u64) {
        let mut state = lock(&self.state);
        if size <= state.written {
            return;
        }
        self.ensure_committed_locked(&mut state, size);
        state.written = size;
        log_memfile_debug!("Grew shared memory file", name = self.name.as_str(), size = size);
    }

    /// Release committed space above the written content after the last
    /// write handle closes.
    pub fn close_write(&self) {
        let mut state = lock(&self.state);
        let aligned = align_up(state.written, COMMIT_GRANULARITY);
        if aligned >= state.committed {
            return;
        }
        match &state.backing {
            Backing::Shared { file, path, .. } => {
                if let Err(e) = file.set_len(aligned.max(state.written)) {
                    log_memfile_warn!(
                        "Failed to decommit memory file",
                        path = path.display().to_string().as_str(),
                        error = e.to_string().as_str()
                    );
                    return;
                }
            }
            #[cfg(unix)]
            Backing::Local(map) => {
                let len = (state.committed - aligned) as usize;
                // Pages come back zero-filled on the next touch.
                let advised = unsafe { map.unchecked_advise_range(UncheckedAdvice::DontNeed, aligned as usize, len) };
                if let Err(e) = advised {
                    log_memfile_warn!(
                        "Failed to decommit memory file",
                        name = self.name.as_str(),
                        error = e.to_string().as_str()
                    );
                    return;
                }
            }
            #[cfg(not(unix))]
            Backing::Local(_) => {}
        }
        state.committed = aligned;
    }

    /// Run `f` over the written content.
    pub fn with_view<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = lock(&self.state);
        let len = (state.written as usize).min(state.bytes().len());
        f(&state.bytes()[..len])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let size = self.written_size() as usize;
        let mut buf = vec![0u8; size];
        let read = self.read_at(0, &mut buf);
        buf.truncate(read);
        buf
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn written_size(&self) -> u64 {
        lock(&self.state).written
    }

    pub fn committed_size(&self) -> u64 {
        lock(&self.state).committed
    }

    pub fn mapped_size(&self) -> u64 {
        lock(&self.state).mapped
    }

    pub fn reserve_size(&self) -> u64 {
        self.reserve_size
    }

    pub fn mapping_handle(&self) -> MappingHandle {
        self.mapping_handle
    }

    pub fn is_local_only(&self) -> bool {
        self.is_local_only
    }

    pub fn is_throw_away(&self) -> bool {
        self.is_throw_away
    }

    pub fn is_reported(&self) -> bool {
        self.is_reported.load(Ordering::Acquire)
    }

    /// Returns true for the first caller only.
    pub fn mark_reported(&self) -> bool {
        !self.is_reported.swap(true, Ordering::AcqRel)
    }

    pub fn file_index(&self) -> u64 {
        self.file_index
    }

    pub fn volume_serial(&self) -> u32 {
        self.volume_serial
    }

    pub fn file_time(&self) -> u64 {
        self.file_time.load(Ordering::Relaxed)
    }

    pub fn set_file_time(&self, time: u64) {
        self.file_time.store(time, Ordering::Relaxed);
    }

    pub fn shared_path(&self) -> Option<PathBuf> {
        match &lock(&self.state).backing {
            Backing::Shared { path, .. } => Some(path.clone()),
            Backing::Local(_) => None,
        }
    }
}

impl std::fmt::Debug for MemoryFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryFile")
            .field("name", &self.name)
            .field("mapping_handle", &self.mapping_handle)
            .field("written", &state.written)
            .field("committed", &state.committed)
            .field("mapped", &state.mapped)
            .field("reserve", &self.reserve_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RESERVE: u64 = 4 * MAPPING_GRANULARITY;

    fn assert_invariant(file: &MemoryFile) {
        let written = file.written_size();
        let committed = file.committed_size();
        let mapped = file.mapped_size();
        assert!(written <= committed, "written {} > committed {}", written, committed);
        assert!(committed <= mapped, "committed {} > mapped {}", committed, mapped);
        assert!(mapped <= file.reserve_size(), "mapped {} > reserve", mapped);
    }

    #[test]
    fn test_sizes_hold_through_writes_and_commits() {
        let file = MemoryFile::create_local("C:\\out\\a.obj", RESERVE, false).unwrap();
        assert_invariant(&file);

        let steps: &[(u64, usize)] = &[(0, 10), (100, 70_000), (5, 1), (1_500_000, 4096), (0, 0)];
        for &(offset, len) in steps {
            file.write_at(offset, &vec![0xab; len]);
            assert_invariant(&file);
        }
        for end in [1u64, 2_000_000, 3 * MAPPING_GRANULARITY + 1] {
            file.ensure_committed(end);
            assert_invariant(&file);
        }
        file.set_size(10);
        assert_invariant(&file);
        file.close_write();
        assert_invariant(&file);
        assert_eq!(file.committed_size(), COMMIT_GRANULARITY);
    }

    #[test]
    fn test_commit_granularity() {
        let file = MemoryFile::create_local("a", RESERVE, false).unwrap();
        file.write_at(0, b"x");
        assert_eq!(file.committed_size(), COMMIT_GRANULARITY);
        assert_eq!(file.mapped_size(), MAPPING_GRANULARITY);
        file.write_at(COMMIT_GRANULARITY, b"y");
        assert_eq!(file.committed_size(), 2 * COMMIT_GRANULARITY);
        assert_eq!(file.written_size(), COMMIT_GRANULARITY + 1);
    }

    #[test]
    fn test_read_back_and_shrink() {
        let file = MemoryFile::create_local("a", RESERVE, false).unwrap();
        file.write_at(0, b"hello world");
        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(6, &mut buf), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(file.read_at(11, &mut buf), 0);

        file.set_size(5);
        file.set_size(8);
        assert_eq!(file.to_vec(), b"hello\0\0\0");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_close_write_releases_local_tail() {
        let file = MemoryFile::create_local("a.tmp", RESERVE, false).unwrap();
        file.write_at(0, &[0xab; 3 * COMMIT_GRANULARITY as usize]);
        assert_eq!(file.committed_size(), 3 * COMMIT_GRANULARITY);
        // Leave stale bytes past the written size.
        lock(&file.state).written = 10;
        file.close_write();
        assert_eq!(file.committed_size(), COMMIT_GRANULARITY);
        let state = lock(&file.state);
        let tail = &state.bytes()[COMMIT_GRANULARITY as usize..3 * COMMIT_GRANULARITY as usize];
        assert!(tail.iter().all(|&b| b == 0));
        assert_eq!(state.bytes()[9], 0xab);
    }

    #[test]
    #[should_panic(expected = "reserve")]
    fn test_write_past_reserve_is_fatal() {
        let file = MemoryFile::create_local("a", COMMIT_GRANULARITY, false).unwrap();
        file.write_at(COMMIT_GRANULARITY, b"z");
    }

    #[test]
    fn test_throw_away_keeps_window() {
        let file = MemoryFile::create_local("vctip.tmp", RESERVE, true).unwrap();
        assert_eq!(file.reserve_size(), COMMIT_GRANULARITY);
        file.write_at(COMMIT_GRANULARITY - 2, b"abcd");
        assert_eq!(file.written_size(), COMMIT_GRANULARITY + 2);
        let mut buf = [0xffu8; 4];
        assert_eq!(file.read_at(COMMIT_GRANULARITY - 2, &mut buf), 4);
        assert_eq!(&buf, b"ab\0\0");
    }

    #[test]
    fn test_shared_file_is_visible_on_disk() {
        let temp = tempdir().unwrap();
        let handle = next_mapping_handle();
        let file = MemoryFile::create_shared(temp.path(), handle, "C:\\out\\b.obj", RESERVE).unwrap();
        file.write_at(0, b"shared content");
        assert_invariant(&file);
        file.close_write();

        let path = mapping_path(temp.path(), handle);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[..14], b"shared content");

        let reopened = MemoryFile::open_shared(temp.path(), handle, "C:\\out\\b.obj", 14, RESERVE).unwrap();
        assert_eq!(reopened.to_vec(), b"shared content");
        assert!(reopened.is_reported());
        assert!(!reopened.is_local_only());
    }

    #[test]
    fn test_grow_committed_to_follows_writer() {
        let temp = tempdir().unwrap();
        let handle = next_mapping_handle();
        let writer = MemoryFile::create_shared(temp.path(), handle, "t", RESERVE).unwrap();
        writer.write_at(0, b"12");
        let reader = MemoryFile::open_shared(temp.path(), handle, "t", 2, RESERVE).unwrap();

        writer.write_at(2, &[7u8; 100_000]);
        reader.grow_committed_to(100_002);
        assert_eq!(reader.written_size(), 100_002);
        let mut buf = [0u8; 3];
        reader.read_at(1, &mut buf);
        assert_eq!(&buf, &[b'2', 7, 7]);
        assert_invariant(&reader);
    }

    #[test]
    fn test_file_indices_count_down() {
        let a = MemoryFile::create_local("a", RESERVE, false).unwrap();
        let b = MemoryFile::create_local("b", RESERVE, false).unwrap();
        assert!(b.file_index() < a.file_index());
        assert_eq!(a.volume_serial(), MEMORY_FILE_VOLUME_SERIAL);
        assert!(a.mark_reported());
        assert!(!a.mark_reported());
    }
}
