//! `extern "C"` trampolines with Win32 shapes.
//!
//! The injector resolves these by name and patches the tool's imports to
//! point at them. Each one borrows the attached context; with nothing
//! attached every call fails with `ERROR_INVALID_HANDLE`. Errors are
//! reported through [`uba_GetLastError`], which is per thread like the
//! Win32 original.

#![allow(non_snake_case)]

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::Mutex;
use std::{ptr, slice};
use uba_config::log_detours_warn;
use uba_ipc::win32::{FILE_ATTRIBUTE_DIRECTORY, FILE_MAP_WRITE, INVALID_FILE_ATTRIBUTES, PAGE_READWRITE};
use uba_ipc::Win32Error;

use crate::context::{self, ProcessVirtualizationContext};
use crate::directory_table::DirectoryEntry;
use crate::functions::{CreationDisposition, MappedView, MoveMethod};
use crate::handles::DetouredHandle;
use crate::sync::lock;

pub const INVALID_HANDLE_VALUE: u64 = u64::MAX;
pub const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;
pub const MAX_PATH: usize = 260;
/// `FILE_INFO_BY_HANDLE_CLASS::FileRenameInfo`.
pub const FILE_RENAME_INFO_CLASS: u32 = 3;

thread_local! {
    static LAST_ERROR: Cell<u32> = const { Cell::new(0) };
}

fn set_last_error(error: Win32Error) {
    LAST_ERROR.with(|e| e.set(error.code()));
}

/// Entry of a directory enumeration.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UbaFindData {
    pub attributes: u32,
    pub last_write_time: u64,
    pub size: u64,
    /// NUL-terminated UTF-16, truncated to fit.
    pub name: [u16; MAX_PATH],
}

impl UbaFindData {
    fn fill(&mut self, entry: &DirectoryEntry) {
        self.attributes = entry.info.attributes;
        self.last_write_time = entry.info.last_write_time;
        self.size = if entry.info.attributes & FILE_ATTRIBUTE_DIRECTORY != 0 {
            0
        } else {
            entry.info.size
        };
        self.name = [0; MAX_PATH];
        for (slot, unit) in self.name[..MAX_PATH - 1].iter_mut().zip(entry.name.encode_utf16()) {
            *slot = unit;
        }
    }
}

/// `BY_HANDLE_FILE_INFORMATION` reduced to what the tables know.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UbaFileInformation {
    pub attributes: u32,
    pub volume_serial: u32,
    pub last_write_time: u64,
    pub size: u64,
    pub file_index: u64,
}

/// `FILE_RENAME_INFO`: `file_name_length` bytes of UTF-16 follow in place
/// of `file_name`.
#[repr(C)]
pub struct UbaRenameInfo {
    pub replace_if_exists: u8,
    pub root_directory: u64,
    pub file_name_length: u32,
    pub file_name: [u16; 1],
}

/// A view handed out by [`uba_MapViewOfFile`]; the tool addresses `buffer`.
struct ViewEntry {
    buffer: Box<[u8]>,
    view: MappedView,
    flush: bool,
}

impl ViewEntry {
    fn flush(&self) -> Result<(), Win32Error> {
        if self.flush {
            self.view.write_at(0, &self.buffer)?;
        }
        Ok(())
    }
}

static VIEWS: Mutex<Vec<ViewEntry>> = Mutex::new(Vec::new());

fn split_u64(high: u32, low: u32) -> u64 {
    (high as u64) << 32 | low as u64
}

/// Read a NUL-terminated UTF-16 string.
unsafe fn wide_to_string(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16(slice::from_raw_parts(ptr, len)).ok()
}

/// Run `f` against the attached context; on error record it and return
/// `failed`.
fn with_context<T>(failed: T, f: impl FnOnce(&ProcessVirtualizationContext) -> Result<T, Win32Error>) -> T {
    let Some(context) = context::current() else {
        set_last_error(Win32Error::INVALID_HANDLE);
        return failed;
    };
    match f(context) {
        Ok(value) => value,
        Err(e) => {
            set_last_error(e);
            failed
        }
    }
}

unsafe fn path_arg(ptr: *const u16) -> Result<String, Win32Error> {
    wide_to_string(ptr).ok_or(Win32Error::INVALID_PARAMETER)
}

#[no_mangle]
pub extern "C" fn uba_GetLastError() -> u32 {
    LAST_ERROR.with(Cell::get)
}

/// Attach a context built from the environment. Returns 1 on success.
#[no_mangle]
pub unsafe extern "C" fn uba_Attach(application: *const u16) -> i32 {
    let application = wide_to_string(application).unwrap_or_default();
    #[cfg(unix)]
    let attached = context::attach_from_config(&application)
        .map(|_| ())
        .map_err(|e| e.to_string());
    #[cfg(not(unix))]
    let attached: Result<(), String> = Err("no session transport on this platform".to_string());
    match attached {
        Ok(()) => 1,
        Err(e) => {
            log_detours_warn!("Attach failed", application = application.as_str(), error = e.as_str());
            set_last_error(Win32Error::INVALID_HANDLE);
            0
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn uba_Detach() -> i32 {
    context::detach() as i32
}

#[no_mangle]
pub unsafe extern "C" fn uba_CreateFileW(
    file_name: *const u16,
    desired_access: u32,
    _share_mode: u32,
    creation_disposition: u32,
    flags_and_attributes: u32,
) -> u64 {
    with_context(INVALID_HANDLE_VALUE, |ctx| {
        let path = path_arg(file_name)?;
        let disposition = CreationDisposition::from_u32(creation_disposition).ok_or(Win32Error::INVALID_PARAMETER)?;
        let delete_on_close = flags_and_attributes & FILE_FLAG_DELETE_ON_CLOSE != 0;
        Ok(ctx.create_file(&path, desired_access, disposition, delete_on_close)?.0)
    })
}

#[no_mangle]
pub unsafe extern "C" fn uba_ReadFile(handle: u64, buffer: *mut u8, to_read: u32, read: *mut u32) -> i32 {
    with_context(0, |ctx| {
        if buffer.is_null() && to_read > 0 {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let buf: &mut [u8] = if to_read == 0 {
            &mut []
        } else {
            slice::from_raw_parts_mut(buffer, to_read as usize)
        };
        let count = ctx.read_file(DetouredHandle(handle), buf)?;
        if !read.is_null() {
            *read = count as u32;
        }
        Ok(1)
    })
}

#[no_mangle]
pub unsafe extern "C" fn uba_WriteFile(handle: u64, buffer: *const u8, to_write: u32, written: *mut u32) -> i32 {
    with_context(0, |ctx| {
        if buffer.is_null() && to_write > 0 {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let data: &[u8] = if to_write == 0 {
            &[]
        } else {
            slice::from_raw_parts(buffer, to_write as usize)
        };
        let count = ctx.write_file(DetouredHandle(handle), data)?;
        if !written.is_null() {
            *written = count as u32;
        }
        Ok(1)
    })
}

#[no_mangle]
pub unsafe extern "C" fn uba_SetFilePointerEx(handle: u64, distance: i64, new_position: *mut u64, method: u32) -> i32 {
    with_context(0, |ctx| {
        let method = MoveMethod::from_u32(method).ok_or(Win32Error::INVALID_PARAMETER)?;
        let position = ctx.set_file_pointer(DetouredHandle(handle), distance, method)?;
        if !new_position.is_null() {
            *new_position = position;
        }
        Ok(1)
    })
}

#[no_mangle]
pub unsafe extern "C" fn uba_GetFileSizeEx(handle: u64, size: *mut u64) -> i32 {
    with_context(0, |ctx| {
        if size.is_null() {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        *size = ctx.get_file_size(DetouredHandle(handle))?;
        Ok(1)
    })
}

#[no_mangle]
pub extern "C" fn uba_SetEndOfFile(handle: u64) -> i32 {
    with_context(0, |ctx| ctx.set_end_of_file(DetouredHandle(handle)).map(|()| 1))
}

#[no_mangle]
pub extern "C" fn uba_CloseHandle(handle: u64) -> i32 {
    with_context(0, |ctx| ctx.close_handle(DetouredHandle(handle)).map(|()| 1))
}

#[no_mangle]
pub unsafe extern "C" fn uba_GetFileAttributesW(file_name: *const u16) -> u32 {
    with_context(INVALID_FILE_ATTRIBUTES, |ctx| {
        let attributes = ctx.get_file_attributes(&path_arg(file_name)?);
        if attributes.exists {
            Ok(attributes.info.attributes)
        } else {
            Err(Win32Error(attributes.last_error))
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn uba_DeleteFileW(file_name: *const u16) -> i32 {
    with_context(0, |ctx| ctx.delete_file(&path_arg(file_name)?).map(|()| 1))
}

#[no_mangle]
pub unsafe extern "C" fn uba_CreateDirectoryW(path: *const u16) -> i32 {
    with_context(0, |ctx| ctx.create_directory(&path_arg(path)?).map(|()| 1))
}

#[no_mangle]
pub unsafe extern "C" fn uba_RemoveDirectoryW(path: *const u16) -> i32 {
    with_context(0, |ctx| ctx.remove_directory(&path_arg(path)?).map(|()| 1))
}

#[no_mangle]
pub unsafe extern "C" fn uba_MoveFileExW(existing: *const u16, new_name: *const u16, flags: u32) -> i32 {
    with_context(0, |ctx| {
        ctx.move_file(&path_arg(existing)?, &path_arg(new_name)?, flags)
            .map(|()| 1)
    })
}

#[no_mangle]
pub unsafe extern "C" fn uba_FindFirstFileW(file_name: *const u16, data: *mut UbaFindData) -> u64 {
    with_context(INVALID_HANDLE_VALUE, |ctx| {
        if data.is_null() {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let (handle, entry) = ctx.find_first_file(&path_arg(file_name)?)?;
        (*data).fill(&entry);
        Ok(handle.0)
    })
}

#[no_mangle]
pub unsafe extern "C" fn uba_FindNextFileW(handle: u64, data: *mut UbaFindData) -> i32 {
    with_context(0, |ctx| {
        if data.is_null() {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let entry = ctx.find_next_file(DetouredHandle(handle))?;
        (*data).fill(&entry);
        Ok(1)
    })
}

#[no_mangle]
pub extern "C" fn uba_FindClose(handle: u64) -> i32 {
    with_context(0, |ctx| ctx.find_close(DetouredHandle(handle)).map(|()| 1))
}

#[no_mangle]
pub extern "C" fn uba_DuplicateHandle(
    source: u64,
    target: *mut u64,
    _desired_access: u32,
    _inherit: i32,
    _options: u32,
) -> i32 {
    with_context(0, |ctx| {
        if target.is_null() {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let duplicate = ctx.duplicate_handle(DetouredHandle(source))?;
        unsafe { *target = duplicate.0 };
        Ok(1)
    })
}

#[no_mangle]
pub unsafe extern "C" fn uba_GetFileInformationByHandle(handle: u64, info: *mut UbaFileInformation) -> i32 {
    with_context(0, |ctx| {
        if info.is_null() {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let entry = ctx.get_file_information_by_handle(DetouredHandle(handle))?;
        *info = UbaFileInformation {
            attributes: entry.attributes,
            volume_serial: entry.volume_serial,
            last_write_time: entry.last_write_time,
            size: entry.size,
            file_index: entry.file_index,
        };
        Ok(1)
    })
}

/// Only `FileRenameInfo` is handled; the rename happens on the last close.
#[no_mangle]
pub unsafe extern "C" fn uba_SetFileInformationByHandle(
    handle: u64,
    class: u32,
    info: *const c_void,
    size: u32,
) -> i32 {
    with_context(0, |ctx| {
        if class != FILE_RENAME_INFO_CLASS || info.is_null() {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let rename = info as *const UbaRenameInfo;
        let name = ptr::addr_of!((*rename).file_name) as *const u16;
        let header = name as usize - rename as usize;
        let length = (*rename).file_name_length as usize;
        if header + length > size as usize {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let new_name =
            String::from_utf16(slice::from_raw_parts(name, length / 2)).map_err(|_| Win32Error::INVALID_PARAMETER)?;
        ctx.set_rename_on_close(DetouredHandle(handle), &new_name)?;
        Ok(1)
    })
}

/// Returns the mapping handle, zero on failure.
#[no_mangle]
pub extern "C" fn uba_CreateFileMappingW(
    file: u64,
    _attributes: *const c_void,
    protect: u32,
    max_size_high: u32,
    max_size_low: u32,
    _name: *const u16,
) -> u64 {
    with_context(0, |ctx| {
        let writable = protect & PAGE_READWRITE != 0;
        let mapping = ctx.create_file_mapping(DetouredHandle(file), split_u64(max_size_high, max_size_low), writable)?;
        Ok(mapping.0)
    })
}

/// Returns the view base, null on failure. Stores through a write view
/// reach the file on [`uba_FlushViewOfFile`] or [`uba_UnmapViewOfFile`].
#[no_mangle]
pub extern "C" fn uba_MapViewOfFile(
    mapping: u64,
    desired_access: u32,
    offset_high: u32,
    offset_low: u32,
    bytes: usize,
) -> *mut u8 {
    with_context(ptr::null_mut(), |ctx| {
        let view = ctx.map_view_of_file(DetouredHandle(mapping), split_u64(offset_high, offset_low), bytes as u64)?;
        let flush = desired_access & FILE_MAP_WRITE != 0;
        if flush && !view.is_writable() {
            return Err(Win32Error::ACCESS_DENIED);
        }
        if view.is_empty() {
            return Err(Win32Error::INVALID_PARAMETER);
        }
        let mut buffer = view.to_vec().into_boxed_slice();
        let base = buffer.as_mut_ptr();
        lock(&VIEWS).push(ViewEntry { buffer, view, flush });
        Ok(base)
    })
}

#[no_mangle]
pub extern "C" fn uba_FlushViewOfFile(base: *const u8, _bytes: usize) -> i32 {
    with_context(0, |_| {
        let views = lock(&VIEWS);
        let entry = views
            .iter()
            .find(|entry| ptr::eq(entry.buffer.as_ptr(), base))
            .ok_or(Win32Error::INVALID_PARAMETER)?;
        entry.flush()?;
        Ok(1)
    })
}

#[no_mangle]
pub extern "C" fn uba_UnmapViewOfFile(base: *const u8) -> i32 {
    with_context(0, |_| {
        let entry = {
            let mut views = lock(&VIEWS);
            let index = views
                .iter()
                .position(|entry| ptr::eq(entry.buffer.as_ptr(), base))
                .ok_or(Win32Error::INVALID_PARAMETER)?;
            views.swap_remove(index)
        };
        entry.flush()?;
        Ok(1)
    })
}

/// Copy the final path into `buffer`. Returns the length without the NUL,
/// or the size needed including it when `buffer` is too small.
#[no_mangle]
pub unsafe extern "C" fn uba_GetFinalPathNameByHandleW(handle: u64, buffer: *mut u16, len: u32) -> u32 {
    with_context(0, |ctx| {
        let path: Vec<u16> = ctx.get_final_path_name(DetouredHandle(handle))?.encode_utf16().collect();
        if buffer.is_null() || (len as usize) <= path.len() {
            return Ok(path.len() as u32 + 1);
        }
        let out = slice::from_raw_parts_mut(buffer, len as usize);
        out[..path.len()].copy_from_slice(&path);
        out[path.len()] = 0;
        Ok(path.len() as u32)
    })
}
