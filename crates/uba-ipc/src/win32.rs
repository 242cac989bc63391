//! Win32 constants carried on the wire and returned by detoured functions.

use std::time::{SystemTime, UNIX_EPOCH};

pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
pub const INVALID_FILE_ATTRIBUTES: u32 = u32::MAX;

pub const GENERIC_READ: u32 = 0x8000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const DELETE: u32 = 0x0001_0000;
pub const FILE_READ_DATA: u32 = 0x0000_0001;
pub const FILE_WRITE_DATA: u32 = 0x0000_0002;
pub const FILE_APPEND_DATA: u32 = 0x0000_0004;

pub const MOVEFILE_REPLACE_EXISTING: u32 = 0x1;

pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const FILE_MAP_WRITE: u32 = 0x0002;
pub const FILE_MAP_READ: u32 = 0x0004;

pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_PATH_NOT_FOUND: u32 = 3;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_NO_MORE_FILES: u32 = 18;
pub const ERROR_HANDLE_EOF: u32 = 38;
pub const ERROR_FILE_EXISTS: u32 = 80;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_DIR_NOT_EMPTY: u32 = 145;
pub const ERROR_ALREADY_EXISTS: u32 = 183;

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILE_TIME_EPOCH_OFFSET: u64 = 116_444_736_000_000_000;

pub fn is_directory(attributes: u32) -> bool {
    attributes != INVALID_FILE_ATTRIBUTES && attributes & FILE_ATTRIBUTE_DIRECTORY != 0
}

pub fn has_write_access(access: u32) -> bool {
    access & (GENERIC_WRITE | FILE_WRITE_DATA | FILE_APPEND_DATA) != 0
}

/// Convert to a FILETIME value (100ns ticks since 1601).
pub fn to_file_time(time: SystemTime) -> u64 {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    FILE_TIME_EPOCH_OFFSET + since_epoch.as_nanos() as u64 / 100
}

pub fn file_time_now() -> u64 {
    to_file_time(SystemTime::now())
}

/// A Win32 error code, as returned through `GetLastError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("win32 error {0}")]
pub struct Win32Error(pub u32);

impl Win32Error {
    pub const FILE_NOT_FOUND: Win32Error = Win32Error(ERROR_FILE_NOT_FOUND);
    pub const PATH_NOT_FOUND: Win32Error = Win32Error(ERROR_PATH_NOT_FOUND);
    pub const ACCESS_DENIED: Win32Error = Win32Error(ERROR_ACCESS_DENIED);
    pub const INVALID_HANDLE: Win32Error = Win32Error(ERROR_INVALID_HANDLE);
    pub const NO_MORE_FILES: Win32Error = Win32Error(ERROR_NO_MORE_FILES);
    pub const FILE_EXISTS: Win32Error = Win32Error(ERROR_FILE_EXISTS);
    pub const INVALID_PARAMETER: Win32Error = Win32Error(ERROR_INVALID_PARAMETER);
    pub const DIR_NOT_EMPTY: Win32Error = Win32Error(ERROR_DIR_NOT_EMPTY);
    pub const ALREADY_EXISTS: Win32Error = Win32Error(ERROR_ALREADY_EXISTS);

    pub fn code(self) -> u32 {
        self.0
    }
}

impl From<&std::io::Error> for Win32Error {
    fn from(error: &std::io::Error) -> Self {
        Win32Error(error_from_io(error))
    }
}

impl From<std::io::Error> for Win32Error {
    fn from(error: std::io::Error) -> Self {
        Win32Error(error_from_io(&error))
    }
}

/// Map an I/O error to the closest Win32 error code.
pub fn error_from_io(error: &std::io::Error) -> u32 {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::NotFound => ERROR_FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ERROR_ACCESS_DENIED,
        ErrorKind::AlreadyExists => ERROR_ALREADY_EXISTS,
        ErrorKind::InvalidInput => ERROR_INVALID_PARAMETER,
        _ => match error.raw_os_error() {
            Some(39) | Some(66) => ERROR_DIR_NOT_EMPTY, // ENOTEMPTY on linux / macos
            _ => ERROR_ACCESS_DENIED,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_file_time_epoch() {
        assert_eq!(to_file_time(UNIX_EPOCH), FILE_TIME_EPOCH_OFFSET);
        assert_eq!(
            to_file_time(UNIX_EPOCH + Duration::from_secs(1)),
            FILE_TIME_EPOCH_OFFSET + 10_000_000
        );
    }

    #[test]
    fn test_is_directory() {
        assert!(is_directory(FILE_ATTRIBUTE_DIRECTORY | FILE_ATTRIBUTE_READONLY));
        assert!(!is_directory(FILE_ATTRIBUTE_NORMAL));
        assert!(!is_directory(INVALID_FILE_ATTRIBUTES));
    }

    #[test]
    fn test_error_from_io() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(error_from_io(&err), ERROR_FILE_NOT_FOUND);
        assert_eq!(Win32Error::from(err), Win32Error::FILE_NOT_FOUND);
    }
}
