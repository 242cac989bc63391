//! The real file system underneath the layer.
//!
//! Everything the layer cannot answer from its tables or memory files goes
//! through [`TrueFunctions`]. Tests swap in their own implementation to see
//! which calls reach the OS.

use std::fs::{File, Metadata, OpenOptions};
use std::path::Path;
use uba_ipc::win32::{
    has_write_access, to_file_time, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL, FILE_ATTRIBUTE_READONLY,
    GENERIC_READ, FILE_READ_DATA,
};
use uba_ipc::Win32Error;

use crate::directory_table::{DirectoryEntry, EntryInformation};
use crate::functions::CreationDisposition;

pub trait TrueFunctions: Send + Sync {
    fn metadata(&self, path: &str) -> Result<EntryInformation, Win32Error>;

    fn open(&self, path: &str, desired_access: u32, disposition: CreationDisposition) -> Result<File, Win32Error>;

    fn delete_file(&self, path: &str) -> Result<(), Win32Error>;

    fn create_directory(&self, path: &str) -> Result<(), Win32Error>;

    fn remove_directory(&self, path: &str) -> Result<(), Win32Error>;

    fn move_file(&self, from: &str, to: &str, replace_existing: bool) -> Result<(), Win32Error>;

    fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>, Win32Error>;
}

/// [`TrueFunctions`] on top of `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFunctions;

pub(crate) fn info_from_metadata(metadata: &Metadata) -> EntryInformation {
    let mut attributes = if metadata.is_dir() {
        FILE_ATTRIBUTE_DIRECTORY
    } else {
        FILE_ATTRIBUTE_NORMAL
    };
    if metadata.permissions().readonly() {
        attributes = (attributes & !FILE_ATTRIBUTE_NORMAL) | FILE_ATTRIBUTE_READONLY;
    }
    let (volume_serial, file_index) = file_identity(metadata);
    EntryInformation {
        attributes,
        volume_serial,
        file_index,
        last_write_time: metadata.modified().map(to_file_time).unwrap_or_default(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
    }
}

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> (u32, u64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev() as u32, metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> (u32, u64) {
    (0, 0)
}

impl TrueFunctions for OsFunctions {
    fn metadata(&self, path: &str) -> Result<EntryInformation, Win32Error> {
        let metadata = std::fs::metadata(path).map_err(|e| Win32Error::from(&e))?;
        Ok(info_from_metadata(&metadata))
    }

    fn open(&self, path: &str, desired_access: u32, disposition: CreationDisposition) -> Result<File, Win32Error> {
        let write = has_write_access(desired_access);
        let mut options = OpenOptions::new();
        options
            .read(desired_access & (GENERIC_READ | FILE_READ_DATA) != 0 || !write)
            .write(write);
        match disposition {
            CreationDisposition::CreateNew => options.create_new(true),
            CreationDisposition::CreateAlways => options.create(true).truncate(true),
            CreationDisposition::OpenExisting => &mut options,
            CreationDisposition::OpenAlways => options.create(true),
            CreationDisposition::TruncateExisting => options.truncate(true),
        };
        options.open(path).map_err(|e| Win32Error::from(&e))
    }

    fn delete_file(&self, path: &str) -> Result<(), Win32Error> {
        std::fs::remove_file(path).map_err(|e| Win32Error::from(&e))
    }

    fn create_directory(&self, path: &str) -> Result<(), Win32Error> {
        std::fs::create_dir(path).map_err(|e| Win32Error::from(&e))
    }

    fn remove_directory(&self, path: &str) -> Result<(), Win32Error> {
        std::fs::remove_dir(path).map_err(|e| Win32Error::from(&e))
    }

    fn move_file(&self, from: &str, to: &str, replace_existing: bool) -> Result<(), Win32Error> {
        if !replace_existing && Path::new(to).exists() {
            return Err(Win32Error::ALREADY_EXISTS);
        }
        std::fs::rename(from, to).map_err(|e| Win32Error::from(&e))
    }

    fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>, Win32Error> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path).map_err(|e| Win32Error::from(&e))? {
            let entry = entry.map_err(|e| Win32Error::from(&e))?;
            let metadata = entry.metadata().map_err(|e| Win32Error::from(&e))?;
            entries.push(DirectoryEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                info: info_from_metadata(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::tempdir;
    use uba_ipc::win32::GENERIC_WRITE;

    #[test]
    fn test_metadata_and_listing() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.h"), b"12345").unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        let root = temp.path().to_str().unwrap();

        let info = OsFunctions.metadata(&format!("{}/a.h", root)).unwrap();
        assert_eq!(info.size, 5);
        assert!(!info.is_directory());

        let entries = OsFunctions.list_directory(root).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.h", "sub"]);
        assert!(entries[1].info.is_directory());

        assert_eq!(
            OsFunctions.metadata(&format!("{}/missing", root)),
            Err(Win32Error::FILE_NOT_FOUND)
        );
    }

    #[test]
    fn test_open_dispositions() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("out.txt");
        let path = path.to_str().unwrap();

        assert_eq!(
            OsFunctions.open(path, GENERIC_READ, CreationDisposition::OpenExisting).err(),
            Some(Win32Error::FILE_NOT_FOUND)
        );
        let mut file = OsFunctions.open(path, GENERIC_WRITE, CreationDisposition::CreateNew).unwrap();
        file.write_all(b"hello").unwrap();
        drop(file);
        assert_eq!(
            OsFunctions.open(path, GENERIC_WRITE, CreationDisposition::CreateNew).err(),
            Some(Win32Error::ALREADY_EXISTS)
        );

        let mut content = String::new();
        OsFunctions
            .open(path, GENERIC_READ, CreationDisposition::OpenExisting)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_move_without_replace() {
        let temp = tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();
        let (a, b) = (a.to_str().unwrap(), b.to_str().unwrap());
        assert_eq!(OsFunctions.move_file(a, b, false), Err(Win32Error::ALREADY_EXISTS));
        OsFunctions.move_file(a, b, true).unwrap();
        assert_eq!(std::fs::read(b).unwrap(), b"a");
    }
}
