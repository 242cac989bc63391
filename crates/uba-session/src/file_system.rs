//! The session's authoritative view of the file system.
//!
//! Entries are either virtual (added by the session or produced by detoured
//! processes into shared memory) or imported lazily from the host disk when
//! host passthrough is enabled.

use std::collections::HashMap;
use tracing::debug;
use uba_ipc::path::{join, split_parent};
use uba_ipc::table_types::{DirectoryInfo, DirectoryItem};
use uba_ipc::win32::{
    file_time_now, to_file_time, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL, FILE_ATTRIBUTE_READONLY,
};
use uba_ipc::{to_string_key, MappingHandle, StringKey, Win32Error};

const VIRTUAL_VOLUME_SERIAL: u32 = 0x0ba0_0001;

/// Where the bytes of a file live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Content {
    /// On the host disk under the node's path (or nowhere, for directories).
    Disk,
    /// In a session mapping file at `offset`.
    Mapping { handle: MappingHandle, offset: u64 },
    /// In a shared memory file written by a detoured process.
    Shared { handle: MappingHandle },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub path: String,
    pub name: String,
    pub attributes: u32,
    pub volume_serial: u32,
    pub file_index: u64,
    pub last_write_time: u64,
    pub size: u64,
    pub content: Content,
    /// Known children of a directory, in insertion order.
    children: Option<Vec<StringKey>>,
}

impl Node {
    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    pub fn to_item(&self) -> DirectoryItem {
        DirectoryItem {
            name: self.name.clone(),
            attributes: self.attributes,
            volume_serial: self.volume_serial,
            file_index: self.file_index,
            last_write_time: self.last_write_time,
            size: if self.is_directory() { 0 } else { self.size },
        }
    }

    pub fn info(&self) -> DirectoryInfo {
        DirectoryInfo {
            attributes: self.attributes,
            volume_serial: self.volume_serial,
            file_index: self.file_index,
        }
    }
}

pub struct SessionFileSystem {
    nodes: HashMap<StringKey, Node>,
    host_passthrough: bool,
    next_file_index: u64,
}

impl SessionFileSystem {
    pub fn new(host_passthrough: bool) -> Self {
        Self {
            nodes: HashMap::new(),
            host_passthrough,
            next_file_index: 0x1000,
        }
    }

    pub fn host_passthrough(&self) -> bool {
        self.host_passthrough
    }

    fn next_index(&mut self) -> u64 {
        self.next_file_index += 1;
        self.next_file_index
    }

    /// Entry at `path`, importing it from disk when allowed.
    pub fn lookup(&mut self, path: &str) -> Option<&Node> {
        let key = to_string_key(path);
        if !self.nodes.contains_key(&key) {
            let node = self.import_host(path)?;
            self.nodes.insert(key, node);
        }
        self.nodes.get(&key)
    }

    pub fn exists(&mut self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Children of a directory; `None` when `path` is not a directory.
    pub fn list(&mut self, path: &str) -> Option<Vec<Node>> {
        let key = to_string_key(path);
        if !self.lookup(path)?.is_directory() {
            return None;
        }
        let needs_import = self.nodes.get(&key).is_some_and(|n| n.children.is_none());
        if needs_import {
            let children = self.import_host_children(path);
            if let Some(node) = self.nodes.get_mut(&key) {
                node.children = Some(children);
            }
        }
        let node = self.nodes.get(&key)?;
        let children = node.children.as_deref().unwrap_or_default();
        Some(children.iter().filter_map(|k| self.nodes.get(k)).cloned().collect())
    }

    /// Create `path` and any missing ancestors as virtual directories.
    pub fn add_directory(&mut self, path: &str) -> &Node {
        let key = to_string_key(path);
        if !self.nodes.get(&key).is_some_and(Node::is_directory) {
            let name = match split_parent(path) {
                Some((parent, name)) => {
                    self.add_directory(parent);
                    name.to_string()
                }
                None => path.to_string(),
            };
            let node = Node {
                path: path.to_string(),
                name,
                attributes: FILE_ATTRIBUTE_DIRECTORY,
                volume_serial: VIRTUAL_VOLUME_SERIAL,
                file_index: self.next_index(),
                last_write_time: file_time_now(),
                size: 0,
                content: Content::Disk,
                children: Some(Vec::new()),
            };
            self.insert(key, node);
        }
        &self.nodes[&key]
    }

    /// Add or replace a file, creating its parent directories.
    pub fn add_file(&mut self, path: &str, size: u64, content: Content) -> &Node {
        let key = to_string_key(path);
        let name = match split_parent(path) {
            Some((parent, name)) => {
                self.add_directory(parent);
                name.to_string()
            }
            None => path.to_string(),
        };
        let file_index = match self.nodes.get(&key) {
            Some(existing) => existing.file_index,
            None => self.next_index(),
        };
        let node = Node {
            path: path.to_string(),
            name,
            attributes: FILE_ATTRIBUTE_NORMAL,
            volume_serial: VIRTUAL_VOLUME_SERIAL,
            file_index,
            last_write_time: file_time_now(),
            size,
            content,
            children: None,
        };
        self.insert(key, node);
        &self.nodes[&key]
    }

    /// Re-read a file written to disk by a detoured process.
    pub fn refresh_from_disk(&mut self, path: &str, fallback_size: u64) -> &Node {
        match self.import_host(path) {
            Some(node) => {
                if let Some((parent, _)) = split_parent(path) {
                    self.add_directory(parent);
                }
                let key = to_string_key(path);
                self.insert(key, node);
                &self.nodes[&key]
            }
            None => self.add_file(path, fallback_size, Content::Disk),
        }
    }

    pub fn create_directory(&mut self, path: &str) -> Result<&Node, Win32Error> {
        let (parent, _) = split_parent(path).ok_or(Win32Error::PATH_NOT_FOUND)?;
        match self.lookup(parent) {
            Some(node) if node.is_directory() => {}
            _ => return Err(Win32Error::PATH_NOT_FOUND),
        }
        if self.exists(path) {
            return Err(Win32Error::ALREADY_EXISTS);
        }
        if self.host_passthrough {
            std::fs::create_dir(path)?;
        }
        Ok(self.add_directory(path))
    }

    pub fn remove_directory(&mut self, path: &str) -> Result<Node, Win32Error> {
        match self.lookup(path) {
            None => return Err(Win32Error::FILE_NOT_FOUND),
            Some(node) if !node.is_directory() => return Err(Win32Error::INVALID_PARAMETER),
            Some(_) => {}
        }
        if !self.list(path).unwrap_or_default().is_empty() {
            return Err(Win32Error::DIR_NOT_EMPTY);
        }
        if self.host_passthrough {
            match std::fs::remove_dir(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.remove(path).ok_or(Win32Error::FILE_NOT_FOUND)
    }

    pub fn delete_file(&mut self, path: &str) -> Result<Node, Win32Error> {
        let content = match self.lookup(path) {
            None => return Err(Win32Error::FILE_NOT_FOUND),
            Some(node) if node.is_directory() => return Err(Win32Error::ACCESS_DENIED),
            Some(node) => node.content,
        };
        if self.host_passthrough && content == Content::Disk {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.remove(path).ok_or(Win32Error::FILE_NOT_FOUND)
    }

    /// Move a file or directory. Returns the node at its new location.
    pub fn move_entry(&mut self, from: &str, to: &str, replace: bool) -> Result<Node, Win32Error> {
        let source = self.lookup(from).cloned().ok_or(Win32Error::FILE_NOT_FOUND)?;
        let (to_parent, to_name) = split_parent(to).ok_or(Win32Error::PATH_NOT_FOUND)?;
        if !self.lookup(to_parent).is_some_and(Node::is_directory) {
            return Err(Win32Error::PATH_NOT_FOUND);
        }
        if let Some(existing) = self.lookup(to).cloned() {
            if !replace || existing.is_directory() || source.is_directory() {
                return Err(Win32Error::ALREADY_EXISTS);
            }
            self.remove(to);
        }
        if self.host_passthrough && source.content == Content::Disk {
            std::fs::rename(from, to)?;
        }

        // Re-key the subtree under the new path.
        let subtree = self.take_subtree(from);
        let root_len = subtree.first().map_or(0, |n| n.path.len());
        for (i, mut node) in subtree.into_iter().enumerate() {
            node.path = format!("{}{}", to, node.path.get(root_len..).unwrap_or_default());
            if i == 0 {
                node.name = to_name.to_string();
            }
            let key = to_string_key(&node.path);
            // Children re-register themselves as they are inserted below.
            if let Some(children) = node.children.as_mut() {
                children.clear();
            }
            self.insert(key, node);
        }
        debug!(from, to, "Moved entry");
        self.nodes
            .get(&to_string_key(to))
            .cloned()
            .ok_or(Win32Error::FILE_NOT_FOUND)
    }

    /// Remove `path` and everything below it, parents first.
    fn take_subtree(&mut self, path: &str) -> Vec<Node> {
        let mut out = Vec::new();
        let Some(root) = self.remove(path) else {
            return out;
        };
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            for child in node.children.iter().flatten() {
                if let Some(child_node) = self.nodes.remove(child) {
                    stack.push(child_node);
                }
            }
            out.push(node);
        }
        out
    }

    fn insert(&mut self, key: StringKey, node: Node) {
        if let Some((parent, _)) = split_parent(&node.path) {
            let parent_key = to_string_key(parent);
            if let Some(children) = self.nodes.get_mut(&parent_key).and_then(|p| p.children.as_mut()) {
                if !children.contains(&key) {
                    children.push(key);
                }
            }
        }
        self.nodes.insert(key, node);
    }

    pub fn remove(&mut self, path: &str) -> Option<Node> {
        let key = to_string_key(path);
        let node = self.nodes.remove(&key)?;
        if let Some((parent, _)) = split_parent(path) {
            if let Some(children) = self
                .nodes
                .get_mut(&to_string_key(parent))
                .and_then(|p| p.children.as_mut())
            {
                children.retain(|k| *k != key);
            }
        }
        Some(node)
    }

    fn import_host(&mut self, path: &str) -> Option<Node> {
        if !self.host_passthrough {
            return None;
        }
        let metadata = std::fs::metadata(path).ok()?;
        let name = match split_parent(path) {
            Some((_, name)) => name.to_string(),
            None => path.to_string(),
        };
        Some(self.node_from_metadata(path.to_string(), name, &metadata))
    }

    fn import_host_children(&mut self, path: &str) -> Vec<StringKey> {
        if !self.host_passthrough {
            return Vec::new();
        }
        let Ok(entries) = std::fs::read_dir(if path.is_empty() { "/" } else { path }) else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_path = join(path, &name);
            let key = to_string_key(&child_path);
            if !self.nodes.contains_key(&key) {
                let node = self.node_from_metadata(child_path, name, &metadata);
                self.nodes.insert(key, node);
            }
            keys.push(key);
        }
        keys
    }

    fn node_from_metadata(&mut self, path: String, name: String, metadata: &std::fs::Metadata) -> Node {
        let mut attributes = if metadata.is_dir() {
            FILE_ATTRIBUTE_DIRECTORY
        } else {
            FILE_ATTRIBUTE_NORMAL
        };
        if metadata.permissions().readonly() {
            attributes |= FILE_ATTRIBUTE_READONLY;
            attributes &= !FILE_ATTRIBUTE_NORMAL;
        }
        #[cfg(unix)]
        let (volume_serial, file_index) = {
            use std::os::unix::fs::MetadataExt;
            (metadata.dev() as u32, metadata.ino())
        };
        #[cfg(not(unix))]
        let (volume_serial, file_index) = (VIRTUAL_VOLUME_SERIAL, self.next_index());
        Node {
            path,
            name,
            attributes,
            volume_serial,
            file_index,
            last_write_time: metadata.modified().map(to_file_time).unwrap_or_default(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            content: Content::Disk,
            children: None,
        }
    }
}
