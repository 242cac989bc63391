//! Per-tool decisions about which paths are virtualized and how.
//!
//! The profile is picked once when the layer attaches, from the configured
//! name or the executable name.

use uba_config::DetoursConfig;
use uba_ipc::path::file_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolProfile {
    #[default]
    Default,
    /// cl.exe and its front/back ends
    Msvc,
    Clang,
    /// link.exe, lld-link
    Linker,
}

impl ToolProfile {
    /// Detect from the path of the running executable.
    pub fn from_application(application: &str) -> Self {
        let name = file_name(application).to_ascii_lowercase();
        let stem = name.strip_suffix(".exe").unwrap_or(&name);
        match stem {
            "cl" | "c1" | "c1xx" | "c2" => ToolProfile::Msvc,
            "link" | "lld-link" | "ld.lld" | "lib" => ToolProfile::Linker,
            s if s.starts_with("clang") => ToolProfile::Clang,
            _ => ToolProfile::Default,
        }
    }

    /// Parse the configured profile name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "default" => Some(ToolProfile::Default),
            "cl" | "msvc" => Some(ToolProfile::Msvc),
            "clang" => Some(ToolProfile::Clang),
            "link" | "linker" => Some(ToolProfile::Linker),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolProfile::Default => "default",
            ToolProfile::Msvc => "msvc",
            ToolProfile::Clang => "clang",
            ToolProfile::Linker => "linker",
        }
    }

    fn output_extensions(self) -> &'static [&'static str] {
        match self {
            ToolProfile::Default => &[],
            ToolProfile::Msvc => &["obj", "pch", "sarif", "json"],
            ToolProfile::Clang => &["o", "obj", "d", "pch", "gch", "json"],
            ToolProfile::Linker => &["exe", "dll", "lib", "exp"],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rules {
    profile: ToolProfile,
    keep_in_memory_extensions: Vec<String>,
}

impl Rules {
    pub fn new(profile: ToolProfile) -> Self {
        Self {
            profile,
            keep_in_memory_extensions: Vec::new(),
        }
    }

    /// Build from the detours config; `application` is used when no profile
    /// is configured or the configured one is unknown.
    pub fn from_config(config: &DetoursConfig, application: &str) -> Self {
        let profile = config
            .tool_profile
            .as_deref()
            .and_then(ToolProfile::parse)
            .unwrap_or_else(|| ToolProfile::from_application(application));
        Self {
            profile,
            keep_in_memory_extensions: config
                .keep_in_memory_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn profile(&self) -> ToolProfile {
        self.profile
    }

    /// Paths the layer must leave to the real OS: devices, pipes and
    /// alternate streams.
    pub fn can_detour(&self, path: &str) -> bool {
        if path.is_empty() || path.contains("::") {
            return false;
        }
        if path.starts_with("\\\\.\\") || path.starts_with("\\\\?\\pipe") {
            return false;
        }
        !matches!(
            file_name(path).to_ascii_lowercase().as_str(),
            "nul" | "con" | "conin$" | "conout$"
        )
    }

    /// Intermediate files handed from one process of the tool to the next
    /// through the session.
    pub fn needs_shared_memory(&self, path: &str) -> bool {
        match self.profile {
            ToolProfile::Msvc => file_name(path).to_ascii_lowercase().starts_with("_cl_"),
            _ => false,
        }
    }

    pub fn keep_in_memory(&self, path: &str, is_write: bool) -> bool {
        if is_write && self.needs_shared_memory(path) {
            return true;
        }
        match extension(path) {
            Some(ext) => self.keep_in_memory_extensions.iter().any(|e| *e == ext),
            None => false,
        }
    }

    /// Files the tool produces that the session must learn about on close.
    pub fn is_output_file(&self, path: &str) -> bool {
        match extension(path) {
            Some(ext) => self.profile.output_extensions().contains(&ext.as_str()),
            None => false,
        }
    }

    /// Written files nobody reads back; content is discarded.
    pub fn is_throw_away(&self, path: &str) -> bool {
        let name = file_name(path).to_ascii_lowercase();
        match self.profile {
            ToolProfile::Msvc => name.starts_with("vctip_"),
            ToolProfile::Linker => name.ends_with(".ilk"),
            _ => false,
        }
    }
}

fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}
