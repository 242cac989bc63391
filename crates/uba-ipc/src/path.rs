//! Path helpers shared by both sides.
//!
//! Paths are handled as strings in either separator style. Keys fold the
//! difference away, so these helpers only need to find component boundaries.

pub fn is_separator(c: char) -> bool {
    c == '\\' || c == '/'
}

/// Split into parent directory and final component.
///
/// `C:\proj\a.h` gives `("C:\proj", "a.h")`; `/src` gives `("", "src")`;
/// a path without a separator has no parent.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = trim_trailing_separators(path);
    let pos = trimmed.rfind(is_separator)?;
    Some((&trimmed[..pos], &trimmed[pos + 1..]))
}

pub fn file_name(path: &str) -> &str {
    match split_parent(path) {
        Some((_, name)) => name,
        None => trim_trailing_separators(path),
    }
}

pub fn trim_trailing_separators(path: &str) -> &str {
    let trimmed = path.trim_end_matches(is_separator);
    if trimmed.is_empty() && !path.is_empty() {
        // Keep a lone root separator.
        &path[..1]
    } else {
        trimmed
    }
}

/// Join `dir` and `name` with the separator style `dir` already uses.
pub fn join(dir: &str, name: &str) -> String {
    let sep = if dir.contains('\\') || !dir.contains('/') && dir.ends_with(':') {
        '\\'
    } else if dir.contains('/') || dir.is_empty() {
        '/'
    } else {
        '\\'
    };
    let mut out = String::with_capacity(dir.len() + 1 + name.len());
    out.push_str(dir.trim_end_matches(is_separator));
    out.push(sep);
    out.push_str(name);
    out
}

/// `C:` style drive roots, with or without a trailing separator.
pub fn is_drive_root(path: &str) -> bool {
    let trimmed = path.trim_end_matches(is_separator);
    let bytes = trimmed.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Case-insensitive comparison matching the key normalization.
pub fn paths_equal(a: &str, b: &str) -> bool {
    crate::keys::to_string_key(a) == crate::keys::to_string_key(b)
}
