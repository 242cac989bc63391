//! Fixed-width keys used on the wire and in the shared tables.
//!
//! A `StringKey` identifies a path. Hashing folds case and treats `/` and `\`
//! as the same separator, so every spelling of a path maps to one key.

use std::fmt;

/// 128-bit normalized path hash, written as two native-endian words.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StringKey {
    pub a: u64,
    pub b: u64,
}

const _: () = assert!(std::mem::size_of::<StringKey>() == 16);

impl StringKey {
    pub const ZERO: StringKey = StringKey { a: 0, b: 0 };

    pub fn is_zero(&self) -> bool {
        self.a == 0 && self.b == 0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&bytes[..8]);
        b.copy_from_slice(&bytes[8..]);
        Self {
            a: u64::from_ne_bytes(a),
            b: u64::from_ne_bytes(b),
        }
    }
}

impl fmt::Debug for StringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StringKey({:016x}{:016x})", self.a, self.b)
    }
}

impl fmt::Display for StringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.a, self.b)
    }
}

/// Content hash: two 64-bit words plus one 32-bit word (20 bytes on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct CasKey {
    pub a: u64,
    pub b: u64,
    pub c: u32,
}

impl CasKey {
    pub const ZERO: CasKey = CasKey { a: 0, b: 0, c: 0 };

    /// BLAKE3 of `data`, truncated to 20 bytes.
    pub fn from_content(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let bytes = hash.as_bytes();
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        let mut c = [0u8; 4];
        a.copy_from_slice(&bytes[0..8]);
        b.copy_from_slice(&bytes[8..16]);
        c.copy_from_slice(&bytes[16..20]);
        Self {
            a: u64::from_ne_bytes(a),
            b: u64::from_ne_bytes(b),
            c: u32::from_ne_bytes(c),
        }
    }
}

/// 16-byte GUID, two 64-bit words.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Guid {
    pub a: u64,
    pub b: u64,
}

/// Incremental path hasher.
///
/// Clone a hasher that has consumed a directory path to derive the keys of its
/// children without re-hashing the prefix:
///
/// ```
/// use uba_ipc::{to_string_key, StringKeyHasher};
///
/// let mut dir = StringKeyHasher::new();
/// dir.update("C:\\proj");
/// let mut child = dir.clone();
/// child.update("\\SRC");
/// assert_eq!(child.finalize(), to_string_key("c:/proj/src"));
/// ```
#[derive(Clone, Default)]
pub struct StringKeyHasher {
    inner: blake3::Hasher,
}

impl StringKeyHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, s: &str) -> &mut Self {
        let mut buf = [0u8; 4];
        for c in s.chars() {
            if c == '/' {
                self.inner.update(b"\\");
                continue;
            }
            if c.is_ascii() {
                buf[0] = c.to_ascii_lowercase() as u8;
                self.inner.update(&buf[..1]);
                continue;
            }
            for lc in c.to_lowercase() {
                self.inner.update(lc.encode_utf8(&mut buf).as_bytes());
            }
        }
        self
    }

    pub fn finalize(&self) -> StringKey {
        let hash = self.inner.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        StringKey::from_bytes(bytes)
    }
}

/// Key of a whole path.
pub fn to_string_key(path: &str) -> StringKey {
    StringKeyHasher::new().update(path).finalize()
}
