//! Flat-buffer codec shared by RPC payloads and the shared tables.
//!
//! Fixed-width values are native-endian. Counts and sizes use 7-bit groups
//! with bit 7 as the continuation flag. Strings are a 7-bit character count
//! followed by each character as UTF-8.
//!
//! Writers have a fixed capacity and readers a fixed length. Going past either
//! is a programming error and panics; use the `try_*` readers when probing a
//! buffer that may hold a partial record.

use crate::keys::{CasKey, Guid, StringKey};

/// Decoded in place of 4-byte UTF-8 sequences, which the wire format does not
/// carry as surrogate pairs.
pub const INVALID_CHAR: char = char::REPLACEMENT_CHARACTER;

/// Number of bytes `write_7bit_encoded(value)` produces.
pub fn get_7bit_encoded_count(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Number of bytes `write_string(s)` produces.
pub fn get_string_write_size(s: &str) -> usize {
    get_7bit_encoded_count(s.chars().count() as u64) + s.len()
}

pub struct BinaryWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BinaryWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    fn alloc(&mut self, size: usize) -> &mut [u8] {
        assert!(
            size <= self.remaining(),
            "BinaryWriter overflow: writing {} bytes with {} of {} left",
            size,
            self.remaining(),
            self.buf.len()
        );
        let start = self.pos;
        self.pos += size;
        &mut self.buf[start..self.pos]
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.alloc(data.len()).copy_from_slice(data);
    }

    pub fn write_byte(&mut self, value: u8) {
        self.alloc(1)[0] = value;
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_byte(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_ne_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_ne_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_ne_bytes());
    }

    pub fn write_7bit_encoded(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.write_byte(byte);
            if value == 0 {
                break;
            }
        }
    }

    pub fn write_string(&mut self, s: &str) {
        let size = get_string_write_size(s);
        assert!(
            size <= self.remaining(),
            "BinaryWriter overflow: string of {} bytes with {} left",
            size,
            self.remaining()
        );
        self.write_7bit_encoded(s.chars().count() as u64);
        self.write_bytes(s.as_bytes());
    }

    pub fn write_string_key(&mut self, key: StringKey) {
        self.write_u64(key.a);
        self.write_u64(key.b);
    }

    pub fn write_cas_key(&mut self, key: CasKey) {
        self.write_u64(key.a);
        self.write_u64(key.b);
        self.write_u32(key.c);
    }

    pub fn write_guid(&mut self, guid: Guid) {
        self.write_u64(guid.a);
        self.write_u64(guid.b);
    }
}

pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reader positioned at `pos` inside `data`.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        assert!(pos <= data.len(), "BinaryReader position {} past end {}", pos, data.len());
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        assert!(pos <= self.data.len(), "BinaryReader position {} past end {}", pos, self.data.len());
        self.pos = pos;
    }

    pub fn left(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn skip(&mut self, count: usize) {
        self.read_bytes(count);
    }

    pub fn read_bytes(&mut self, count: usize) -> &'a [u8] {
        assert!(
            count <= self.left(),
            "BinaryReader read past end: {} bytes wanted with {} left",
            count,
            self.left()
        );
        let start = self.pos;
        self.pos += count;
        &self.data[start..self.pos]
    }

    fn read_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N));
        out
    }

    pub fn read_byte(&mut self) -> u8 {
        self.read_bytes(1)[0]
    }

    pub fn read_bool(&mut self) -> bool {
        self.read_byte() != 0
    }

    pub fn read_u16(&mut self) -> u16 {
        u16::from_ne_bytes(self.read_array())
    }

    pub fn read_u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.read_array())
    }

    pub fn read_u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.read_array())
    }

    pub fn read_7bit_encoded(&mut self) -> u64 {
        match self.try_read_7bit_encoded() {
            Some(value) => value,
            None => panic!(
                "BinaryReader: malformed or truncated 7-bit value at {}",
                self.pos
            ),
        }
    }

    /// Bounds-checked 7-bit decode. Leaves the position untouched on failure.
    pub fn try_read_7bit_encoded(&mut self) -> Option<u64> {
        let mut pos = self.pos;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.data.get(pos)?;
            pos += 1;
            if shift >= 64 || (shift == 63 && (byte & 0x7e) != 0) {
                return None;
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        self.pos = pos;
        Some(result)
    }

    pub fn read_string(&mut self) -> String {
        match self.try_read_string() {
            Some(s) => s,
            None => panic!("BinaryReader: truncated string at {}", self.pos),
        }
    }

    /// Bounds-checked string decode. Leaves the position untouched on failure.
    pub fn try_read_string(&mut self) -> Option<String> {
        let start = self.pos;
        let result = self.try_read_string_inner();
        if result.is_none() {
            self.pos = start;
        }
        result
    }

    fn try_read_string_inner(&mut self) -> Option<String> {
        let count = self.try_read_7bit_encoded()? as usize;
        // Every character takes at least one byte.
        if count > self.left() {
            return None;
        }
        let mut out = String::with_capacity(count);
        for _ in 0..count {
            let lead = self.next()?;
            let c = if lead < 0x80 {
                lead as char
            } else if lead & 0xe0 == 0xc0 {
                let b1 = self.next()?;
                decode(((u32::from(lead) & 0x1f) << 6) | (u32::from(b1) & 0x3f))
            } else if lead & 0xf0 == 0xe0 {
                let b1 = self.next()?;
                let b2 = self.next()?;
                decode(
                    ((u32::from(lead) & 0x0f) << 12)
                        | ((u32::from(b1) & 0x3f) << 6)
                        | (u32::from(b2) & 0x3f),
                )
            } else if lead & 0xf8 == 0xf0 {
                // Surrogate pairs are not reconstructed.
                for _ in 0..3 {
                    self.next()?;
                }
                INVALID_CHAR
            } else {
                INVALID_CHAR
            };
            out.push(c);
        }
        Some(out)
    }

    fn next(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    pub fn read_string_key(&mut self) -> StringKey {
        let a = self.read_u64();
        let b = self.read_u64();
        StringKey { a, b }
    }

    pub fn read_cas_key(&mut self) -> CasKey {
        let a = self.read_u64();
        let b = self.read_u64();
        let c = self.read_u32();
        CasKey { a, b, c }
    }

    pub fn read_guid(&mut self) -> Guid {
        let a = self.read_u64();
        let b = self.read_u64();
        Guid { a, b }
    }
}

fn decode(code: u32) -> char {
    char::from_u32(code).unwrap_or(INVALID_CHAR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::to_string_key;

    fn string_roundtrip(s: &str) -> String {
        let mut buf = [0u8; 256];
        let mut writer = BinaryWriter::new(&mut buf);
        writer.write_string(s);
        let len = writer.position();
        assert_eq!(len, get_string_write_size(s));
        let mut reader = BinaryReader::new(&buf[..len]);
        let out = reader.read_string();
        assert_eq!(reader.left(), 0);
        out
    }

    #[test]
    fn test_string_roundtrip() {
        for s in ["", "a", "C:\\proj\\src\\foo.cpp", "naïve", "日本語のパス", "ÿ€"] {
            assert_eq!(string_roundtrip(s), s);
        }
    }

    #[test]
    fn test_string_length_is_in_characters() {
        let mut buf = [0u8; 16];
        let mut writer = BinaryWriter::new(&mut buf);
        writer.write_string("é€");
        // count 2, then 2 + 3 bytes of UTF-8
        assert_eq!(writer.written(), &[2, 0xc3, 0xa9, 0xe2, 0x82, 0xac]);
    }

    #[test]
    fn test_four_byte_sequence_decodes_to_sentinel() {
        let decoded = string_roundtrip("a😀b");
        assert_eq!(decoded, format!("a{}b", INVALID_CHAR));
    }

    #[test]
    fn test_7bit_roundtrip_and_length() {
        let values = [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, 1 << 56, u64::MAX];
        for value in values {
            let mut buf = [0u8; 16];
            let mut writer = BinaryWriter::new(&mut buf);
            writer.write_7bit_encoded(value);
            let len = writer.position();
            let bits = 64 - value.leading_zeros() as usize;
            assert_eq!(len, std::cmp::max(1, bits.div_ceil(7)), "value {}", value);
            assert_eq!(len, get_7bit_encoded_count(value));
            let mut reader = BinaryReader::new(&buf[..len]);
            assert_eq!(reader.read_7bit_encoded(), value);
        }
    }

    #[test]
    fn test_7bit_known_encoding() {
        let mut buf = [0u8; 4];
        let mut writer = BinaryWriter::new(&mut buf);
        writer.write_7bit_encoded(300);
        assert_eq!(writer.written(), &[0xac, 0x02]);
    }

    #[test]
    fn test_try_read_7bit_truncated() {
        let data = [0x80u8, 0x80];
        let mut reader = BinaryReader::new(&data);
        assert_eq!(reader.try_read_7bit_encoded(), None);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_try_read_7bit_overlong() {
        let data = [0xffu8; 11];
        let mut reader = BinaryReader::new(&data);
        assert_eq!(reader.try_read_7bit_encoded(), None);
    }

    #[test]
    fn test_try_read_string_truncated() {
        let mut buf = [0u8; 32];
        let mut writer = BinaryWriter::new(&mut buf);
        writer.write_string("truncated");
        let len = writer.position();
        let mut reader = BinaryReader::new(&buf[..len - 3]);
        assert_eq!(reader.try_read_string(), None);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_fixed_width_values() {
        let key = to_string_key("c:\\proj");
        let cas = CasKey { a: 1, b: 2, c: 3 };
        let guid = Guid { a: 7, b: 9 };
        let mut buf = [0u8; 128];
        let mut writer = BinaryWriter::new(&mut buf);
        writer.write_byte(0xab);
        writer.write_u16(0x1234);
        writer.write_u32(0xdead_beef);
        writer.write_u64(u64::MAX - 1);
        writer.write_bool(true);
        writer.write_string_key(key);
        writer.write_cas_key(cas);
        writer.write_guid(guid);
        assert_eq!(writer.position(), 1 + 2 + 4 + 8 + 1 + 16 + 20 + 16);

        let len = writer.position();
        let mut reader = BinaryReader::new(&buf[..len]);
        assert_eq!(reader.read_byte(), 0xab);
        assert_eq!(reader.read_u16(), 0x1234);
        assert_eq!(reader.read_u32(), 0xdead_beef);
        assert_eq!(reader.read_u64(), u64::MAX - 1);
        assert!(reader.read_bool());
        assert_eq!(reader.read_string_key(), key);
        assert_eq!(reader.read_cas_key(), cas);
        assert_eq!(reader.read_guid(), guid);
        assert_eq!(reader.left(), 0);
    }

    #[test]
    #[should_panic(expected = "BinaryWriter overflow")]
    fn test_writer_overflow_panics() {
        let mut buf = [0u8; 3];
        let mut writer = BinaryWriter::new(&mut buf);
        writer.write_u32(1);
    }

    #[test]
    #[should_panic(expected = "read past end")]
    fn test_reader_past_end_panics() {
        let data = [1u8, 2];
        let mut reader = BinaryReader::new(&data);
        reader.read_u32();
    }
}
