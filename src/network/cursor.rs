//! Bounds-checked byte cursor and builder for wire encoding
//!
//! The reader never fails synchronously: reading past the end of the buffer
//! yields zero-filled data and latches an overflow flag that callers inspect
//! once a parse sequence is complete. Every multi-byte primitive takes an
//! explicit [`Endian`] because the wire format mixes byte orders.

use crate::primitives::Hash;

/// Byte order of a multi-byte field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Compact-size prefix for a 16-bit value
pub const COMPACT_SIZE_U16: u8 = 0xfd;
/// Compact-size prefix for a 32-bit value
pub const COMPACT_SIZE_U32: u8 = 0xfe;
/// Compact-size prefix for a 64-bit value
pub const COMPACT_SIZE_U64: u8 = 0xff;

/// Forward-only reader over a borrowed buffer
#[derive(Debug)]
pub struct ByteCursor<'a> {
    buffer: &'a [u8],
    position: usize,
    overflow: bool,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
            overflow: false,
        }
    }

    /// Current offset into the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining_byte_count(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// True once any read has run past the end of the buffer
    pub fn did_overflow(&self) -> bool {
        self.overflow
    }

    /// Take `count` raw bytes in wire order, or `None` after marking overflow.
    fn take(&mut self, count: usize) -> Option<&'a [u8]> {
        if count > self.remaining_byte_count() {
            self.overflow = true;
            self.position = self.buffer.len();
            return None;
        }
        let start = self.position;
        self.position += count;
        Some(&self.buffer[start..self.position])
    }

    /// Read `count` bytes. `Endian::Little` reverses them relative to wire order.
    pub fn read_bytes(&mut self, count: usize, endian: Endian) -> Vec<u8> {
        match self.take(count) {
            Some(slice) => {
                let mut bytes = slice.to_vec();
                if endian == Endian::Little {
                    bytes.reverse();
                }
                bytes
            }
            None => vec![0u8; count],
        }
    }

    /// Like [`read_bytes`](Self::read_bytes) but leaves the position untouched.
    ///
    /// Peeking past the end does not set the overflow flag.
    pub fn peek_bytes(&self, count: usize, endian: Endian) -> Vec<u8> {
        if count > self.remaining_byte_count() {
            return vec![0u8; count];
        }
        let mut bytes = self.buffer[self.position..self.position + count].to_vec();
        if endian == Endian::Little {
            bytes.reverse();
        }
        bytes
    }

    pub fn skip(&mut self, count: usize) {
        let _ = self.take(count);
    }

    /// Read an unsigned integer of `width` bytes (at most 8).
    pub fn read_integer(&mut self, width: usize, endian: Endian) -> u64 {
        debug_assert!(width <= 8, "integer width {} exceeds 8 bytes", width);
        let width = width.min(8);
        let Some(slice) = self.take(width) else {
            return 0;
        };
        match endian {
            Endian::Little => slice
                .iter()
                .rev()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
            Endian::Big => slice
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        }
    }

    pub fn read_byte(&mut self) -> u8 {
        self.read_integer(1, Endian::Big) as u8
    }

    pub fn read_bool(&mut self) -> bool {
        self.read_byte() != 0
    }

    pub fn read_u16(&mut self, endian: Endian) -> u16 {
        self.read_integer(2, endian) as u16
    }

    pub fn read_u32(&mut self, endian: Endian) -> u32 {
        self.read_integer(4, endian) as u32
    }

    pub fn read_i32(&mut self, endian: Endian) -> i32 {
        self.read_u32(endian) as i32
    }

    pub fn read_u64(&mut self, endian: Endian) -> u64 {
        self.read_integer(8, endian)
    }

    pub fn read_i64(&mut self, endian: Endian) -> i64 {
        self.read_u64(endian) as i64
    }

    /// Bitcoin compact-size integer. Non-minimal encodings are accepted.
    pub fn read_variable_length_integer(&mut self) -> u64 {
        match self.read_byte() {
            COMPACT_SIZE_U16 => self.read_integer(2, Endian::Little),
            COMPACT_SIZE_U32 => self.read_integer(4, Endian::Little),
            COMPACT_SIZE_U64 => self.read_integer(8, Endian::Little),
            prefix => u64::from(prefix),
        }
    }

    /// Compact-size length followed by that many bytes, in wire order.
    ///
    /// A declared length larger than the remaining buffer overflows and
    /// yields an empty vector instead of allocating the declared size.
    pub fn read_variable_length_bytes(&mut self) -> Vec<u8> {
        let length = self.read_variable_length_integer();
        match usize::try_from(length) {
            Ok(length) if length <= self.remaining_byte_count() => {
                self.read_bytes(length, Endian::Big)
            }
            _ => {
                self.overflow = true;
                self.position = self.buffer.len();
                Vec::new()
            }
        }
    }

    pub fn read_variable_length_string(&mut self) -> String {
        let bytes = self.read_variable_length_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// 32-byte hash kept in wire order
    pub fn read_hash(&mut self) -> Hash {
        let mut bytes = [0u8; 32];
        if let Some(slice) = self.take(32) {
            bytes.copy_from_slice(slice);
        }
        Hash::new(bytes)
    }

    /// Everything not yet consumed
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let count = self.remaining_byte_count();
        self.read_bytes(count, Endian::Big)
    }
}

/// Append-only writer mirroring [`ByteCursor`]
#[derive(Debug, Default, Clone)]
pub struct ByteBuilder {
    bytes: Vec<u8>,
}

impl ByteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Append `bytes`; `Endian::Little` writes them reversed.
    pub fn append_bytes(&mut self, bytes: &[u8], endian: Endian) -> &mut Self {
        match endian {
            Endian::Big => self.bytes.extend_from_slice(bytes),
            Endian::Little => self.bytes.extend(bytes.iter().rev()),
        }
        self
    }

    pub fn append_u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    pub fn append_bool(&mut self, value: bool) -> &mut Self {
        self.append_u8(u8::from(value))
    }

    pub fn append_u16(&mut self, value: u16, endian: Endian) -> &mut Self {
        self.append_bytes(&value.to_be_bytes(), endian)
    }

    pub fn append_u32(&mut self, value: u32, endian: Endian) -> &mut Self {
        self.append_bytes(&value.to_be_bytes(), endian)
    }

    pub fn append_i32(&mut self, value: i32, endian: Endian) -> &mut Self {
        self.append_bytes(&value.to_be_bytes(), endian)
    }

    pub fn append_u64(&mut self, value: u64, endian: Endian) -> &mut Self {
        self.append_bytes(&value.to_be_bytes(), endian)
    }

    pub fn append_i64(&mut self, value: i64, endian: Endian) -> &mut Self {
        self.append_bytes(&value.to_be_bytes(), endian)
    }

    /// Minimal-width compact-size encoding
    pub fn append_variable_length_integer(&mut self, value: u64) -> &mut Self {
        match value {
            0..=0xfc => self.append_u8(value as u8),
            0xfd..=0xffff => self
                .append_u8(COMPACT_SIZE_U16)
                .append_u16(value as u16, Endian::Little),
            0x1_0000..=0xffff_ffff => self
                .append_u8(COMPACT_SIZE_U32)
                .append_u32(value as u32, Endian::Little),
            _ => self
                .append_u8(COMPACT_SIZE_U64)
                .append_u64(value, Endian::Little),
        }
    }

    pub fn append_variable_length_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.append_variable_length_integer(bytes.len() as u64)
            .append_bytes(bytes, Endian::Big)
    }

    pub fn append_variable_length_string(&mut self, value: &str) -> &mut Self {
        self.append_variable_length_bytes(value.as_bytes())
    }

    /// Hash in wire order
    pub fn append_hash(&mut self, hash: &Hash) -> &mut Self {
        self.append_bytes(hash.as_bytes(), Endian::Big)
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Encoded width of a compact-size integer
pub fn variable_length_integer_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
