//! Binary writer and reader for the metadata heap
//!
//! Every multi-byte value is written little-endian, byte by byte, at a fixed
//! width: offsets and array counts take 4 bytes, short fields take 2.

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Byte offset of a record inside the metadata heap. `0` is reserved as null.
pub type MetaFileOffset = u32;

/// Errors that can occur while decoding metadata
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Unexpected end of the metadata heap
    #[error("Unexpected end of metadata at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Unknown type encoding tag
    #[error("Invalid type encoding tag {0} at offset {1}")]
    InvalidTag(u8, usize),

    /// Unknown record kind in a meta header
    #[error("Invalid record kind {0} at offset {1}")]
    InvalidKind(u8, usize),

    /// A null offset where a record was required
    #[error("Null offset where a record was expected")]
    NullOffset,
}

/// Heap writer with string interning
///
/// Strings are stored NUL-terminated and written once per writer; pushing the
/// same string again returns the offset of the first copy.
pub struct BinaryWriter {
    buffer: Vec<u8>,
    strings: FxHashMap<String, MetaFileOffset>,
}

impl BinaryWriter {
    /// Create a heap writer. The heap starts with one reserved zero byte so
    /// that offset 0 never names a record.
    pub fn new() -> Self {
        Self {
            buffer: vec![0],
            strings: FxHashMap::default(),
        }
    }

    /// Create a writer for a plain section with no reserved leading byte
    pub fn section() -> Self {
        Self {
            buffer: Vec::new(),
            strings: FxHashMap::default(),
        }
    }

    /// Get the current buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Offset at which the next value will be written
    pub fn offset(&self) -> MetaFileOffset {
        self.buffer.len() as MetaFileOffset
    }

    /// Number of distinct strings interned so far
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    // ===== Basic Emission =====

    /// Push a raw byte
    pub fn push_byte(&mut self, value: u8) -> MetaFileOffset {
        let offset = self.offset();
        self.buffer.push(value);
        offset
    }

    /// Push a 16-bit value (little-endian)
    pub fn push_short(&mut self, value: u16) -> MetaFileOffset {
        let offset = self.offset();
        self.buffer.extend_from_slice(&value.to_le_bytes());
        offset
    }

    /// Push an offset (little-endian)
    pub fn push_pointer(&mut self, value: MetaFileOffset) -> MetaFileOffset {
        let offset = self.offset();
        self.buffer.extend_from_slice(&value.to_le_bytes());
        offset
    }

    /// Push an array element count
    pub fn push_array_count(&mut self, count: u32) -> MetaFileOffset {
        self.push_pointer(count)
    }

    /// Push already encoded bytes
    pub fn push_bytes(&mut self, bytes: &[u8]) -> MetaFileOffset {
        let offset = self.offset();
        self.buffer.extend_from_slice(bytes);
        offset
    }

    // ===== Composite Emission =====

    /// Push an interned NUL-terminated string
    pub fn push_string(&mut self, value: &str) -> MetaFileOffset {
        if let Some(&offset) = self.strings.get(value) {
            return offset;
        }
        let offset = self.offset();
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
        self.strings.insert(value.to_string(), offset);
        offset
    }

    /// Push a binary array: a 4-byte count followed by the offsets
    pub fn push_binary_array(&mut self, offsets: &[MetaFileOffset]) -> MetaFileOffset {
        let offset = self.push_array_count(offsets.len() as u32);
        for &item in offsets {
            self.push_pointer(item);
        }
        offset
    }
}

impl Default for BinaryWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a metadata byte buffer
pub struct BinaryReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BinaryReader<'a> {
    /// Create a reader positioned at the start of the buffer
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Create a reader positioned at `offset`
    pub fn at(buffer: &'a [u8], offset: MetaFileOffset) -> Self {
        Self {
            buffer,
            position: offset as usize,
        }
    }

    /// Get the underlying buffer
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        if self.position + N > self.buffer.len() {
            return Err(DecodeError::UnexpectedEnd(self.position));
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buffer[self.position..self.position + N]);
        self.position += N;
        Ok(bytes)
    }

    // ===== Basic Reading =====

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    /// Read a 16-bit unsigned integer (little-endian)
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take::<2>()?))
    }

    /// Read a 16-bit signed integer (little-endian)
    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take::<2>()?))
    }

    /// Read a 32-bit unsigned integer (little-endian)
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    /// Read a 32-bit signed integer (little-endian)
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take::<4>()?))
    }

    /// Read an offset
    pub fn read_pointer(&mut self) -> Result<MetaFileOffset, DecodeError> {
        self.read_u32()
    }

    // ===== Random Access =====

    /// Read the NUL-terminated string stored at `offset`
    pub fn string_at(&self, offset: MetaFileOffset) -> Result<&'a str, DecodeError> {
        let start = offset as usize;
        if start >= self.buffer.len() {
            return Err(DecodeError::UnexpectedEnd(start));
        }
        let len = self.buffer[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnexpectedEnd(self.buffer.len()))?;
        std::str::from_utf8(&self.buffer[start..start + len])
            .map_err(|_| DecodeError::InvalidUtf8(start))
    }

    /// Read the binary array stored at `offset`. A null offset is an empty array.
    pub fn array_at(&self, offset: MetaFileOffset) -> Result<Vec<MetaFileOffset>, DecodeError> {
        if offset == 0 {
            return Ok(Vec::new());
        }
        let mut reader = BinaryReader::at(self.buffer, offset);
        let count = reader.read_u32()? as usize;
        if count.saturating_mul(4) > reader.remaining() {
            return Err(DecodeError::UnexpectedEnd(reader.position()));
        }
        (0..count).map(|_| reader.read_pointer()).collect()
    }

    /// Read an array of string offsets and resolve every string
    pub fn strings_at(&self, offset: MetaFileOffset) -> Result<Vec<String>, DecodeError> {
        self.array_at(offset)?
            .into_iter()
            .map(|item| self.string_at(item).map(str::to_string))
            .collect()
    }
}
