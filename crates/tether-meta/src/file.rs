//! Metadata file format
//!
//! Layout, in order:
//! - script name table (array of bucket offsets)
//! - native protocol name table
//! - native interface name table
//! - top-level module array
//! - heap (first byte reserved)
//!
//! Bucket and module offsets point into the heap. Each non-empty bucket is a
//! heap array of record offsets.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::binary::{BinaryReader, BinaryWriter, DecodeError, MetaFileOffset};
use crate::hashtable::{bucket_index, BinaryHashtable};
use crate::meta::MetaHeader;

/// Minimum sizing hint of the script name table
pub const MIN_GLOBAL_TABLE_ENTRIES: usize = 100;

/// Metadata file errors
#[derive(Debug, Error)]
pub enum MetaFileError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The table section extends past the end of the file
    #[error("Truncated metadata file: {0} bytes")]
    Truncated(usize),
}

/// Result type for metadata file operations
pub type MetaFileResult<T> = Result<T, MetaFileError>;

// ============================================================================
// Producer
// ============================================================================

/// Metadata file under construction
pub struct MetaFile {
    global: BinaryHashtable,
    protocols: BinaryHashtable,
    interfaces: BinaryHashtable,
    modules: BTreeMap<String, MetaFileOffset>,
    heap: BinaryWriter,
}

impl MetaFile {
    /// Create a file sized for `entries` top-level records
    pub fn new(entries: usize) -> Self {
        Self {
            global: BinaryHashtable::new(entries.max(MIN_GLOBAL_TABLE_ENTRIES)),
            protocols: BinaryHashtable::new((entries / 10).max(1)),
            interfaces: BinaryHashtable::new((entries / 10).max(1)),
            modules: BTreeMap::new(),
            heap: BinaryWriter::new(),
        }
    }

    /// Number of script names registered
    pub fn size(&self) -> usize {
        self.global.len()
    }

    /// The heap writer
    pub fn heap(&mut self) -> &mut BinaryWriter {
        &mut self.heap
    }

    pub fn register_in_global_table(&mut self, js_name: &str, offset: MetaFileOffset) {
        self.global.add(js_name, offset);
    }

    pub fn register_protocol(&mut self, native_name: &str, offset: MetaFileOffset) {
        self.protocols.add(native_name, offset);
    }

    pub fn register_interface(&mut self, native_name: &str, offset: MetaFileOffset) {
        self.interfaces.add(native_name, offset);
    }

    pub fn register_in_top_level_modules_table(&mut self, name: &str, offset: MetaFileOffset) {
        self.modules.insert(name.to_string(), offset);
    }

    /// Offset of a registered module, 0 when absent
    pub fn get_from_top_level_modules_table(&self, name: &str) -> MetaFileOffset {
        self.modules.get(name).copied().unwrap_or(0)
    }

    /// Serialize the whole file
    pub fn to_bytes(mut self) -> Vec<u8> {
        let global = self.global.serialize(&mut self.heap);
        let protocols = self.protocols.serialize(&mut self.heap);
        let interfaces = self.interfaces.serialize(&mut self.heap);
        let modules: Vec<_> = self.modules.values().copied().collect();

        let mut tables = BinaryWriter::section();
        tables.push_binary_array(&global);
        tables.push_binary_array(&protocols);
        tables.push_binary_array(&interfaces);
        tables.push_binary_array(&modules);

        let mut bytes = tables.into_bytes();
        bytes.extend_from_slice(self.heap.buffer());
        bytes
    }

    /// Serialize to a stream
    pub fn save<W: Write>(self, out: &mut W) -> MetaFileResult<()> {
        out.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Serialize to a file on disk
    pub fn save_to_path<P: AsRef<Path>>(self, path: P) -> MetaFileResult<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Which name table to search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameTable {
    /// Script names
    Global,
    /// Native protocol names
    Protocols,
    /// Native interface names
    Interfaces,
}

/// A loaded metadata file
pub struct MetadataFile {
    bytes: Vec<u8>,
    heap_start: usize,
    global: Vec<MetaFileOffset>,
    protocols: Vec<MetaFileOffset>,
    interfaces: Vec<MetaFileOffset>,
    modules: Vec<MetaFileOffset>,
}

impl MetadataFile {
    /// Parse the table section of a metadata blob
    pub fn from_bytes(bytes: Vec<u8>) -> MetaFileResult<Self> {
        let mut reader = BinaryReader::new(&bytes);
        let read_table = |reader: &mut BinaryReader<'_>| -> MetaFileResult<Vec<MetaFileOffset>> {
            let count = reader.read_u32()? as usize;
            if count.saturating_mul(4) > reader.remaining() {
                return Err(MetaFileError::Truncated(reader.buffer().len()));
            }
            Ok((0..count).map(|_| reader.read_pointer()).collect::<Result<_, _>>()?)
        };

        let global = read_table(&mut reader)?;
        let protocols = read_table(&mut reader)?;
        let interfaces = read_table(&mut reader)?;
        let modules = read_table(&mut reader)?;
        let heap_start = reader.position();

        if heap_start >= bytes.len() {
            return Err(MetaFileError::Truncated(bytes.len()));
        }

        log::debug!(
            "metadata loaded: {} bytes, {} script buckets, {} protocol buckets, {} interface buckets, {} modules",
            bytes.len(),
            global.len(),
            protocols.len(),
            interfaces.len(),
            modules.len()
        );

        Ok(MetadataFile {
            bytes,
            heap_start,
            global,
            protocols,
            interfaces,
            modules,
        })
    }

    /// Read and parse a metadata file from disk
    pub fn open<P: AsRef<Path>>(path: P) -> MetaFileResult<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// The heap region; all record offsets are relative to it
    pub fn heap(&self) -> &[u8] {
        &self.bytes[self.heap_start..]
    }

    /// Total size of the blob
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offsets of the top-level module records
    pub fn modules(&self) -> &[MetaFileOffset] {
        &self.modules
    }

    fn buckets(&self, table: NameTable) -> &[MetaFileOffset] {
        match table {
            NameTable::Global => &self.global,
            NameTable::Protocols => &self.protocols,
            NameTable::Interfaces => &self.interfaces,
        }
    }

    /// Find the record registered under `name`
    ///
    /// The script table is keyed by script names, the native tables by native
    /// names. Returns `None` when the name is absent.
    pub fn find(&self, table: NameTable, name: &str) -> MetaFileResult<Option<MetaFileOffset>> {
        let buckets = self.buckets(table);
        if buckets.is_empty() {
            return Ok(None);
        }
        let bucket = buckets[bucket_index(name, buckets.len())];
        let heap = self.heap();
        let reader = BinaryReader::new(heap);
        for offset in reader.array_at(bucket)? {
            let mut record = BinaryReader::at(heap, offset);
            let header = MetaHeader::read(&mut record)?;
            let key = match table {
                NameTable::Global => &header.js_name,
                NameTable::Protocols | NameTable::Interfaces => &header.name,
            };
            if key == name {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    /// Every record offset in a table, bucket order
    pub fn entries(&self, table: NameTable) -> MetaFileResult<Vec<MetaFileOffset>> {
        let reader = BinaryReader::new(self.heap());
        let mut entries = Vec::new();
        for &bucket in self.buckets(table) {
            entries.extend(reader.array_at(bucket)?);
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for MetadataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataFile")
            .field("len", &self.bytes.len())
            .field("heap_start", &self.heap_start)
            .field("modules", &self.modules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_round_trip() {
        let file = MetaFile::new(0);
        let bytes = file.to_bytes();
        let loaded = MetadataFile::from_bytes(bytes).unwrap();
        assert_eq!(loaded.heap(), &[0]);
        assert!(loaded.modules().is_empty());
        assert_eq!(loaded.find(NameTable::Global, "NSObject").unwrap(), None);
    }

    #[test]
    fn test_native_tables_are_small() {
        let file = MetaFile::new(1000);
        assert_eq!(file.global.size(), 1250);
        assert_eq!(file.protocols.size(), 125);
    }

    #[test]
    fn test_truncated_table_section() {
        let bytes = vec![0xFF, 0xFF, 0, 0];
        assert!(matches!(
            MetadataFile::from_bytes(bytes),
            Err(MetaFileError::Truncated(4))
        ));
    }
}
