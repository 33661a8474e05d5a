//! Name-indexed hashtables of the metadata file
//!
//! Buckets are selected with [`string_hash`] modulo the bucket count and
//! collisions are resolved by a linear scan of the bucket.

use crate::binary::{BinaryWriter, MetaFileOffset};

/// Incremental pairwise string hash with the top 8 bits masked off
///
/// The result is never zero; a zero hash is remapped to `0x80_0000`.
pub fn string_hash(value: &str) -> u32 {
    let bytes = value.as_bytes();
    let mut hash: u32 = 0x9E37_79B9;

    let mut pairs = bytes.chunks_exact(2);
    for pair in &mut pairs {
        hash = hash.wrapping_add(pair[0] as u32);
        let tmp = ((pair[1] as u32) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        hash = hash.wrapping_add(hash >> 11);
    }
    if let [last] = pairs.remainder() {
        hash = hash.wrapping_add(*last as u32);
        hash ^= hash << 11;
        hash = hash.wrapping_add(hash >> 17);
    }

    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 2;
    hash = hash.wrapping_add(hash >> 15);
    hash ^= hash << 10;

    hash &= 0x00FF_FFFF;
    if hash == 0 {
        0x0080_0000
    } else {
        hash
    }
}

/// Number of buckets for a table expected to hold `entries` names
pub fn bucket_count_for(entries: usize) -> usize {
    // ceil(entries * 1.25)
    ((entries * 5 + 3) / 4).max(1)
}

/// Bucket index of `name` in a table of `bucket_count` buckets
pub fn bucket_index(name: &str, bucket_count: usize) -> usize {
    string_hash(name) as usize % bucket_count
}

/// Producer-side hashtable mapping names to heap offsets
#[derive(Debug, Clone)]
pub struct BinaryHashtable {
    buckets: Vec<Vec<(String, MetaFileOffset)>>,
}

impl BinaryHashtable {
    /// Create a table sized for `entries` names
    pub fn new(entries: usize) -> Self {
        Self {
            buckets: vec![Vec::new(); bucket_count_for(entries)],
        }
    }

    /// Number of buckets
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Number of stored names
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Whether the table holds no names
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Insert a name
    pub fn add(&mut self, name: &str, offset: MetaFileOffset) {
        let index = bucket_index(name, self.size());
        self.buckets[index].push((name.to_string(), offset));
    }

    /// Look a name up; 0 when absent
    pub fn get(&self, name: &str) -> MetaFileOffset {
        let index = bucket_index(name, self.size());
        self.buckets[index]
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, offset)| *offset)
            .unwrap_or(0)
    }

    /// Write every non-empty bucket to the heap as an array of record offsets
    /// and return the per-bucket offsets (0 for an empty bucket)
    pub fn serialize(&self, heap: &mut BinaryWriter) -> Vec<MetaFileOffset> {
        self.buckets
            .iter()
            .map(|bucket| {
                if bucket.is_empty() {
                    0
                } else {
                    let offsets: Vec<_> = bucket.iter().map(|(_, offset)| *offset).collect();
                    heap.push_binary_array(&offsets)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::BinaryReader;

    #[test]
    fn test_hash_is_masked_and_nonzero() {
        for name in ["", "a", "ab", "NSObject", "UIApplicationDelegate"] {
            let hash = string_hash(name);
            assert_ne!(hash, 0);
            assert_eq!(hash & 0xFF00_0000, 0);
        }
    }

    #[test]
    fn test_hash_is_deterministic_and_discriminating() {
        assert_eq!(string_hash("NSString"), string_hash("NSString"));
        assert_ne!(string_hash("NSString"), string_hash("NSStrinh"));
        assert_ne!(string_hash("ab"), string_hash("ba"));
    }

    #[test]
    fn test_bucket_count_rounds_up() {
        assert_eq!(bucket_count_for(0), 1);
        assert_eq!(bucket_count_for(1), 2);
        assert_eq!(bucket_count_for(4), 5);
        assert_eq!(bucket_count_for(100), 125);
        assert_eq!(bucket_count_for(101), 127);
    }

    #[test]
    fn test_add_and_get() {
        let mut table = BinaryHashtable::new(3);
        table.add("CGRect", 10);
        table.add("CGPoint", 20);
        table.add("NSObject", 30);
        assert_eq!(table.get("CGPoint"), 20);
        assert_eq!(table.get("CGSize"), 0);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_serialize_writes_bucket_arrays() {
        let mut table = BinaryHashtable::new(8);
        table.add("CGRect", 10);
        let mut heap = BinaryWriter::new();
        let buckets = table.serialize(&mut heap);
        assert_eq!(buckets.len(), table.size());

        let index = bucket_index("CGRect", table.size());
        let reader = BinaryReader::new(heap.buffer());
        assert_eq!(reader.array_at(buckets[index]).unwrap(), vec![10]);
        assert_eq!(buckets.iter().filter(|&&b| b != 0).count(), 1);
    }
}
