//! Per-segment bloom filters over aggregate identifiers.

use crate::codec::{seal, unseal, Reader};
use crate::error::{CoreError, CoreResult};
use crate::index::SegmentIndexEntries;
use bloomfilter::Bloom;
use chronoshift_storage::fs::write_durable;
use std::path::Path;

const BLOOM_MAGIC: [u8; 4] = *b"CBLM";

/// A bloom filter that can be written to and loaded from a file.
///
/// The filter is sized from the number of aggregates in the segment at
/// creation time, so every inserted identifier is reported as present.
pub struct PersistedBloomFilter {
    filter: Bloom<[u8]>,
}

impl PersistedBloomFilter {
    /// Creates an empty filter for `expected` items at the given false-positive rate.
    #[must_use]
    pub fn new(expected: usize, false_positive_rate: f64) -> Self {
        Self {
            filter: Bloom::new_for_fp_rate(expected.max(1), false_positive_rate),
        }
    }

    /// Builds a filter containing every aggregate of a segment.
    #[must_use]
    pub fn for_entries(entries: &SegmentIndexEntries, false_positive_rate: f64) -> Self {
        let mut bloom = Self::new(entries.len(), false_positive_rate);
        for aggregate in entries.keys() {
            bloom.insert(aggregate);
        }
        bloom
    }

    /// Adds an aggregate identifier.
    pub fn insert(&mut self, aggregate_id: &str) {
        self.filter.set(aggregate_id.as_bytes());
    }

    /// `false` means the aggregate is definitely absent.
    #[must_use]
    pub fn might_contain(&self, aggregate_id: &str) -> bool {
        self.filter.check(aggregate_id.as_bytes())
    }

    /// Serializes the filter, including its hash keys.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let bitmap = self.filter.bitmap();
        let sip_keys = self.filter.sip_keys();
        let mut buf = Vec::with_capacity(56 + bitmap.len());
        buf.extend_from_slice(&BLOOM_MAGIC);
        buf.extend_from_slice(&self.filter.number_of_bits().to_le_bytes());
        buf.extend_from_slice(&self.filter.number_of_hash_functions().to_le_bytes());
        for (k0, k1) in sip_keys {
            buf.extend_from_slice(&k0.to_le_bytes());
            buf.extend_from_slice(&k1.to_le_bytes());
        }
        // bitmap length is bounded by number_of_bits / 8, checked on decode
        buf.extend_from_slice(&(bitmap.len() as u32).to_le_bytes());
        buf.extend_from_slice(&bitmap);
        seal(&mut buf);
        buf
    }

    /// Deserializes a filter written by [`PersistedBloomFilter::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error on a bad magic, checksum or inconsistent size.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let body = unseal(bytes)?;
        let mut reader = Reader::new(body, "bloom filter");
        if reader.take(4)? != BLOOM_MAGIC {
            return Err(CoreError::index_corruption("bad bloom filter magic"));
        }
        let bits = reader.u64()?;
        let hashes = reader.u32()?;
        let sip_keys = [(reader.u64()?, reader.u64()?), (reader.u64()?, reader.u64()?)];
        let bitmap_len = reader.u32()? as usize;
        let bitmap = reader.take(bitmap_len)?;
        reader.finish()?;
        if (bitmap_len as u64) * 8 < bits || hashes == 0 {
            return Err(CoreError::index_corruption(format!(
                "bloom filter bitmap of {bitmap_len} bytes cannot hold {bits} bits"
            )));
        }
        Ok(Self {
            filter: Bloom::from_existing(bitmap, bits, hashes, sip_keys),
        })
    }

    /// Writes the filter durably to `path` through a temporary file.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write(&self, path: &Path, temp: &Path) -> CoreResult<()> {
        write_durable(temp, path, &self.encode())?;
        Ok(())
    }

    /// Loads a filter from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or corrupted.
    pub fn load(path: &Path) -> CoreResult<Self> {
        Self::decode(&std::fs::read(path)?)
    }
}

impl std::fmt::Debug for PersistedBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedBloomFilter")
            .field("bits", &self.filter.number_of_bits())
            .field("hashes", &self.filter.number_of_hash_functions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntries;
    use tempfile::tempdir;

    fn aggregates(n: usize) -> SegmentIndexEntries {
        (0..n)
            .map(|i| (format!("aggregate-{i}"), IndexEntries::new()))
            .collect()
    }

    #[test]
    fn no_false_negatives_after_reload() {
        let entries = aggregates(500);
        let bloom = PersistedBloomFilter::for_entries(&entries, 0.03);
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.ebloom");
        bloom.write(&path, &dir.path().join("0.ebloom.tmp")).unwrap();

        let loaded = PersistedBloomFilter::load(&path).unwrap();
        for aggregate in entries.keys() {
            assert!(loaded.might_contain(aggregate));
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let bloom = PersistedBloomFilter::for_entries(&aggregates(1_000), 0.03);
        let false_positives = (0..10_000)
            .filter(|i| bloom.might_contain(&format!("absent-{i}")))
            .count();
        // 3% target, generous margin for randomness
        assert!(false_positives < 800, "{false_positives} false positives");
    }

    #[test]
    fn corrupted_file_rejected() {
        let mut bytes = PersistedBloomFilter::for_entries(&aggregates(3), 0.03).encode();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        assert!(PersistedBloomFilter::decode(&bytes).is_err());
    }
}
