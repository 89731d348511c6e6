//! Per-aggregate position lists.

use crate::types::FileVersion;
use std::collections::BTreeMap;

/// Location of one aggregate event inside a segment data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexEntry {
    /// Aggregate sequence number of the event.
    pub sequence_number: u64,
    /// Byte offset of the event record within the data file.
    pub position: u32,
}

impl IndexEntry {
    /// Creates an index entry.
    #[must_use]
    pub const fn new(sequence_number: u64, position: u32) -> Self {
        Self {
            sequence_number,
            position,
        }
    }
}

/// The ordered positions of one aggregate within one segment version.
///
/// Entries are appended in log order, which for a well-formed aggregate is
/// ascending sequence order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexEntries {
    entries: Vec<IndexEntry>,
}

impl IndexEntries {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already ordered list.
    #[must_use]
    pub fn from_entries(entries: Vec<IndexEntry>) -> Self {
        Self { entries }
    }

    /// Appends one entry.
    pub fn add(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    /// Appends all entries of `other`.
    pub fn add_all(&mut self, other: &Self) {
        self.entries.extend_from_slice(&other.entries);
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entries in order.
    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Lowest sequence number present.
    #[must_use]
    pub fn first_sequence_number(&self) -> Option<u64> {
        self.entries.first().map(|e| e.sequence_number)
    }

    /// Highest sequence number present.
    #[must_use]
    pub fn last_sequence_number(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence_number)
    }

    /// Data file positions in order.
    #[must_use]
    pub fn positions(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.position).collect()
    }

    /// Entries with `first <= sequence < last_exclusive`.
    ///
    /// With `snapshot` set only the newest matching entry is kept, since a
    /// reader only ever needs the latest snapshot.
    #[must_use]
    pub fn range(&self, first: u64, last_exclusive: u64, snapshot: bool) -> Self {
        let matching = self
            .entries
            .iter()
            .filter(|e| e.sequence_number >= first && e.sequence_number < last_exclusive);
        let entries = if snapshot {
            matching.last().copied().into_iter().collect()
        } else {
            matching.copied().collect()
        };
        Self { entries }
    }
}

impl FromIterator<IndexEntry> for IndexEntries {
    fn from_iter<I: IntoIterator<Item = IndexEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Aggregate id to positions, for one segment version.
pub type SegmentIndexEntries = BTreeMap<String, IndexEntries>;

/// Index entries together with the segment version they point into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedEntries {
    /// The segment version the positions refer to.
    pub file_version: FileVersion,
    /// The matching entries.
    pub entries: IndexEntries,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(seqs: &[u64]) -> IndexEntries {
        seqs.iter()
            .enumerate()
            .map(|(i, s)| IndexEntry::new(*s, i as u32 * 10))
            .collect()
    }

    #[test]
    fn range_is_half_open() {
        let list = entries(&[3, 4, 5, 6]);
        let range = list.range(4, 6, false);
        assert_eq!(range.first_sequence_number(), Some(4));
        assert_eq!(range.last_sequence_number(), Some(5));
        assert_eq!(range.positions(), vec![10, 20]);
        assert!(list.range(7, 10, false).is_empty());
    }

    #[test]
    fn snapshot_range_keeps_newest() {
        let list = entries(&[0, 10, 20]);
        let range = list.range(0, u64::MAX, true);
        assert_eq!(range.len(), 1);
        assert_eq!(range.last_sequence_number(), Some(20));
    }

    #[test]
    fn add_all_appends() {
        let mut list = entries(&[0, 1]);
        list.add_all(&entries(&[2]));
        assert_eq!(list.len(), 3);
    }
}
