//! Segment index engine.
//!
//! Every segment version has an index file (aggregate id to event positions)
//! and a bloom filter over its aggregate ids. The [`IndexManager`] answers
//! aggregate lookups across active and completed segments, consulting the
//! bloom filter before opening any index.

mod bloom;
mod entries;
mod file;
mod manager;

pub use bloom::PersistedBloomFilter;
pub use entries::{IndexEntries, IndexEntry, LocatedEntries, SegmentIndexEntries};
pub use file::{encode_index, write_index, IndexMode, SegmentIndex};
pub use manager::{IndexManager, IndexStats, RemoteSequenceResolver};
