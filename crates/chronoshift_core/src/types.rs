//! Core type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Global, gap-free position of an event in a context's log.
pub type Token = u64;

/// One immutable on-disk incarnation of a segment.
///
/// A segment is named after the token of its first event. Every rewrite by a
/// transformation produces a new, higher version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileVersion {
    /// Token of the first event in the segment.
    pub segment: u64,
    /// Version of the segment's files.
    pub version: u32,
}

impl FileVersion {
    /// Creates a new file version.
    #[must_use]
    pub const fn new(segment: u64, version: u32) -> Self {
        Self { segment, version }
    }

    /// The version that a rewrite of this one produces by default.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::new(self.segment, self.version + 1)
    }
}

impl fmt::Display for FileVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment, self.version)
    }
}

/// Scope of a segment family: regular events or aggregate snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Regular domain events.
    Event,
    /// Aggregate snapshots.
    Snapshot,
}

impl EventType {
    /// Extension of segment data files.
    #[must_use]
    pub const fn data_extension(self) -> &'static str {
        match self {
            Self::Event => "events",
            Self::Snapshot => "snapshots",
        }
    }

    /// Extension of index files.
    #[must_use]
    pub const fn index_extension(self) -> &'static str {
        match self {
            Self::Event => "eindex",
            Self::Snapshot => "sindex",
        }
    }

    /// Extension of bloom filter files.
    #[must_use]
    pub const fn bloom_extension(self) -> &'static str {
        match self {
            Self::Event => "ebloom",
            Self::Snapshot => "sbloom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => f.write_str("event"),
            Self::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// Identifier of a transformation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformationId(String);

impl TransformationId {
    /// Wraps an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransformationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransformationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_version_ordering() {
        let a = FileVersion::new(0, 3);
        let b = FileVersion::new(100, 0);
        assert!(a < b);
        assert_eq!(a.next(), FileVersion::new(0, 4));
        assert_eq!(b.to_string(), "100@0");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(TransformationId::generate(), TransformationId::generate());
    }
}
