//! Context directory layout.
//!
//! Every context lives in its own directory below the store root:
//!
//! ```text
//! <root>/<context>/
//! ├─ LOCK                                       # advisory single-writer lock
//! ├─ 00000000000000000000_00000.events          # segment 0, version 0
//! ├─ 00000000000000000000_00000.eindex          # its aggregate index
//! ├─ 00000000000000000000_00000.ebloom          # its bloom filter
//! ├─ 00000000000000000100_00001.events          # segment 100 rewritten once
//! ├─ ....snapshots / .sindex / .sbloom          # snapshot segments
//! └─ transformations/<id>.entries               # pending transformation edits
//! ```
//!
//! A rewritten artifact is first written as `<name>.tmp` and renamed into place.

use crate::error::{CoreError, CoreResult};
use crate::types::{EventType, FileVersion, TransformationId};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const TRANSFORMATIONS_DIR: &str = "transformations";
const ENTRIES_EXTENSION: &str = "entries";
const TEMP_SUFFIX: &str = ".tmp";

/// File naming for one segment family (events or snapshots) of a context.
///
/// Cheap to clone; carries no handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    dir: PathBuf,
    event_type: EventType,
}

impl SegmentLayout {
    /// Creates a layout rooted at a context directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, event_type: EventType) -> Self {
        Self {
            dir: dir.into(),
            event_type,
        }
    }

    /// The context directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The segment family.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    fn file(&self, version: FileVersion, extension: &str) -> PathBuf {
        self.dir.join(format!(
            "{:020}_{:05}.{extension}",
            version.segment, version.version
        ))
    }

    /// Path of a segment data file.
    #[must_use]
    pub fn data_file(&self, version: FileVersion) -> PathBuf {
        self.file(version, self.event_type.data_extension())
    }

    /// Path of an index file.
    #[must_use]
    pub fn index_file(&self, version: FileVersion) -> PathBuf {
        self.file(version, self.event_type.index_extension())
    }

    /// Path of a bloom filter file.
    #[must_use]
    pub fn bloom_file(&self, version: FileVersion) -> PathBuf {
        self.file(version, self.event_type.bloom_extension())
    }

    /// Temporary path used while writing `target`.
    #[must_use]
    pub fn temp_of(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_owned();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }

    /// Lists every version of every segment that has a file with `extension`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn scan(&self, extension: &str) -> CoreResult<BTreeMap<u64, Vec<u32>>> {
        let mut found: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        if !self.dir.exists() {
            return Ok(found);
        }
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(version) = name.to_str().and_then(|n| parse_file_name(n, extension)) {
                found.entry(version.segment).or_default().push(version.version);
            }
        }
        for versions in found.values_mut() {
            versions.sort_unstable();
        }
        Ok(found)
    }

    /// Data file versions of each segment, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn data_versions(&self) -> CoreResult<BTreeMap<u64, Vec<u32>>> {
        self.scan(self.event_type.data_extension())
    }

    /// Removes leftover `.tmp` files from an interrupted rewrite.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a file cannot be removed.
    pub fn remove_temp_files(&self) -> CoreResult<usize> {
        let mut removed = 0;
        if !self.dir.exists() {
            return Ok(removed);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.to_str().is_some_and(|p| p.ends_with(TEMP_SUFFIX)) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Parses `<segment:020>_<version:05>.<extension>`.
#[must_use]
pub fn parse_file_name(name: &str, extension: &str) -> Option<FileVersion> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    let (segment, version) = stem.split_once('_')?;
    if segment.len() != 20 {
        return None;
    }
    Some(FileVersion::new(segment.parse().ok()?, version.parse().ok()?))
}

/// An opened, locked context directory.
///
/// Holds an fs2 exclusive lock on `LOCK` for as long as it lives, so two
/// processes never rewrite the same context.
#[derive(Debug)]
pub struct ContextDir {
    context: String,
    path: PathBuf,
    _lock_file: File,
}

impl ContextDir {
    /// Opens (creating if missing) and locks the directory of `context`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ContextLocked`] if another process holds the lock,
    /// or an I/O error.
    pub fn open(root: &Path, context: &str) -> CoreResult<Self> {
        if context.is_empty() || context.contains(['/', '\\']) || context == TRANSFORMATIONS_DIR {
            return Err(CoreError::invalid_operation(format!(
                "invalid context name: {context:?}"
            )));
        }
        let path = root.join(context);
        fs::create_dir_all(&path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::ContextLocked {
                context: context.to_string(),
            });
        }

        Ok(Self {
            context: context.to_string(),
            path,
            _lock_file: lock_file,
        })
    }

    /// The context name.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The context directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Layout of one segment family in this directory.
    #[must_use]
    pub fn layout(&self, event_type: EventType) -> SegmentLayout {
        SegmentLayout::new(&self.path, event_type)
    }
}

/// Path of the entry log of a transformation.
#[must_use]
pub fn entries_file(root: &Path, context: &str, id: &TransformationId) -> PathBuf {
    root.join(context)
        .join(TRANSFORMATIONS_DIR)
        .join(format!("{id}.{ENTRIES_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_names_round_trip_through_parser() {
        let layout = SegmentLayout::new("/data/default", EventType::Event);
        let version = FileVersion::new(1_000, 3);
        let data = layout.data_file(version);
        let name = data.file_name().unwrap().to_str().unwrap();

        assert_eq!(name, "00000000000000001000_00003.events");
        assert_eq!(parse_file_name(name, "events"), Some(version));
        assert_eq!(parse_file_name(name, "eindex"), None);
        assert_eq!(parse_file_name("1000_00003.events", "events"), None);
    }

    #[test]
    fn snapshot_layout_uses_own_extensions() {
        let layout = SegmentLayout::new("/data/default", EventType::Snapshot);
        let index = layout.index_file(FileVersion::new(0, 0));
        assert!(index.to_str().unwrap().ends_with(".sindex"));
        let temp = SegmentLayout::temp_of(&index);
        assert!(temp.to_str().unwrap().ends_with(".sindex.tmp"));
    }

    #[test]
    fn scan_groups_versions_by_segment() {
        let dir = tempdir().unwrap();
        let layout = SegmentLayout::new(dir.path(), EventType::Event);
        for version in [FileVersion::new(0, 0), FileVersion::new(0, 1), FileVersion::new(10, 0)] {
            fs::write(layout.data_file(version), b"").unwrap();
        }
        fs::write(dir.path().join("junk.events"), b"").unwrap();

        let versions = layout.data_versions().unwrap();
        assert_eq!(versions.get(&0), Some(&vec![0, 1]));
        assert_eq!(versions.get(&10), Some(&vec![0]));
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn context_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let first = ContextDir::open(dir.path(), "default").unwrap();
        assert!(matches!(
            ContextDir::open(dir.path(), "default"),
            Err(CoreError::ContextLocked { .. })
        ));
        drop(first);
        ContextDir::open(dir.path(), "default").unwrap();
    }

    #[test]
    fn rejects_bad_context_names() {
        let dir = tempdir().unwrap();
        assert!(ContextDir::open(dir.path(), "").is_err());
        assert!(ContextDir::open(dir.path(), "a/b").is_err());
    }
}
