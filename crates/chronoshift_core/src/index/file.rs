//! Completed, versioned index files.
//!
//! ```text
//! | magic "CIDX" (4) | format (1) | segment (8) | version (4) | aggregates (4) | directory_len (4) |
//! | directory: (key_len (2) | key | offset (8) | count (4))* |
//! | entries: (sequence (8) | position (4))* |
//! | crc32 (4) |
//! ```
//!
//! `offset` is the absolute file offset of the aggregate's first entry.

use crate::codec::{seal, unseal, Reader};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexEntries, IndexEntry, SegmentIndexEntries};
use crate::types::FileVersion;
use chronoshift_storage::fs::write_durable;
use chronoshift_storage::{FileBackend, StorageBackend};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const INDEX_MAGIC: [u8; 4] = *b"CIDX";
const INDEX_FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 25;
const ENTRY_SIZE: usize = 12;

/// How an index file is held in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Fully loaded and checksummed.
    Resident,
    /// Directory loaded; entries read from the file on demand.
    Streamed,
}

#[derive(Debug, Clone, Copy)]
struct DirectoryEntry {
    offset: u64,
    count: u32,
}

enum Storage {
    Resident(HashMap<String, IndexEntries>),
    Streamed(RwLock<Option<FileBackend>>),
}

/// An opened index of one segment version.
pub struct SegmentIndex {
    file_version: FileVersion,
    directory: HashMap<String, DirectoryEntry>,
    storage: Storage,
    closed: AtomicBool,
}

impl SegmentIndex {
    /// Opens the index file at `path` in the given mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, belongs to another segment
    /// version, or fails validation.
    pub fn open(path: &Path, file_version: FileVersion, mode: IndexMode) -> CoreResult<Self> {
        let backend = FileBackend::open_existing(path)?;
        match mode {
            IndexMode::Resident => {
                let bytes = backend.read_from(0)?;
                let body = unseal(&bytes)?;
                let directory = parse_directory(body, file_version)?;
                let mut entries = HashMap::with_capacity(directory.len());
                for (aggregate, dir) in &directory {
                    let start = usize::try_from(dir.offset)
                        .map_err(|_| CoreError::index_corruption("entry offset out of range"))?;
                    let end = start + dir.count as usize * ENTRY_SIZE;
                    let slice = body.get(start..end).ok_or_else(|| {
                        CoreError::index_corruption(format!(
                            "entries of {aggregate} run past the end of the index"
                        ))
                    })?;
                    entries.insert(aggregate.clone(), decode_entries(slice)?);
                }
                Ok(Self {
                    file_version,
                    directory,
                    storage: Storage::Resident(entries),
                    closed: AtomicBool::new(false),
                })
            }
            IndexMode::Streamed => {
                let size = backend.size()?;
                let header = backend.read_at(0, HEADER_SIZE)?;
                let directory_len =
                    u32::from_le_bytes([header[21], header[22], header[23], header[24]]) as usize;
                let prefix = backend.read_at(0, HEADER_SIZE + directory_len)?;
                let directory = parse_directory(&prefix, file_version)?;
                for (aggregate, dir) in &directory {
                    let end = dir.offset + u64::from(dir.count) * ENTRY_SIZE as u64;
                    if end + 4 > size {
                        return Err(CoreError::index_corruption(format!(
                            "entries of {aggregate} run past the end of the index"
                        )));
                    }
                }
                Ok(Self {
                    file_version,
                    directory,
                    storage: Storage::Streamed(RwLock::new(Some(backend))),
                    closed: AtomicBool::new(false),
                })
            }
        }
    }

    /// The segment version this index describes.
    #[must_use]
    pub const fn file_version(&self) -> FileVersion {
        self.file_version
    }

    /// How the index is held.
    #[must_use]
    pub fn mode(&self) -> IndexMode {
        match self.storage {
            Storage::Resident(_) => IndexMode::Resident,
            Storage::Streamed(_) => IndexMode::Streamed,
        }
    }

    /// Whether the aggregate has entries in this segment.
    #[must_use]
    pub fn contains(&self, aggregate_id: &str) -> bool {
        self.directory.contains_key(aggregate_id)
    }

    /// Aggregates present in the index.
    pub fn aggregates(&self) -> impl Iterator<Item = &str> {
        self.directory.keys().map(String::as_str)
    }

    /// Number of aggregates in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.directory.len()
    }

    /// Whether the index holds no aggregates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Entries of one aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexClosed`] after [`SegmentIndex::close`], or an
    /// error if a streamed read fails.
    pub fn lookup(&self, aggregate_id: &str) -> CoreResult<Option<IndexEntries>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::IndexClosed(self.file_version));
        }
        let Some(dir) = self.directory.get(aggregate_id) else {
            return Ok(None);
        };
        match &self.storage {
            Storage::Resident(entries) => Ok(entries.get(aggregate_id).cloned()),
            Storage::Streamed(backend) => {
                let guard = backend.read();
                let backend = guard
                    .as_ref()
                    .ok_or(CoreError::IndexClosed(self.file_version))?;
                let bytes = backend.read_at(dir.offset, dir.count as usize * ENTRY_SIZE)?;
                decode_entries(&bytes).map(Some)
            }
        }
    }

    /// Releases the file handle. Later lookups fail with [`CoreError::IndexClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Storage::Streamed(backend) = &self.storage {
            backend.write().take();
        }
    }

    /// Whether [`SegmentIndex::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SegmentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentIndex")
            .field("file_version", &self.file_version)
            .field("mode", &self.mode())
            .field("aggregates", &self.directory.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn parse_directory(
    bytes: &[u8],
    expected: FileVersion,
) -> CoreResult<HashMap<String, DirectoryEntry>> {
    let mut reader = Reader::new(bytes, "index");
    if reader.take(4)? != INDEX_MAGIC {
        return Err(CoreError::index_corruption("bad index magic"));
    }
    let format = reader.u8()?;
    if format != INDEX_FORMAT_VERSION {
        return Err(CoreError::invalid_format(format!(
            "unsupported index format {format}"
        )));
    }
    let found = FileVersion::new(reader.u64()?, reader.u32()?);
    if found != expected {
        return Err(CoreError::index_corruption(format!(
            "index file holds {found}, expected {expected}"
        )));
    }
    let count = reader.u32()?;
    let _directory_len = reader.u32()?;
    let mut directory = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key_len = usize::from(reader.u16()?);
        let key = std::str::from_utf8(reader.take(key_len)?)
            .map_err(|_| CoreError::index_corruption("aggregate id is not UTF-8"))?
            .to_string();
        let offset = reader.u64()?;
        let count = reader.u32()?;
        directory.insert(key, DirectoryEntry { offset, count });
    }
    Ok(directory)
}

fn decode_entries(bytes: &[u8]) -> CoreResult<IndexEntries> {
    let mut reader = Reader::new(bytes, "index entries");
    let mut entries = Vec::with_capacity(bytes.len() / ENTRY_SIZE);
    while reader.position() < bytes.len() {
        entries.push(IndexEntry::new(reader.u64()?, reader.u32()?));
    }
    Ok(IndexEntries::from_entries(entries))
}

/// Encodes the index of one segment version.
///
/// # Errors
///
/// Returns an error if an aggregate id is longer than `u16::MAX` bytes.
pub fn encode_index(file_version: FileVersion, entries: &SegmentIndexEntries) -> CoreResult<Vec<u8>> {
    let mut directory_len = 0usize;
    for aggregate in entries.keys() {
        if aggregate.len() > usize::from(u16::MAX) {
            return Err(CoreError::invalid_operation(format!(
                "aggregate id of {} bytes is too long to index",
                aggregate.len()
            )));
        }
        directory_len += 2 + aggregate.len() + 8 + 4;
    }
    let directory_len_u32 = u32::try_from(directory_len)
        .map_err(|_| CoreError::invalid_operation("index directory too large"))?;
    let count = u32::try_from(entries.len())
        .map_err(|_| CoreError::invalid_operation("too many aggregates in segment"))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + directory_len);
    buf.extend_from_slice(&INDEX_MAGIC);
    buf.push(INDEX_FORMAT_VERSION);
    buf.extend_from_slice(&file_version.segment.to_le_bytes());
    buf.extend_from_slice(&file_version.version.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    buf.extend_from_slice(&directory_len_u32.to_le_bytes());

    let mut offset = (HEADER_SIZE + directory_len) as u64;
    for (aggregate, list) in entries {
        let list_len = u32::try_from(list.len())
            .map_err(|_| CoreError::invalid_operation("too many entries for one aggregate"))?;
        // length checked above
        buf.extend_from_slice(&(aggregate.len() as u16).to_le_bytes());
        buf.extend_from_slice(aggregate.as_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&list_len.to_le_bytes());
        offset += u64::from(list_len) * ENTRY_SIZE as u64;
    }
    for list in entries.values() {
        for entry in list.entries() {
            buf.extend_from_slice(&entry.sequence_number.to_le_bytes());
            buf.extend_from_slice(&entry.position.to_le_bytes());
        }
    }
    seal(&mut buf);
    Ok(buf)
}

/// Writes an index file durably through a temporary file.
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub fn write_index(
    path: &Path,
    temp: &Path,
    file_version: FileVersion,
    entries: &SegmentIndexEntries,
) -> CoreResult<()> {
    write_durable(temp, path, &encode_index(file_version, entries)?)?;
    Ok(())
}
