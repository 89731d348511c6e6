//! Durable, append-only log of the pending edits of one transformation.
//!
//! ## Record format
//!
//! ```text
//! | len (4) | version (1) | sequence (8) | payload (len) | crc32 (4) |
//! ```
//!
//! The CRC covers everything before it. A record cut short by a crash is
//! treated as the end of the log and cut off by the next append.

use super::entry::TransformationEntry;
use crate::codec::compute_crc32;
use crate::config::{SequenceGapPolicy, StorageConfig};
use crate::error::{CoreError, CoreResult};
use crate::types::Token;
use chronoshift_storage::fs::remove_if_exists;
use chronoshift_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const HEADER_SIZE: u64 = 13;
const CRC_SIZE: u64 = 4;

#[derive(Debug, Clone, Copy)]
struct RecordMeta {
    offset: u64,
    len: u32,
    sequence: u64,
    token: Token,
}

impl RecordMeta {
    const fn total(&self) -> u64 {
        HEADER_SIZE + self.len as u64 + CRC_SIZE
    }
}

struct State {
    backend: Option<Box<dyn StorageBackend>>,
    records: Vec<RecordMeta>,
    valid_end: u64,
}

impl State {
    fn backend(&mut self) -> CoreResult<&mut Box<dyn StorageBackend>> {
        self.backend.as_mut().ok_or(CoreError::EntryStoreDeleted)
    }

    fn read_record(&self, meta: &RecordMeta) -> CoreResult<TransformationEntry> {
        let backend = self.backend.as_ref().ok_or(CoreError::EntryStoreDeleted)?;
        // total is bounded by a u32 payload length
        let bytes = backend.read_at(meta.offset, meta.total() as usize)?;
        decode_record(&bytes)
    }
}

/// Token targeted by an encoded edit payload, without decoding the event.
fn payload_token(payload: &[u8]) -> CoreResult<Token> {
    payload
        .get(1..9)
        .and_then(|raw| raw.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| CoreError::invalid_format("transformation entry payload too short"))
}

fn encode_record(entry: &TransformationEntry) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(entry.payload.len())
        .map_err(|_| CoreError::invalid_operation("transformation entry too large"))?;
    let mut buf = Vec::with_capacity(entry.payload.len() + 17);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.push(entry.version);
    buf.extend_from_slice(&entry.sequence.to_le_bytes());
    buf.extend_from_slice(&entry.payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn decode_record(bytes: &[u8]) -> CoreResult<TransformationEntry> {
    let (body, crc) = bytes.split_at(bytes.len().saturating_sub(CRC_SIZE as usize));
    if body.len() < HEADER_SIZE as usize || crc.len() != CRC_SIZE as usize {
        return Err(CoreError::invalid_format("transformation entry record too short"));
    }
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = compute_crc32(body);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    let mut sequence = [0u8; 8];
    sequence.copy_from_slice(&body[5..13]);
    Ok(TransformationEntry {
        sequence: u64::from_le_bytes(sequence),
        version: body[4],
        payload: body[13..].to_vec(),
    })
}

/// Scans a backend, returning every intact record and the end of the last one.
fn scan(backend: &dyn StorageBackend) -> CoreResult<(Vec<RecordMeta>, u64)> {
    let size = backend.size()?;
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + HEADER_SIZE + CRC_SIZE <= size {
        let header = backend.read_at(offset, HEADER_SIZE as usize)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let total = HEADER_SIZE + u64::from(len) + CRC_SIZE;
        if offset + total > size {
            break;
        }
        let bytes = backend.read_at(offset, total as usize)?;
        let entry = match decode_record(&bytes) {
            Ok(entry) => entry,
            Err(CoreError::ChecksumMismatch { .. }) if offset + total == size => break,
            Err(err) => return Err(err),
        };
        records.push(RecordMeta {
            offset,
            len,
            sequence: entry.sequence,
            token: payload_token(&entry.payload)?,
        });
        offset += total;
    }
    Ok((records, offset))
}

/// The pending edits of one transformation.
///
/// `store` uses the sequence the caller declares. If it does not follow the
/// last stored one, the log is reset so that only entries with a lower
/// sequence remain before appending: a repeated or rewound sequence replaces
/// what was stored from that point on. A sequence that skips ahead is
/// governed by [`SequenceGapPolicy`].
///
/// Reads are lazy, restartable and renumber entries contiguously from the
/// requested offset.
pub struct TransformationEntryStore {
    path: Option<PathBuf>,
    gap_policy: SequenceGapPolicy,
    sync: bool,
    state: Arc<Mutex<State>>,
}

impl TransformationEntryStore {
    /// Opens (creating if needed) a file-backed entry store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or holds a corrupted
    /// record before its tail.
    pub fn open(path: &Path, config: &StorageConfig) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        let mut store = Self::with_backend(Box::new(backend), config)?;
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Creates an entry store that lives in memory.
    #[must_use]
    pub fn in_memory(config: &StorageConfig) -> Self {
        Self {
            path: None,
            gap_policy: config.sequence_gap_policy,
            sync: config.sync_on_write,
            state: Arc::new(Mutex::new(State {
                backend: Some(Box::new(InMemoryBackend::new())),
                records: Vec::new(),
                valid_end: 0,
            })),
        }
    }

    /// Opens an entry store over an arbitrary backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend holds a corrupted record before its tail.
    pub fn with_backend(backend: Box<dyn StorageBackend>, config: &StorageConfig) -> CoreResult<Self> {
        let (records, valid_end) = scan(backend.as_ref())?;
        if backend.size()? > valid_end {
            warn!(valid_end, "transformation entry log has a torn tail");
        }
        Ok(Self {
            path: None,
            gap_policy: config.sequence_gap_policy,
            sync: config.sync_on_write,
            state: Arc::new(Mutex::new(State {
                backend: Some(backend),
                records,
                valid_end,
            })),
        })
    }

    /// File backing the store, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends an entry at its declared sequence and returns that sequence.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SequenceGap`] for a gap under
    /// [`SequenceGapPolicy::Reject`], [`CoreError::TokenOutOfOrder`] if the
    /// edit does not target a later token than the preceding entry,
    /// [`CoreError::EntryStoreDeleted`] after [`Self::delete`], or an I/O error.
    pub fn store(&self, entry: &TransformationEntry) -> CoreResult<u64> {
        let token = entry.op()?.token();
        let record = encode_record(entry)?;
        let mut state = self.state.lock();
        if state.backend.is_none() {
            return Err(CoreError::EntryStoreDeleted);
        }

        let expected = state.records.last().map_or(0, |r| r.sequence + 1);
        let keep = if entry.sequence < expected {
            state.records.partition_point(|r| r.sequence < entry.sequence)
        } else {
            state.records.len()
        };

        // Nothing is cut before the new entry is known to be accepted
        if let Some(previous) = keep.checked_sub(1).map(|i| state.records[i]) {
            if token <= previous.token {
                return Err(CoreError::TokenOutOfOrder {
                    token,
                    previous: previous.token,
                });
            }
        }
        if entry.sequence > expected {
            match self.gap_policy {
                SequenceGapPolicy::Reject => {
                    return Err(CoreError::SequenceGap {
                        expected,
                        actual: entry.sequence,
                    })
                }
                SequenceGapPolicy::Accept => {
                    warn!(expected, actual = entry.sequence, "sequence gap in transformation entries");
                }
            }
        }

        let valid_end = state.valid_end;
        let backend = state.backend()?;
        if backend.size()? > valid_end {
            backend.truncate(valid_end)?;
        }
        if keep < state.records.len() {
            let cut = state.records[keep].offset;
            state.backend()?.truncate(cut)?;
            state.records.truncate(keep);
            state.valid_end = cut;
            warn!(
                sequence = entry.sequence,
                dropped = expected - entry.sequence,
                "transformation entries reset"
            );
        }

        let sync = self.sync;
        let backend = state.backend()?;
        let offset = backend.append(&record)?;
        if sync {
            backend.sync()?;
        } else {
            backend.flush()?;
        }
        let meta = RecordMeta {
            offset,
            len: (record.len() as u64 - HEADER_SIZE - CRC_SIZE) as u32,
            sequence: entry.sequence,
            token,
        };
        state.valid_end = offset + meta.total();
        state.records.push(meta);
        Ok(entry.sequence)
    }

    /// Entries from physical position `sequence` onwards, renumbered from it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryStoreDeleted`] after [`Self::delete`].
    pub fn read_from(&self, sequence: u64) -> CoreResult<EntryIter> {
        let state = self.state.lock();
        if state.backend.is_none() {
            return Err(CoreError::EntryStoreDeleted);
        }
        let skip = usize::try_from(sequence).unwrap_or(usize::MAX);
        let records = state.records.iter().skip(skip).copied().collect();
        Ok(EntryIter {
            state: Arc::clone(&self.state),
            records,
            next: 0,
            first_sequence: sequence,
        })
    }

    /// All entries, numbered from zero.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryStoreDeleted`] after [`Self::delete`].
    pub fn read(&self) -> CoreResult<EntryIter> {
        self.read_from(0)
    }

    /// The first entry, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store was deleted or the read fails.
    pub fn first_entry(&self) -> CoreResult<Option<TransformationEntry>> {
        self.read()?.next().transpose()
    }

    /// The last entry, numbered by its position, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store was deleted or the read fails.
    pub fn last_entry(&self) -> CoreResult<Option<TransformationEntry>> {
        let state = self.state.lock();
        let Some(meta) = state.records.last().copied() else {
            if state.backend.is_none() {
                return Err(CoreError::EntryStoreDeleted);
            }
            return Ok(None);
        };
        let mut entry = state.read_record(&meta)?;
        entry.sequence = state.records.len() as u64 - 1;
        Ok(Some(entry))
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last declared sequence, if any.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.state.lock().records.last().map(|r| r.sequence)
    }

    /// Removes the log. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    pub fn delete(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.backend = None;
        state.records.clear();
        state.valid_end = 0;
        if let Some(path) = &self.path {
            if remove_if_exists(path)? {
                debug!(path = %path.display(), "transformation entries deleted");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransformationEntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationEntryStore")
            .field("path", &self.path)
            .field("entries", &self.len())
            .finish()
    }
}

/// Lazy iterator over stored entries.
///
/// Holds the positions known when it was created; records are read one at a
/// time as the iterator advances.
pub struct EntryIter {
    state: Arc<Mutex<State>>,
    records: Vec<RecordMeta>,
    next: usize,
    first_sequence: u64,
}

impl Iterator for EntryIter {
    type Item = CoreResult<TransformationEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let meta = *self.records.get(self.next)?;
        let sequence = self.first_sequence + self.next as u64;
        self.next += 1;
        let read = self.state.lock().read_record(&meta);
        if read.is_err() {
            self.next = self.records.len();
        }
        Some(read.map(|mut entry| {
            entry.sequence = sequence;
            entry
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.records.len() - self.next;
        (0, Some(remaining))
    }
}
