//! Sequential and positional reads of segment data files.

use super::record::{decode_header, TransactionRecord, EOF_MARKER};
use super::HEADER_SIZE;
use crate::codec::compute_crc32;
use crate::error::{CoreError, CoreResult};
use crate::event::Event;
use crate::types::Token;
use chronoshift_storage::{FileBackend, StorageBackend};
use std::path::Path;

/// An event read back from a segment, with its token and file position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    /// Global token of the event.
    pub token: Token,
    /// Byte offset of the event record.
    pub position: u64,
    /// The event.
    pub event: Event,
}

/// A transaction read back from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTransaction {
    /// Byte offset of the transaction record.
    pub offset: u64,
    /// Record format of the transaction.
    pub version: u8,
    /// The events, in token order.
    pub events: Vec<StoredEvent>,
}

impl StoredTransaction {
    /// Token of the last event in the transaction.
    #[must_use]
    pub fn last_token(&self) -> Option<Token> {
        self.events.last().map(|e| e.token)
    }
}

/// Read access to one completed segment data file.
pub struct SegmentReader {
    backend: Box<dyn StorageBackend>,
    segment: u64,
}

impl SegmentReader {
    /// Opens a segment from a backend and validates its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is missing or malformed.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let header = backend.read_at(0, HEADER_SIZE as usize).map_err(|e| {
            CoreError::segment_corruption(format!("cannot read segment header: {e}"))
        })?;
        let segment = decode_header(&header)?;
        Ok(Self { backend, segment })
    }

    /// Opens a segment data file read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or its header is malformed.
    pub fn open_file(path: &Path) -> CoreResult<Self> {
        Self::open(Box::new(FileBackend::open_existing(path)?))
    }

    /// Segment id from the header.
    #[must_use]
    pub const fn segment(&self) -> u64 {
        self.segment
    }

    /// Reads the transaction at `offset`, returning it with the offset of the
    /// next one, or `None` at the end-of-file marker.
    ///
    /// # Errors
    ///
    /// Returns an error for a truncated record or a checksum mismatch.
    pub fn read_transaction(
        &self,
        offset: u64,
        first_token: Token,
    ) -> CoreResult<Option<(StoredTransaction, u64)>> {
        let size = self.backend.size()?;
        if offset == size {
            return Ok(None);
        }
        if offset + 4 > size {
            return Err(CoreError::segment_corruption(format!(
                "segment {} truncated at {offset}",
                self.segment
            )));
        }
        let len_bytes = self.backend.read_at(offset, 4)?;
        let body_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        if body_len == EOF_MARKER {
            return Ok(None);
        }

        let total = 4 + u64::from(body_len) + 4;
        if offset + total > size {
            return Err(CoreError::segment_corruption(format!(
                "transaction at {offset} of segment {} runs past end of file",
                self.segment
            )));
        }
        // total fits in usize: body_len is a u32
        let record = self.backend.read_at(offset, total as usize)?;
        let (framed, crc) = record.split_at(record.len() - 4);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let actual = compute_crc32(framed);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let (decoded, offsets) = TransactionRecord::decode_body(&framed[4..])?;
        let events = decoded
            .events
            .into_iter()
            .zip(offsets)
            .enumerate()
            .map(|(i, (event, body_offset))| StoredEvent {
                token: first_token + i as u64,
                position: offset + 4 + body_offset as u64,
                event,
            })
            .collect();
        Ok(Some((
            StoredTransaction {
                offset,
                version: decoded.version,
                events,
            },
            offset + total,
        )))
    }

    /// Reads the event whose record starts at `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the position does not hold an event record.
    pub fn read_event(&self, position: u64) -> CoreResult<Event> {
        let len_bytes = self.backend.read_at(position, 4)?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        if len == EOF_MARKER {
            return Err(CoreError::segment_corruption(format!(
                "position {position} of segment {} is the end-of-file marker",
                self.segment
            )));
        }
        let bytes = self.backend.read_at(position + 4, len as usize)?;
        Event::decode(&bytes)
    }

    /// Iterates over all transactions from the start of the segment.
    #[must_use]
    pub fn transactions(&self) -> Transactions<'_> {
        Transactions {
            reader: self,
            offset: HEADER_SIZE,
            next_token: self.segment,
            done: false,
        }
    }

    /// Iterates over all events from the start of the segment.
    pub fn events(&self) -> impl Iterator<Item = CoreResult<StoredEvent>> + '_ {
        self.transactions().flat_map(|tx| match tx {
            Ok(tx) => tx.events.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(err) => vec![Err(err)],
        })
    }

    /// Token following the last event, or the segment id for an empty segment.
    ///
    /// # Errors
    ///
    /// Returns an error if any transaction fails to read.
    pub fn next_token(&self) -> CoreResult<Token> {
        let mut next = self.segment;
        for tx in self.transactions() {
            next += tx?.events.len() as u64;
        }
        Ok(next)
    }
}

/// Iterator over the transactions of a segment.
pub struct Transactions<'a> {
    reader: &'a SegmentReader,
    offset: u64,
    next_token: Token,
    done: bool,
}

impl Iterator for Transactions<'_> {
    type Item = CoreResult<StoredTransaction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read_transaction(self.offset, self.next_token) {
            Ok(Some((tx, next_offset))) => {
                self.offset = next_offset;
                self.next_token += tx.events.len() as u64;
                Some(Ok(tx))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SerializedObject;
    use crate::segment::SegmentWriter;
    use chronoshift_storage::InMemoryBackend;

    fn event(aggregate: &str, seq: u64) -> Event {
        Event::new(aggregate, seq, SerializedObject::new("Evt", vec![seq as u8]))
    }

    fn written(segment: u64) -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        let mut writer = SegmentWriter::create(Box::new(backend.clone()), segment).unwrap();
        writer.append(&[event("a", 0), event("b", 0)]).unwrap();
        writer.append(&[event("a", 1)]).unwrap();
        writer.finish(false).unwrap();
        backend
    }

    #[test]
    fn tokens_count_across_transactions() {
        let reader = SegmentReader::open(Box::new(written(100))).unwrap();
        let events: Vec<_> = reader.events().collect::<CoreResult<_>>().unwrap();
        let tokens: Vec<_> = events.iter().map(|e| e.token).collect();
        assert_eq!(tokens, vec![100, 101, 102]);
        assert_eq!(reader.next_token().unwrap(), 103);
    }

    #[test]
    fn read_event_by_position() {
        let reader = SegmentReader::open(Box::new(written(0))).unwrap();
        for stored in reader.events() {
            let stored = stored.unwrap();
            assert_eq!(reader.read_event(stored.position).unwrap(), stored.event);
        }
    }

    #[test]
    fn corrupted_transaction_detected() {
        let backend = written(0);
        backend.corrupt_byte(HEADER_SIZE as usize + 6);
        let reader = SegmentReader::open(Box::new(backend)).unwrap();
        let first = reader.transactions().next().unwrap();
        assert!(first.is_err());
        assert_eq!(reader.transactions().count(), 1);
    }

    #[test]
    fn bad_header_rejected() {
        let backend = InMemoryBackend::with_data(b"nonsense-bytes".to_vec());
        assert!(SegmentReader::open(Box::new(backend)).is_err());
    }
}
