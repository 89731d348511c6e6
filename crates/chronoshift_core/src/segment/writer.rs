//! Sequential segment writer.

use super::record::{encode_header, TransactionRecord, EOF_MARKER};
use crate::error::{CoreError, CoreResult};
use crate::event::Event;
use crate::index::{IndexEntry, SegmentIndexEntries};
use crate::types::Token;
use chronoshift_storage::StorageBackend;

/// The outcome of writing a whole segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenSegment {
    /// Segment id.
    pub segment: u64,
    /// Token following the last written event.
    pub next_token: Token,
    /// Positions of every aggregate event written.
    pub entries: SegmentIndexEntries,
}

/// Writes transactions to a fresh segment file and collects index entries.
pub struct SegmentWriter {
    backend: Box<dyn StorageBackend>,
    segment: u64,
    next_token: Token,
    entries: SegmentIndexEntries,
}

impl SegmentWriter {
    /// Starts a segment on an empty backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend already holds data.
    pub fn create(mut backend: Box<dyn StorageBackend>, segment: u64) -> CoreResult<Self> {
        if backend.size()? != 0 {
            return Err(CoreError::invalid_operation(format!(
                "segment {segment} target is not empty"
            )));
        }
        backend.append(&encode_header(segment))?;
        Ok(Self {
            backend,
            segment,
            next_token: segment,
            entries: SegmentIndexEntries::new(),
        })
    }

    /// Token the next appended event receives.
    #[must_use]
    pub const fn next_token(&self) -> Token {
        self.next_token
    }

    /// Appends one transaction in the current format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub fn append(&mut self, events: &[Event]) -> CoreResult<Vec<u64>> {
        self.append_record(&TransactionRecord::new(events.to_vec()))
    }

    /// Appends a transaction record and returns the position of each event.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails, or the segment would
    /// grow past 4 GiB.
    pub fn append_record(&mut self, record: &TransactionRecord) -> CoreResult<Vec<u64>> {
        let (bytes, offsets) = record.encode()?;
        let start = self.backend.append(&bytes)?;
        let mut positions = Vec::with_capacity(offsets.len());
        for (event, relative) in record.events.iter().zip(offsets) {
            let position = start + relative as u64;
            positions.push(position);
            if event.is_domain_event() {
                let position = u32::try_from(position).map_err(|_| {
                    CoreError::invalid_operation(format!(
                        "segment {} exceeds the 4 GiB position range",
                        self.segment
                    ))
                })?;
                self.entries
                    .entry(event.aggregate_identifier.clone())
                    .or_default()
                    .add(IndexEntry::new(event.aggregate_sequence_number, position));
            }
        }
        self.next_token += record.events.len() as u64;
        Ok(positions)
    }

    /// Writes the end-of-file marker and flushes, fsyncing when `sync` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the write, flush or sync fails.
    pub fn finish(mut self, sync: bool) -> CoreResult<WrittenSegment> {
        self.backend.append(&EOF_MARKER.to_le_bytes())?;
        self.backend.flush()?;
        if sync {
            self.backend.sync()?;
        }
        Ok(WrittenSegment {
            segment: self.segment,
            next_token: self.next_token,
            entries: self.entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SerializedObject;
    use chronoshift_storage::InMemoryBackend;

    #[test]
    fn collects_entries_for_aggregate_events_only() {
        let backend = InMemoryBackend::new();
        let mut writer = SegmentWriter::create(Box::new(backend.clone()), 10).unwrap();
        let untracked = Event {
            payload: Some(SerializedObject::new("Tick", Vec::new())),
            ..Event::default()
        };

        writer
            .append(&[
                Event::new("order-1", 0, SerializedObject::new("Placed", vec![1])),
                untracked,
                Event::new("order-1", 1, SerializedObject::new("Paid", vec![2])),
            ])
            .unwrap();
        assert_eq!(writer.next_token(), 13);

        let written = writer.finish(true).unwrap();
        assert_eq!(written.entries.len(), 1);
        let order = &written.entries["order-1"];
        assert_eq!(order.len(), 2);
        assert_eq!(order.last_sequence_number(), Some(1));
        assert_eq!(backend.synced_len(), backend.data().len());
    }

    #[test]
    fn refuses_non_empty_target() {
        let backend = InMemoryBackend::with_data(vec![1]);
        assert!(SegmentWriter::create(Box::new(backend), 0).is_err());
    }
}
