//! Segment header and transaction records.

use crate::codec::{compute_crc32, Reader};
use crate::error::{CoreError, CoreResult};
use crate::event::Event;

/// Magic bytes opening every segment data file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"CSEG";

/// Current segment file format.
pub const SEGMENT_FORMAT_VERSION: u8 = 1;

/// Current transaction record format.
pub const TX_FORMAT_VERSION: u8 = 1;

/// Length value marking the end of a segment.
pub const EOF_MARKER: u32 = u32::MAX;

/// Encodes the segment header.
pub(crate) fn encode_header(segment: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13);
    buf.extend_from_slice(&SEGMENT_MAGIC);
    buf.push(SEGMENT_FORMAT_VERSION);
    buf.extend_from_slice(&segment.to_le_bytes());
    buf
}

/// Decodes the segment header and returns the segment id.
pub(crate) fn decode_header(bytes: &[u8]) -> CoreResult<u64> {
    let mut reader = Reader::new(bytes, "segment header");
    if reader.take(4)? != SEGMENT_MAGIC {
        return Err(CoreError::segment_corruption("bad segment magic"));
    }
    let format = reader.u8()?;
    if format != SEGMENT_FORMAT_VERSION {
        return Err(CoreError::invalid_format(format!(
            "unsupported segment format {format}"
        )));
    }
    let segment = reader.u64()?;
    reader.finish()?;
    Ok(segment)
}

/// One transaction as written to a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Record format of the transaction.
    pub version: u8,
    /// The events, in token order.
    pub events: Vec<Event>,
}

impl TransactionRecord {
    /// Fixed bytes before the first event: body_len, version, count.
    pub const PREFIX_SIZE: usize = 7;

    /// Creates a transaction record in the current format.
    #[must_use]
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            version: TX_FORMAT_VERSION,
            events,
        }
    }

    /// Encodes the record and returns it with each event's offset relative
    /// to the start of the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is empty, has more than
    /// `u16::MAX` events, or an event fails to encode.
    pub fn encode(&self) -> CoreResult<(Vec<u8>, Vec<usize>)> {
        if self.events.is_empty() {
            return Err(CoreError::invalid_operation("empty transaction"));
        }
        let count = u16::try_from(self.events.len()).map_err(|_| {
            CoreError::invalid_operation(format!(
                "transaction with {} events exceeds {}",
                self.events.len(),
                u16::MAX
            ))
        })?;

        let mut buf = vec![0u8; 4];
        buf.push(self.version);
        buf.extend_from_slice(&count.to_le_bytes());
        let mut offsets = Vec::with_capacity(self.events.len());
        for event in &self.events {
            let bytes = event.encode()?;
            let len = u32::try_from(bytes.len())
                .ok()
                .filter(|len| *len != EOF_MARKER)
                .ok_or_else(|| CoreError::invalid_operation("event too large"))?;
            offsets.push(buf.len());
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&bytes);
        }

        let body_len = u32::try_from(buf.len() - 4)
            .map_err(|_| CoreError::invalid_operation("transaction too large"))?;
        buf[..4].copy_from_slice(&body_len.to_le_bytes());
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok((buf, offsets))
    }

    /// Decodes a transaction body (everything between `body_len` and the CRC).
    ///
    /// Returns the record and each event's offset relative to the body start.
    pub(crate) fn decode_body(body: &[u8]) -> CoreResult<(Self, Vec<usize>)> {
        let mut reader = Reader::new(body, "transaction");
        let version = reader.u8()?;
        if version != TX_FORMAT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported transaction format {version}"
            )));
        }
        let count = reader.u16()?;
        let mut events = Vec::with_capacity(usize::from(count));
        let mut offsets = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            offsets.push(reader.position());
            let len = reader.u32()? as usize;
            events.push(Event::decode(reader.take(len)?)?);
        }
        reader
            .finish()
            .map_err(|e| CoreError::segment_corruption(e.to_string()))?;
        Ok((Self { version, events }, offsets))
    }
}
