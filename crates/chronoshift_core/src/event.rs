//! Stored event records.

use crate::codec::{put_bytes, put_str, Reader};
use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;

const EVENT_FORMAT_VERSION: u8 = 1;
const FLAG_SNAPSHOT: u8 = 0b01;
const FLAG_PAYLOAD: u8 = 0b10;

/// A typed, serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedObject {
    /// Payload type name.
    pub payload_type: String,
    /// Payload type revision.
    pub revision: String,
    /// Serialized payload bytes.
    pub data: Vec<u8>,
}

impl SerializedObject {
    /// Creates a payload of the given type.
    #[must_use]
    pub fn new(payload_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            payload_type: payload_type.into(),
            revision: String::new(),
            data: data.into(),
        }
    }
}

/// One event as stored in a segment.
///
/// An event with an empty `aggregate_identifier` belongs to no aggregate and
/// is not indexed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    /// Unique message identifier.
    pub message_identifier: String,
    /// Aggregate the event belongs to, empty if none.
    pub aggregate_identifier: String,
    /// Position of the event within its aggregate.
    pub aggregate_sequence_number: u64,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: i64,
    /// The payload, absent for deleted events.
    pub payload: Option<SerializedObject>,
    /// Metadata entries.
    pub metadata: BTreeMap<String, String>,
    /// Whether this is an aggregate snapshot.
    pub snapshot: bool,
}

impl Event {
    /// Creates an aggregate event.
    #[must_use]
    pub fn new(
        aggregate_identifier: impl Into<String>,
        aggregate_sequence_number: u64,
        payload: SerializedObject,
    ) -> Self {
        Self {
            message_identifier: uuid::Uuid::new_v4().to_string(),
            aggregate_identifier: aggregate_identifier.into(),
            aggregate_sequence_number,
            payload: Some(payload),
            ..Self::default()
        }
    }

    /// Sets the aggregate type.
    #[must_use]
    pub fn with_aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = aggregate_type.into();
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the event is part of an aggregate stream.
    #[must_use]
    pub fn is_domain_event(&self) -> bool {
        !self.aggregate_identifier.is_empty()
    }

    /// The placeholder left in place of a deleted event.
    ///
    /// Payload, message identifier and metadata are cleared. The aggregate
    /// identity stays so the slot keeps its token and index position.
    #[must_use]
    pub fn nullified(&self) -> Self {
        Self {
            message_identifier: String::new(),
            payload: None,
            metadata: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Applies a replacement on top of this event.
    ///
    /// Aggregate type, payload and metadata come from `update` wholesale;
    /// message identifier, aggregate identity, timestamp and the snapshot
    /// flag stay as stored.
    #[must_use]
    pub fn merged(&self, update: &Self) -> Self {
        Self {
            aggregate_type: update.aggregate_type.clone(),
            payload: update.payload.clone(),
            metadata: update.metadata.clone(),
            ..self.clone()
        }
    }

    /// Serializes the event.
    ///
    /// # Errors
    ///
    /// Returns an error if a field exceeds the 4 GiB length limit.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.push(EVENT_FORMAT_VERSION);
        let mut flags = 0;
        if self.snapshot {
            flags |= FLAG_SNAPSHOT;
        }
        if self.payload.is_some() {
            flags |= FLAG_PAYLOAD;
        }
        buf.push(flags);
        put_str(&mut buf, &self.message_identifier)?;
        put_str(&mut buf, &self.aggregate_identifier)?;
        buf.extend_from_slice(&self.aggregate_sequence_number.to_le_bytes());
        put_str(&mut buf, &self.aggregate_type)?;
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        if let Some(payload) = &self.payload {
            put_str(&mut buf, &payload.payload_type)?;
            put_str(&mut buf, &payload.revision)?;
            put_bytes(&mut buf, &payload.data)?;
        }
        let count = u32::try_from(self.metadata.len())
            .map_err(|_| CoreError::invalid_operation("too many metadata entries"))?;
        buf.extend_from_slice(&count.to_le_bytes());
        for (key, value) in &self.metadata {
            put_str(&mut buf, key)?;
            put_str(&mut buf, value)?;
        }
        Ok(buf)
    }

    /// Deserializes an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are truncated or carry an unknown format.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::new(bytes, "event");
        let version = reader.u8()?;
        if version != EVENT_FORMAT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported event format {version}"
            )));
        }
        let flags = reader.u8()?;
        let message_identifier = reader.string()?;
        let aggregate_identifier = reader.string()?;
        let aggregate_sequence_number = reader.u64()?;
        let aggregate_type = reader.string()?;
        let timestamp = reader.i64()?;
        let payload = if flags & FLAG_PAYLOAD != 0 {
            Some(SerializedObject {
                payload_type: reader.string()?,
                revision: reader.string()?,
                data: reader.bytes()?,
            })
        } else {
            None
        };
        let count = reader.u32()?;
        let mut metadata = BTreeMap::new();
        for _ in 0..count {
            let key = reader.string()?;
            metadata.insert(key, reader.string()?);
        }
        reader.finish()?;

        Ok(Self {
            message_identifier,
            aggregate_identifier,
            aggregate_sequence_number,
            aggregate_type,
            timestamp,
            payload,
            metadata,
            snapshot: flags & FLAG_SNAPSHOT != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_placed() -> Event {
        Event::new("order-1", 4, SerializedObject::new("OrderPlaced", b"{}".to_vec()))
            .with_aggregate_type("Order")
            .with_metadata("trace", "abc")
            .with_timestamp(1_700_000_000_000)
    }

    #[test]
    fn encode_decode() {
        let event = order_placed();
        assert_eq!(Event::decode(&event.encode().unwrap()).unwrap(), event);

        let deleted = event.nullified();
        assert_eq!(Event::decode(&deleted.encode().unwrap()).unwrap(), deleted);
    }

    #[test]
    fn nullified_keeps_identity() {
        let deleted = order_placed().nullified();
        assert!(deleted.payload.is_none());
        assert!(deleted.message_identifier.is_empty());
        assert!(deleted.metadata.is_empty());
        assert_eq!(deleted.aggregate_identifier, "order-1");
        assert_eq!(deleted.aggregate_sequence_number, 4);
        assert_eq!(deleted.aggregate_type, "Order");
    }

    #[test]
    fn merged_replaces_content_wholesale() {
        let original = order_placed();
        let update = Event::new("ignored", 99, SerializedObject::new("OrderPlacedV2", b"[]".to_vec()))
            .with_aggregate_type("Purchase");

        let merged = original.merged(&update);
        assert_eq!(merged.message_identifier, original.message_identifier);
        assert_eq!(merged.aggregate_identifier, "order-1");
        assert_eq!(merged.aggregate_sequence_number, 4);
        assert_eq!(merged.timestamp, original.timestamp);
        assert_eq!(merged.aggregate_type, "Purchase");
        assert_eq!(merged.payload, update.payload);
        assert!(merged.metadata.is_empty());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = order_placed().encode().unwrap();
        bytes.push(0);
        assert!(Event::decode(&bytes).is_err());
    }
}
