//! Pending edit operations.

use crate::codec::Reader;
use crate::error::{CoreError, CoreResult};
use crate::event::Event;
use crate::types::Token;

/// Wire format of entry payloads written by this version.
pub const ENTRY_FORMAT_VERSION: u8 = 1;

const OP_DELETE: u8 = 1;
const OP_REPLACE: u8 = 2;

/// A decoded edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOp {
    /// Clear the event at `token`.
    Delete {
        /// Token of the event.
        token: Token,
    },
    /// Replace the content of the event at `token`.
    Replace {
        /// Token of the event.
        token: Token,
        /// The replacement content.
        event: Event,
    },
}

impl EntryOp {
    /// Token the edit targets.
    #[must_use]
    pub const fn token(&self) -> Token {
        match self {
            Self::Delete { token } | Self::Replace { token, .. } => *token,
        }
    }

    /// Applies the edit to the stored event.
    #[must_use]
    pub fn apply(&self, original: &Event) -> Event {
        match self {
            Self::Delete { .. } => original.nullified(),
            Self::Replace { event, .. } => original.merged(event),
        }
    }

    fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(9);
        match self {
            Self::Delete { token } => {
                buf.push(OP_DELETE);
                buf.extend_from_slice(&token.to_le_bytes());
            }
            Self::Replace { token, event } => {
                buf.push(OP_REPLACE);
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&event.encode()?);
            }
        }
        Ok(buf)
    }

    fn decode(payload: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::new(payload, "transformation entry");
        let kind = reader.u8()?;
        let token = reader.u64()?;
        match kind {
            OP_DELETE => {
                reader.finish()?;
                Ok(Self::Delete { token })
            }
            OP_REPLACE => Ok(Self::Replace {
                token,
                event: Event::decode(&payload[reader.position()..])?,
            }),
            other => Err(CoreError::invalid_format(format!(
                "unknown transformation entry kind {other}"
            ))),
        }
    }
}

/// One appended edit: a sequence number, a format tag and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationEntry {
    /// Position in the transformation's edit log.
    pub sequence: u64,
    /// Payload format tag.
    pub version: u8,
    /// Encoded [`EntryOp`].
    pub payload: Vec<u8>,
}

impl TransformationEntry {
    /// Encodes an edit as an entry with the given sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if a replacement event fails to encode.
    pub fn new(sequence: u64, op: &EntryOp) -> CoreResult<Self> {
        Ok(Self {
            sequence,
            version: ENTRY_FORMAT_VERSION,
            payload: op.encode()?,
        })
    }

    /// A delete entry.
    ///
    /// # Errors
    ///
    /// Infallible in practice; shares the signature of [`Self::new`].
    pub fn delete(sequence: u64, token: Token) -> CoreResult<Self> {
        Self::new(sequence, &EntryOp::Delete { token })
    }

    /// A replace entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the event fails to encode.
    pub fn replace(sequence: u64, token: Token, event: Event) -> CoreResult<Self> {
        Self::new(sequence, &EntryOp::Replace { token, event })
    }

    /// Decodes the edit.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown format tag or malformed payload.
    pub fn op(&self) -> CoreResult<EntryOp> {
        if self.version != ENTRY_FORMAT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported transformation entry format {}",
                self.version
            )));
        }
        EntryOp::decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SerializedObject;

    #[test]
    fn ops_decode_from_entries() {
        let delete = TransformationEntry::delete(0, 100).unwrap();
        assert_eq!(delete.op().unwrap(), EntryOp::Delete { token: 100 });

        let event = Event::new("a", 1, SerializedObject::new("Fixed", vec![1]));
        let replace = TransformationEntry::replace(1, 101, event.clone()).unwrap();
        assert_eq!(replace.op().unwrap(), EntryOp::Replace { token: 101, event });
    }

    #[test]
    fn unknown_format_rejected() {
        let mut entry = TransformationEntry::delete(0, 1).unwrap();
        entry.version = 9;
        assert!(entry.op().is_err());
        entry.version = ENTRY_FORMAT_VERSION;
        entry.payload[0] = 7;
        assert!(entry.op().is_err());
    }

    #[test]
    fn apply_delete_and_replace() {
        let original = Event::new("a", 3, SerializedObject::new("Old", vec![1]))
            .with_metadata("k", "v");
        let deleted = EntryOp::Delete { token: 5 }.apply(&original);
        assert!(deleted.payload.is_none());

        let update = Event::new("a", 3, SerializedObject::new("New", vec![2]));
        let replaced = EntryOp::Replace { token: 5, event: update.clone() }.apply(&original);
        assert_eq!(replaced.payload, update.payload);
        assert_eq!(replaced.message_identifier, original.message_identifier);
    }
}
