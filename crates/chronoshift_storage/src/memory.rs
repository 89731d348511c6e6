//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Buffer {
    bytes: Vec<u8>,
    synced: usize,
}

/// An in-memory storage backend.
///
/// Clones share the same buffer, so a test can hand one handle to an entry
/// store and keep another to inspect or damage the bytes afterwards. The
/// backend also remembers how many bytes were covered by the last `sync`,
/// which lets [`InMemoryBackend::lose_unsynced`] model a power loss.
///
/// # Example
///
/// ```rust
/// use chronoshift_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let observer = backend.clone();
/// backend.append(b"entry").unwrap();
/// assert_eq!(observer.data(), b"entry");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    buffer: Arc<RwLock<Buffer>>,
}

impl InMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `data`, all of it considered durable.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let synced = data.len();
        Self {
            buffer: Arc::new(RwLock::new(Buffer {
                bytes: data,
                synced,
            })),
        }
    }

    /// Returns a copy of all bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.buffer.read().bytes.clone()
    }

    /// Number of bytes made durable by the last `sync`.
    #[must_use]
    pub fn synced_len(&self) -> usize {
        self.buffer.read().synced
    }

    /// Drops every byte written after the last `sync`.
    pub fn lose_unsynced(&self) {
        let mut buffer = self.buffer.write();
        let synced = buffer.synced;
        buffer.bytes.truncate(synced);
    }

    /// Flips every bit of the byte at `offset`, if present.
    pub fn corrupt_byte(&self, offset: usize) {
        if let Some(byte) = self.buffer.write().bytes.get_mut(offset) {
            *byte ^= 0xFF;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let buffer = self.buffer.read();
        let size = buffer.bytes.len() as u64;
        let start = usize::try_from(offset).map_err(|_| StorageError::ReadPastEnd {
            offset,
            len,
            size,
        })?;
        let end = start.saturating_add(len);
        if start > buffer.bytes.len() || end > buffer.bytes.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(buffer.bytes[start..end].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut buffer = self.buffer.write();
        let offset = buffer.bytes.len() as u64;
        buffer.bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.buffer.read().bytes.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut buffer = self.buffer.write();
        buffer.synced = buffer.bytes.len();
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut buffer = self.buffer.write();
        let size = buffer.bytes.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        // new_size <= len, which already fits in usize
        let new_len = new_size as usize;
        buffer.bytes.truncate(new_len);
        buffer.synced = buffer.synced.min(new_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_bytes() {
        let mut writer = InMemoryBackend::new();
        let reader = writer.clone();
        writer.append(b"shared").unwrap();
        assert_eq!(reader.size().unwrap(), 6);
        assert_eq!(reader.read_at(0, 6).unwrap(), b"shared");
    }

    #[test]
    fn lose_unsynced_keeps_durable_prefix() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"durable").unwrap();
        backend.sync().unwrap();
        backend.append(b"-lost").unwrap();

        backend.lose_unsynced();
        assert_eq!(backend.data(), b"durable");
    }

    #[test]
    fn truncate_lowers_synced_mark() {
        let mut backend = InMemoryBackend::with_data(b"0123456789".to_vec());
        backend.truncate(3).unwrap();
        assert_eq!(backend.synced_len(), 3);
        assert!(backend.truncate(4).is_err());
    }

    #[test]
    fn corrupt_byte_flips_bits() {
        let backend = InMemoryBackend::with_data(vec![0x0F]);
        backend.corrupt_byte(0);
        assert_eq!(backend.data(), vec![0xF0]);
        backend.corrupt_byte(10);
    }

    #[test]
    fn read_past_end_is_error() {
        let backend = InMemoryBackend::with_data(b"abc".to_vec());
        assert!(backend.read_at(1, 2).is_ok());
        assert!(matches!(
            backend.read_at(4, 0),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }
}
