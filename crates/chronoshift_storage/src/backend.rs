//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level, append-oriented byte store.
///
/// Every on-disk artifact of the engine (segment data files, index files,
/// bloom filters, transformation entry logs) is written through this trait.
/// Implementations know nothing about those formats.
///
/// # Invariants
///
/// - `append` returns the offset at which the bytes start
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - `sync` makes all appended bytes and the current length durable
/// - `truncate` only shrinks; it is how torn tails and reset entries are cut off
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends beyond
    /// the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset where it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is read-only or an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes (the offset of the next append).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes all data and metadata durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Shrinks the storage to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size, the
    /// backend is read-only, or an I/O error occurs.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads everything from `offset` to the end.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` is beyond the end or the read fails.
    fn read_from(&self, offset: u64) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        if offset > size {
            return Err(crate::StorageError::ReadPastEnd {
                offset,
                len: 0,
                size,
            });
        }
        let len = usize::try_from(size - offset).map_err(|_| {
            crate::StorageError::Corrupted(format!("file too large to buffer: {size} bytes"))
        })?;
        self.read_at(offset, len)
    }
}
