//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to shrink to a size larger than the current one.
    #[error("cannot truncate to {requested} bytes, current size is {size}")]
    InvalidTruncate {
        /// The requested size.
        requested: u64,
        /// The current storage size.
        size: u64,
    },

    /// A write was attempted on a backend opened read-only.
    #[error("backend is read-only: {0}")]
    ReadOnly(PathBuf),

    /// The file expected by an `open_existing` call is missing.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// The stored bytes are inconsistent.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
