//! Error types for the Chronoshift core.

use crate::types::FileVersion;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] chronoshift_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization of a state record failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A segment data file is corrupted or truncated.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// An index or bloom filter file is corrupted.
    #[error("index corruption: {message}")]
    IndexCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Invalid file format or version tag.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The index for a segment version could not be opened, even after retries.
    #[error("index not found for {file_version}: {reason}")]
    IndexNotFound {
        /// The segment version that was looked up.
        file_version: FileVersion,
        /// Why the last open attempt failed.
        reason: String,
    },

    /// A segment index was used after being closed.
    #[error("index for {0} is closed")]
    IndexClosed(FileVersion),

    /// An active-index write hit a segment that is already completed.
    #[error("segment {segment} is already completed")]
    SegmentAlreadyCompleted {
        /// The segment id.
        segment: u64,
    },

    /// No segment holds the requested token or version.
    #[error("segment not found: {message}")]
    SegmentNotFound {
        /// What was looked up.
        message: String,
    },

    /// No transformation with this id exists.
    #[error("transformation not found: {id}")]
    TransformationNotFound {
        /// The transformation id.
        id: String,
    },

    /// A transformation with this id already exists.
    #[error("transformation already exists: {id}")]
    TransformationExists {
        /// The transformation id.
        id: String,
    },

    /// The transformation is not in a status that allows the operation.
    #[error("transformation {id} is {status}, expected {expected}")]
    InvalidTransformationState {
        /// The transformation id.
        id: String,
        /// The status found.
        status: String,
        /// The status (or statuses) the operation requires.
        expected: String,
    },

    /// Another apply already runs for this transformation or context.
    #[error("apply already in progress for {key}")]
    ApplyInProgress {
        /// The transformation id or context.
        key: String,
    },

    /// An edit failed pre-admission validation.
    #[error("validation failed: {message}")]
    Validation {
        /// Why the edit was rejected.
        message: String,
    },

    /// An entry targets a token not greater than the previous entry's token.
    #[error("token {token} is not after the previous entry token {previous}")]
    TokenOutOfOrder {
        /// Token of the rejected entry.
        token: u64,
        /// Token of the last stored entry.
        previous: u64,
    },

    /// A declared entry sequence skips ahead and the store rejects gaps.
    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap {
        /// The next expected sequence.
        expected: u64,
        /// The declared sequence.
        actual: u64,
    },

    /// The entry store was deleted and can no longer be used.
    #[error("entry store deleted")]
    EntryStoreDeleted,

    /// Another process holds the context directory lock.
    #[error("context {context} is locked by another process")]
    ContextLocked {
        /// The context name.
        context: String,
    },

    /// Rolling back needs the previous segment version, which is gone.
    #[error("cannot roll back segment {segment}: version {version} is not available")]
    RollbackUnavailable {
        /// The segment id.
        segment: u64,
        /// The missing version.
        version: u32,
    },

    /// A transformation version is not above the versions already in use.
    #[error("version {version} is stale in context {context}: version {current} is already in use")]
    StaleVersion {
        /// The context name.
        context: String,
        /// The requested version.
        version: u32,
        /// Highest version already written or being written.
        current: u32,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates an index corruption error.
    pub fn index_corruption(message: impl Into<String>) -> Self {
        Self::IndexCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an index not found error.
    pub fn index_not_found(file_version: FileVersion, reason: impl Into<String>) -> Self {
        Self::IndexNotFound {
            file_version,
            reason: reason.into(),
        }
    }

    /// Creates a segment not found error.
    pub fn segment_not_found(message: impl Into<String>) -> Self {
        Self::SegmentNotFound {
            message: message.into(),
        }
    }

    /// Creates a transformation not found error.
    pub fn transformation_not_found(id: impl ToString) -> Self {
        Self::TransformationNotFound { id: id.to_string() }
    }

    /// Creates an invalid transformation state error.
    pub fn invalid_state(
        id: impl ToString,
        status: impl ToString,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidTransformationState {
            id: id.to_string(),
            status: status.to_string(),
            expected: expected.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Index opens are retried on I/O and corruption errors, since a file may
    /// be mid-promotion when first touched.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Storage(_) | Self::IndexCorruption { .. } | Self::ChecksumMismatch { .. }
        )
    }
}
