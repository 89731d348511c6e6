//! # Chronoshift Storage
//!
//! Byte-level storage for the Chronoshift transformation engine.
//!
//! Backends are **opaque byte stores**: they append, read, truncate and sync
//! bytes, and never interpret segment, index or entry-store formats. The
//! [`fs`] module adds the file-system primitives used to promote rewritten
//! artifacts (write to a temporary file, fsync, rename over the target, fsync
//! the directory).
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - persistent storage on top of a single OS file
//! - [`InMemoryBackend`] - shared in-memory buffer for tests and crash simulation
//!
//! ## Example
//!
//! ```rust
//! use chronoshift_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"event bytes").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"event");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
pub mod fs;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, OpenMode};
pub use memory::InMemoryBackend;
