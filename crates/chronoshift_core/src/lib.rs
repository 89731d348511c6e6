//! # Chronoshift Core
//!
//! Transformation engine for an append-only event store.
//!
//! This crate provides:
//! - Segment files: an immutable, versioned log of event transactions
//! - The segment index engine: per-segment aggregate indexes and bloom filters
//!   with bounded caches and a background eviction sweep
//! - Segment rewriting into new versions
//! - Transformations: durable pending edits, the apply state machine,
//!   checkpointing, cancellation, rollback and restart recovery
//! - [`SegmentStore`] and [`LocalEventStore`], which tie the pieces together
//!
//! ## Example
//!
//! ```rust,no_run
//! use chronoshift_core::{
//!     EntryStoreRegistry, InMemoryStateManager, LocalEventStore, StorageConfig,
//!     TransformationId, TransformationProcessor,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> chronoshift_core::CoreResult<()> {
//! let config = StorageConfig::default();
//! let store = Arc::new(LocalEventStore::new("/var/lib/chronoshift", config.clone()));
//! let processor = TransformationProcessor::new(
//!     Arc::new(InMemoryStateManager::new()),
//!     store,
//!     Arc::new(EntryStoreRegistry::new("/var/lib/chronoshift", config)),
//! );
//!
//! let id = TransformationId::generate();
//! processor.start("default", &id, 1, "remove leaked card numbers")?;
//! processor.delete_event(&id, 42, 0)?;
//! let report = processor.apply(&id, true, "ops", 0)?;
//! println!("{} events rewritten", report.events_transformed);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod error;
mod event;
pub mod index;
pub mod layout;
pub mod segment;
mod store;
pub mod transformation;
mod types;

pub use codec::compute_crc32;
pub use config::{SequenceGapPolicy, StorageConfig};
pub use error::{CoreError, CoreResult};
pub use event::{Event, SerializedObject};
pub use index::{IndexManager, IndexStats, RemoteSequenceResolver};
pub use layout::{ContextDir, SegmentLayout};
pub use segment::{SegmentReader, SegmentTransformer, SegmentWriter};
pub use store::{LocalEventStore, SegmentStore};
pub use transformation::{
    ApplyOutcome, ApplyReport, CancelFlag, EntryOp, EntryStoreRegistry, EventProvider,
    EventStoreTransformer, EventTransformation, FileStateManager, InMemoryStateManager,
    TransformationEntry, TransformationEntryStore, TransformationProcessor,
    TransformationStateManager, TransformationStatus, ValidatingTransformer,
};
pub use types::{EventType, FileVersion, Token, TransformationId};
