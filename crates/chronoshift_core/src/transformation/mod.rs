//! Transformations: durable pending edits and the apply lifecycle.
//!
//! A transformation collects delete and replace edits in a
//! [`TransformationEntryStore`], then [`TransformationProcessor::apply`]
//! replays the affected token range through an [`EventStoreTransformer`],
//! which rewrites each touched segment into a new version.

mod entry;
mod entry_store;
mod event_store;
mod processor;
mod registry;
mod state;
mod validation;

pub use entry::{EntryOp, TransformationEntry, ENTRY_FORMAT_VERSION};
pub use entry_store::{EntryIter, TransformationEntryStore};
pub use event_store::{
    CancelFlag, EventProvider, EventStoreTransformer, EventTransformation, TransformRequest,
    TransformSummary, TransformedEvent,
};
pub use processor::{ApplyOutcome, ApplyReport, TransformationProcessor};
pub use registry::EntryStoreRegistry;
pub use state::{
    ApplyStart, FileStateManager, InMemoryStateManager, Transformation, TransformationProgress,
    TransformationStateManager, TransformationStatus,
};
pub use validation::ValidatingTransformer;
