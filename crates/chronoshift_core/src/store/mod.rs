//! Segmented event storage with transformation support.

mod local;
mod segment_store;

pub use local::LocalEventStore;
pub use segment_store::SegmentStore;
