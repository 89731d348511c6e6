//! CLI command implementations.

pub mod entries;
pub mod segments;
pub mod transformations;
pub mod verify;

use chronoshift_core::EventType;

/// Both segment families of a context.
pub const EVENT_TYPES: [EventType; 2] = [EventType::Event, EventType::Snapshot];
