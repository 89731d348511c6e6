//! # Chronoshift Testkit
//!
//! Test utilities for Chronoshift.
//!
//! This crate provides:
//! - Engine fixtures: a segment store, state records and a processor in a
//!   temporary directory, restartable to simulate a process restart
//! - Crash simulation for the byte backends under entry stores
//! - Property-based generators for events, transactions and edit logs
//! - Golden byte layouts of the persisted formats
//! - An integration harness that tracks the expected content of every token
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chronoshift_testkit::prelude::*;
//!
//! #[test]
//! fn deletes_are_applied() {
//!     let engine = TestEngine::new();
//!     scenarios::two_segments(&engine);
//!     let id = engine.start_transformation("gdpr");
//!     engine.processor.delete_event(&id, 1, 0).unwrap();
//!     engine.processor.apply(&id, true, "test", 0).unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod golden;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use golden::*;
pub use integration::*;
