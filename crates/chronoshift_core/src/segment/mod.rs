//! Segment data files.
//!
//! A segment holds a contiguous range of events, named after the token of
//! its first event. The token of the k-th event (counting across
//! transactions) is `segment + k`. Completed segments are immutable; a
//! transformation produces a new version of the whole file.
//!
//! ## Format
//!
//! ```text
//! header       | magic "CSEG" (4) | format (1) | segment (8) |
//! transaction  | body_len (4) | tx version (1) | count (2) | (event_len (4) | event)* | crc32 (4) |
//! end of file  | 0xFFFF_FFFF (4) |
//! ```
//!
//! The CRC covers `body_len` and the body. A position is the byte offset of an
//! `event_len` field, so an event can be read directly from an index entry.

mod reader;
mod record;
mod transformer;
mod writer;

pub use reader::{SegmentReader, StoredEvent, StoredTransaction, Transactions};
pub use record::{TransactionRecord, EOF_MARKER, SEGMENT_FORMAT_VERSION, SEGMENT_MAGIC, TX_FORMAT_VERSION};
pub use transformer::{RewriteProgress, SegmentTransformer, TransformerState};
pub use writer::{SegmentWriter, WrittenSegment};

/// Size of the segment file header.
pub const HEADER_SIZE: u64 = 13;
