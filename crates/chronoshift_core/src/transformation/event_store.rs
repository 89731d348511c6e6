//! Seams between the processor and the store whose segments it rewrites.

use crate::error::CoreResult;
use crate::event::Event;
use crate::types::Token;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of offering one stored event to an [`EventTransformation`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransformedEvent {
    /// New content for the event, if an edit matched.
    pub replacement: Option<Event>,
    /// Token of the next pending edit; the store may skip ahead to it.
    pub next_token: Option<Token>,
}

/// Decides, event by event, what a replay writes back.
///
/// Events are offered in ascending token order.
pub trait EventTransformation {
    /// Offers the event stored at `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending edits cannot be read.
    fn transform(&mut self, event: &Event, token: Token) -> CoreResult<TransformedEvent>;
}

/// Cooperative cancellation signal for a running replay.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag was raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which part of a context's log a replay covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    /// Context to rewrite.
    pub context: String,
    /// First token, inclusive.
    pub first_token: Token,
    /// Last token, inclusive.
    pub last_token: Token,
    /// Keep the superseded version of each rewritten segment.
    pub keep_old_versions: bool,
    /// Version the rewritten segments get.
    pub version: u32,
}

/// What a replay did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransformSummary {
    /// Events that received new content.
    pub events_transformed: usize,
    /// Segments promoted to a new version.
    pub segments_rewritten: usize,
    /// Whether the replay stopped on the cancel flag.
    pub cancelled: bool,
}

/// A store that can replay and rewrite its segments.
pub trait EventStoreTransformer: Send + Sync {
    /// Replays the events of `request`'s token range through `transformation`
    /// and rewrites every segment that received a replacement.
    ///
    /// `progress` is called with the last token of the range covered by each
    /// finished segment. `cancel` is checked between segments; a segment whose
    /// rewrite was under way when it is raised is replayed to its end and then
    /// discarded, keeping its current version.
    ///
    /// # Errors
    ///
    /// Returns an error if reading, rewriting or `progress` fails, or
    /// [`crate::CoreError::StaleVersion`] if a segment holding pending edits
    /// is already past `request.version`. Segments already promoted stay
    /// promoted.
    fn transform_events(
        &self,
        request: &TransformRequest,
        transformation: &mut dyn EventTransformation,
        progress: &mut dyn FnMut(Token) -> CoreResult<()>,
        cancel: &CancelFlag,
    ) -> CoreResult<TransformSummary>;

    /// Highest segment version in `context`, zero for a context never rewritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be opened.
    fn current_version(&self, context: &str) -> CoreResult<u32>;

    /// Physically removes segment versions superseded by `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed.
    fn delete_old_versions(&self, context: &str, version: u32) -> CoreResult<usize>;

    /// Reverts every segment at `version` to its previous version.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::RollbackUnavailable`] if a previous version
    /// is gone; nothing is reverted in that case.
    fn rollback_segments(&self, context: &str, version: u32) -> CoreResult<usize>;
}

/// Random access to stored events, used to validate edits.
pub trait EventProvider: Send + Sync {
    /// The event stored at `token` in `context`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn event_at(&self, context: &str, token: Token) -> CoreResult<Option<Event>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
