//! The transformation lifecycle.
//!
//! ```text
//! ACTIVE -> CLOSED -> APPLYING -> APPLIED -> ROLLING_BACK -> ROLLED_BACK
//!                         |  \-> FAILED
//!                         \----> CANCELLED
//! ```

use super::entry::{EntryOp, TransformationEntry};
use super::entry_store::{EntryIter, TransformationEntryStore};
use super::event_store::{
    CancelFlag, EventStoreTransformer, EventTransformation, TransformRequest, TransformedEvent,
};
use super::registry::EntryStoreRegistry;
use super::state::{
    ApplyStart, Transformation, TransformationProgress, TransformationStateManager,
    TransformationStatus,
};
use crate::error::{CoreError, CoreResult};
use crate::event::Event;
use crate::types::{Token, TransformationId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How an apply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every pending edit was written.
    Applied,
    /// There was nothing to apply.
    Empty,
    /// The apply stopped on a cancel request.
    Cancelled,
}

/// Summary of one apply run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// The transformation.
    pub transformation_id: TransformationId,
    /// First token of the replayed range.
    pub first_token: Option<Token>,
    /// Last token of the replayed range.
    pub last_token: Option<Token>,
    /// Events that received new content.
    pub events_transformed: usize,
    /// Segments promoted to a new version.
    pub segments_rewritten: usize,
    /// How the run ended.
    pub outcome: ApplyOutcome,
}

impl ApplyReport {
    fn empty(id: &TransformationId) -> Self {
        Self {
            transformation_id: id.clone(),
            first_token: None,
            last_token: None,
            events_transformed: 0,
            segments_rewritten: 0,
            outcome: ApplyOutcome::Empty,
        }
    }
}

/// Walks pending edits alongside a replay.
///
/// Edits at or before `after` were applied by an earlier run and are skipped.
struct EntryCursor {
    entries: EntryIter,
    after: Option<Token>,
    pending: Option<EntryOp>,
}

impl EntryCursor {
    fn new(entries: EntryIter, after: Option<Token>) -> CoreResult<Self> {
        let mut cursor = Self {
            entries,
            after,
            pending: None,
        };
        cursor.pending = cursor.pull()?;
        Ok(cursor)
    }

    fn pull(&mut self) -> CoreResult<Option<EntryOp>> {
        for entry in self.entries.by_ref() {
            let op = entry?.op()?;
            if self.after.is_some_and(|after| op.token() <= after) {
                continue;
            }
            return Ok(Some(op));
        }
        Ok(None)
    }
}

impl EventTransformation for EntryCursor {
    fn transform(&mut self, event: &Event, token: Token) -> CoreResult<TransformedEvent> {
        while self.pending.as_ref().is_some_and(|op| op.token() < token) {
            self.pending = self.pull()?;
        }
        // later entries for the same token win
        let mut matched = None;
        while self.pending.as_ref().is_some_and(|op| op.token() == token) {
            matched = self.pending.take();
            self.pending = self.pull()?;
        }
        Ok(TransformedEvent {
            replacement: matched.map(|op| op.apply(event)),
            next_token: self.pending.as_ref().map(EntryOp::token),
        })
    }
}

#[derive(Debug, Default)]
struct InFlight {
    flags: HashMap<TransformationId, CancelFlag>,
    contexts: HashSet<String>,
}

/// Releases an apply reservation when dropped.
struct ApplySlot<'a> {
    in_flight: &'a Mutex<InFlight>,
    id: TransformationId,
    context: String,
    flag: CancelFlag,
}

impl Drop for ApplySlot<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        in_flight.flags.remove(&self.id);
        in_flight.contexts.remove(&self.context);
    }
}

/// Creates, edits, applies, cancels and rolls back transformations.
///
/// At most one apply or rollback runs per transformation and per context.
/// Applies run on the caller's thread; [`Self::cancel`] from another thread
/// stops them between segments.
pub struct TransformationProcessor {
    state: Arc<dyn TransformationStateManager>,
    store: Arc<dyn EventStoreTransformer>,
    entries: Arc<EntryStoreRegistry>,
    in_flight: Mutex<InFlight>,
}

impl TransformationProcessor {
    /// Creates a processor.
    pub fn new(
        state: Arc<dyn TransformationStateManager>,
        store: Arc<dyn EventStoreTransformer>,
        entries: Arc<EntryStoreRegistry>,
    ) -> Self {
        Self {
            state,
            store,
            entries,
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    /// Opens a new transformation and its entry store.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransformationExists`] for a duplicate id,
    /// [`CoreError::InvalidOperation`] for an id unusable as a file name,
    /// [`CoreError::StaleVersion`] unless `version` is above every version
    /// already written to the context, or a storage error.
    pub fn start(
        &self,
        context: &str,
        id: &TransformationId,
        version: u32,
        description: &str,
    ) -> CoreResult<Transformation> {
        let name = id.as_str();
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(CoreError::invalid_operation(format!(
                "invalid transformation id: {name:?}"
            )));
        }
        self.check_version(context, id, version)?;
        let transformation = Transformation::new(id.clone(), context, version, description);
        self.state.create(transformation.clone())?;
        if let Err(err) = self.entries.open(context, id) {
            self.state.delete(id)?;
            return Err(err);
        }
        info!(context, id = %id, version, "transformation started");
        Ok(transformation)
    }

    /// Records the deletion of the event at `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transformation is not active or the entry is
    /// rejected by the entry store.
    pub fn delete_event(&self, id: &TransformationId, token: Token, sequence: u64) -> CoreResult<u64> {
        let store = self.active_store(id)?;
        store.store(&TransformationEntry::delete(sequence, token)?)
    }

    /// Records the replacement of the event at `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transformation is not active or the entry is
    /// rejected by the entry store.
    pub fn replace_event(
        &self,
        id: &TransformationId,
        token: Token,
        event: Event,
        sequence: u64,
    ) -> CoreResult<u64> {
        let store = self.active_store(id)?;
        store.store(&TransformationEntry::replace(sequence, token, event)?)
    }

    /// Cancels a transformation.
    ///
    /// Before apply, the entry store and the record are deleted. While an
    /// apply runs, it is asked to stop and the record ends up CANCELLED.
    /// Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTransformationState`] once the
    /// transformation was applied, failed or rolled back.
    pub fn cancel(&self, id: &TransformationId) -> CoreResult<()> {
        let Some(transformation) = self.state.transformation(id)? else {
            return Ok(());
        };
        if let Some(flag) = self.in_flight.lock().flags.get(id) {
            info!(context = %transformation.context, id = %id, "cancelling running apply");
            flag.cancel();
            return Ok(());
        }
        match transformation.status {
            TransformationStatus::Active | TransformationStatus::Closed => {
                self.forget(&transformation.context, id)?;
                info!(context = %transformation.context, id = %id, "transformation cancelled");
                Ok(())
            }
            TransformationStatus::Applying => {
                self.state.set_status(id, TransformationStatus::Cancelled)
            }
            TransformationStatus::Cancelled => Ok(()),
            status => Err(CoreError::invalid_state(id, status, "ACTIVE, CLOSED or APPLYING")),
        }
    }

    /// Applies the pending edits of a transformation.
    ///
    /// A transformation that failed earlier resumes after its last checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ApplyInProgress`] if an apply already runs for the
    /// transformation or its context, an invalid-state error,
    /// [`CoreError::StaleVersion`] if another transformation of the context
    /// already wrote this version or a later one, or the error
    /// that made the apply fail (the record is then FAILED).
    pub fn apply(
        &self,
        id: &TransformationId,
        keep_old_versions: bool,
        applied_by: &str,
        applied_at: i64,
    ) -> CoreResult<ApplyReport> {
        let transformation = self.require(id)?;
        if !matches!(
            transformation.status,
            TransformationStatus::Active | TransformationStatus::Closed | TransformationStatus::Failed
        ) {
            return Err(CoreError::invalid_state(
                id,
                transformation.status,
                "ACTIVE, CLOSED or FAILED",
            ));
        }
        if transformation.status != TransformationStatus::Failed {
            self.check_version(&transformation.context, id, transformation.version)?;
        }
        let slot = self.reserve(&transformation)?;
        let store = self.entries.open(&transformation.context, id)?;

        let (Some(first), Some(last)) = (store.first_entry()?, store.last_entry()?) else {
            self.state.set_status(id, TransformationStatus::Closed)?;
            self.state.complete(id)?;
            info!(context = %transformation.context, id = %id, "nothing to apply");
            return Ok(ApplyReport::empty(id));
        };
        let start = ApplyStart {
            keep_old_versions,
            applied_by: applied_by.to_string(),
            applied_at,
            first_event_token: first.op()?.token(),
            last_event_token: last.op()?.token(),
        };
        self.state.prepare_apply(id, &start)?;
        self.state.set_status(id, TransformationStatus::Applying)?;
        let transformation = self.require(id)?;
        let after = self.state.progress(id)?.map(|p| p.last_token_applied);
        self.run_apply(&transformation, &store, after, &slot)
    }

    /// Resumes the apply interrupted by a restart, if there is exactly one for
    /// `context`.
    ///
    /// Returns `None` when there is nothing to resume, or when several
    /// candidates exist and none is picked.
    ///
    /// # Errors
    ///
    /// Returns the error that made the resumed apply fail.
    pub fn restart_apply(&self, context: &str) -> CoreResult<Option<ApplyReport>> {
        let mut candidates: Vec<_> = self
            .state
            .transformations(context)?
            .into_iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TransformationStatus::Closed | TransformationStatus::Applying
                )
            })
            .collect();
        if candidates.len() > 1 {
            warn!(context, count = candidates.len(), "several transformations to resume, none resumed");
            return Ok(None);
        }
        let Some(transformation) = candidates.pop() else {
            return Ok(None);
        };
        let id = &transformation.id;
        let slot = self.reserve(&transformation)?;
        let store = self.entries.open(context, id)?;
        let after = self.state.progress(id)?.map(|p| p.last_token_applied);
        info!(context, id = %id, after, "resuming transformation");

        if store.is_empty() {
            self.state.complete(id)?;
            return Ok(Some(ApplyReport::empty(id)));
        }
        if transformation.first_event_token.is_none() {
            let (Some(first), Some(last)) = (store.first_entry()?, store.last_entry()?) else {
                return Ok(None);
            };
            let start = ApplyStart {
                keep_old_versions: transformation.keep_old_versions,
                applied_by: transformation.applied_by.clone().unwrap_or_default(),
                applied_at: transformation.applied_at.unwrap_or_default(),
                first_event_token: first.op()?.token(),
                last_event_token: last.op()?.token(),
            };
            self.state.prepare_apply(id, &start)?;
        }
        self.state.set_status(id, TransformationStatus::Applying)?;
        let transformation = self.require(id)?;
        self.run_apply(&transformation, &store, after, &slot).map(Some)
    }

    /// Removes the segment versions a transformation superseded.
    ///
    /// # Errors
    ///
    /// Returns an error unless the transformation belongs to `context` and
    /// was applied.
    pub fn delete_old_versions(&self, context: &str, id: &TransformationId) -> CoreResult<usize> {
        let transformation = self.require_in(context, id)?;
        if transformation.status != TransformationStatus::Applied {
            return Err(CoreError::invalid_state(id, transformation.status, "APPLIED"));
        }
        let removed = self.store.delete_old_versions(context, transformation.version)?;
        info!(context, id = %id, removed, "old segment versions deleted");
        Ok(removed)
    }

    /// Reverts the segments a transformation rewrote and forgets it.
    ///
    /// Rolling back a transformation that is already gone returns zero. A
    /// rollback interrupted by a crash is picked up again from the segment
    /// versions on disk.
    ///
    /// # Errors
    ///
    /// Returns an error unless the transformation belongs to `context`, is
    /// APPLIED, CANCELLED, FAILED or ROLLING_BACK, and kept its old versions.
    /// If the store cannot roll back, the previous status is restored.
    pub fn rollback_transformation(&self, context: &str, id: &TransformationId) -> CoreResult<usize> {
        let Some(transformation) = self.state.transformation(id)? else {
            debug!(context, id = %id, "rollback of unknown transformation ignored");
            return Ok(0);
        };
        if transformation.context != context {
            return Err(CoreError::invalid_operation(format!(
                "transformation {id} belongs to context {}",
                transformation.context
            )));
        }
        let previous = transformation.status;
        if previous == TransformationStatus::RolledBack {
            self.forget(context, id)?;
            return Ok(0);
        }
        if !matches!(
            previous,
            TransformationStatus::Applied
                | TransformationStatus::Cancelled
                | TransformationStatus::Failed
                | TransformationStatus::RollingBack
        ) {
            return Err(CoreError::invalid_state(
                id,
                previous,
                "APPLIED, CANCELLED, FAILED or ROLLING_BACK",
            ));
        }
        if !transformation.keep_old_versions {
            return Err(CoreError::invalid_operation(format!(
                "transformation {id} did not keep old versions"
            )));
        }
        let _slot = self.reserve(&transformation)?;
        self.state.set_status(id, TransformationStatus::RollingBack)?;
        let reverted = match self.store.rollback_segments(context, transformation.version) {
            Ok(reverted) => reverted,
            Err(err) => {
                warn!(context, id = %id, error = %err, "rollback failed");
                self.state.set_status(id, previous)?;
                return Err(err);
            }
        };
        self.state.set_status(id, TransformationStatus::RolledBack)?;
        self.forget(context, id)?;
        info!(context, id = %id, reverted, "transformation rolled back");
        Ok(reverted)
    }

    /// Records of a context.
    ///
    /// # Errors
    ///
    /// Returns an error if the state manager fails.
    pub fn transformations(&self, context: &str) -> CoreResult<Vec<Transformation>> {
        self.state.transformations(context)
    }

    /// One record.
    ///
    /// # Errors
    ///
    /// Returns an error if the state manager fails.
    pub fn transformation(&self, id: &TransformationId) -> CoreResult<Option<Transformation>> {
        self.state.transformation(id)
    }

    /// Apply checkpoint of a transformation.
    ///
    /// # Errors
    ///
    /// Returns an error if the state manager fails.
    pub fn progress(&self, id: &TransformationId) -> CoreResult<Option<TransformationProgress>> {
        self.state.progress(id)
    }

    fn forget(&self, context: &str, id: &TransformationId) -> CoreResult<()> {
        self.entries.delete(context, id)?;
        self.state.delete(id)
    }

    /// Rejects `version` unless it is above the segment versions of the
    /// context and the versions of its other transformations that started
    /// applying.
    fn check_version(&self, context: &str, id: &TransformationId, version: u32) -> CoreResult<()> {
        let claimed = self
            .state
            .transformations(context)?
            .into_iter()
            .filter(|t| &t.id != id)
            .filter(|t| !matches!(t.status, TransformationStatus::Active | TransformationStatus::Closed))
            .map(|t| t.version)
            .max()
            .unwrap_or(0);
        let current = claimed.max(self.store.current_version(context)?);
        if version <= current {
            return Err(CoreError::StaleVersion {
                context: context.to_string(),
                version,
                current,
            });
        }
        Ok(())
    }

    fn require(&self, id: &TransformationId) -> CoreResult<Transformation> {
        self.state
            .transformation(id)?
            .ok_or_else(|| CoreError::transformation_not_found(id))
    }

    fn require_in(&self, context: &str, id: &TransformationId) -> CoreResult<Transformation> {
        let transformation = self.require(id)?;
        if transformation.context != context {
            return Err(CoreError::invalid_operation(format!(
                "transformation {id} belongs to context {}",
                transformation.context
            )));
        }
        Ok(transformation)
    }

    fn active_store(&self, id: &TransformationId) -> CoreResult<Arc<TransformationEntryStore>> {
        let transformation = self.require(id)?;
        if transformation.status != TransformationStatus::Active {
            return Err(CoreError::invalid_state(id, transformation.status, "ACTIVE"));
        }
        self.entries.open(&transformation.context, id)
    }

    fn reserve(&self, transformation: &Transformation) -> CoreResult<ApplySlot<'_>> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.flags.contains_key(&transformation.id) {
            return Err(CoreError::ApplyInProgress {
                key: transformation.id.to_string(),
            });
        }
        if in_flight.contexts.contains(&transformation.context) {
            return Err(CoreError::ApplyInProgress {
                key: transformation.context.clone(),
            });
        }
        let flag = CancelFlag::new();
        in_flight.flags.insert(transformation.id.clone(), flag.clone());
        in_flight.contexts.insert(transformation.context.clone());
        Ok(ApplySlot {
            in_flight: &self.in_flight,
            id: transformation.id.clone(),
            context: transformation.context.clone(),
            flag,
        })
    }

    fn run_apply(
        &self,
        transformation: &Transformation,
        store: &TransformationEntryStore,
        after: Option<Token>,
        slot: &ApplySlot<'_>,
    ) -> CoreResult<ApplyReport> {
        let id = &transformation.id;
        let context = transformation.context.as_str();
        let (Some(first), Some(last)) = (
            transformation.first_event_token,
            transformation.last_event_token,
        ) else {
            return Err(CoreError::invalid_operation(format!(
                "transformation {id} has no token range"
            )));
        };
        let from = after.map_or(first, |after| first.max(after.saturating_add(1)));
        let mut report = ApplyReport {
            transformation_id: id.clone(),
            first_token: Some(from),
            last_token: Some(last),
            events_transformed: 0,
            segments_rewritten: 0,
            outcome: ApplyOutcome::Applied,
        };
        if from > last {
            self.state.complete(id)?;
            info!(context, id = %id, "transformation already applied up to its last token");
            return Ok(report);
        }

        info!(context, id = %id, first = from, last, "applying transformation");
        let request = TransformRequest {
            context: context.to_string(),
            first_token: from,
            last_token: last,
            keep_old_versions: transformation.keep_old_versions,
            version: transformation.version,
        };
        let state = Arc::clone(&self.state);
        let mut progress = |token: Token| {
            debug!(context, id = %id, token, "transformation progress");
            state.set_progress(id, token)
        };
        let result = store
            .read()
            .and_then(|entries| EntryCursor::new(entries, after))
            .and_then(|mut cursor| {
                self.store
                    .transform_events(&request, &mut cursor, &mut progress, &slot.flag)
            });

        match result {
            Ok(summary) => {
                report.events_transformed = summary.events_transformed;
                report.segments_rewritten = summary.segments_rewritten;
                if summary.cancelled {
                    self.state.set_status(id, TransformationStatus::Cancelled)?;
                    report.outcome = ApplyOutcome::Cancelled;
                    info!(context, id = %id, "transformation apply cancelled");
                } else {
                    self.state.complete(id)?;
                    info!(
                        context,
                        id = %id,
                        events = summary.events_transformed,
                        segments = summary.segments_rewritten,
                        "transformation applied"
                    );
                }
                Ok(report)
            }
            Err(err) => {
                warn!(context, id = %id, error = %err, "transformation apply failed");
                if let Err(status_err) = self.state.set_status(id, TransformationStatus::Failed) {
                    warn!(context, id = %id, error = %status_err, "could not mark transformation failed");
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for TransformationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self.in_flight.lock();
        f.debug_struct("TransformationProcessor")
            .field("applying", &in_flight.flags.len())
            .finish_non_exhaustive()
    }
}
