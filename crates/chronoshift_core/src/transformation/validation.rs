//! Checks edits against the stored events before they are accepted.

use super::event_store::EventProvider;
use super::processor::TransformationProcessor;
use crate::error::{CoreError, CoreResult};
use crate::event::Event;
use crate::types::{Token, TransformationId};
use std::sync::Arc;
use tracing::warn;

/// Rejects edits that target missing events or change an event's identity.
///
/// A delete needs an event at its token. A replacement needs one with the
/// same aggregate identifier and sequence number.
pub struct ValidatingTransformer {
    processor: Arc<TransformationProcessor>,
    events: Arc<dyn EventProvider>,
}

impl ValidatingTransformer {
    /// Wraps a processor.
    pub fn new(processor: Arc<TransformationProcessor>, events: Arc<dyn EventProvider>) -> Self {
        Self { processor, events }
    }

    /// The wrapped processor.
    #[must_use]
    pub fn processor(&self) -> &TransformationProcessor {
        &self.processor
    }

    /// Validates and records a delete.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if no event exists at `token`, or any
    /// error of [`TransformationProcessor::delete_event`].
    pub fn delete_event(
        &self,
        context: &str,
        id: &TransformationId,
        token: Token,
        sequence: u64,
    ) -> CoreResult<u64> {
        if self.events.event_at(context, token)?.is_none() {
            warn!(context, token, "invalid token to delete");
            return Err(CoreError::validation(format!(
                "trying to delete non-existing event {token}"
            )));
        }
        self.processor.delete_event(id, token, sequence)
    }

    /// Validates and records a replacement.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if the replacement does not match the
    /// stored event's identity, or any error of
    /// [`TransformationProcessor::replace_event`].
    pub fn replace_event(
        &self,
        context: &str,
        id: &TransformationId,
        token: Token,
        event: Event,
        sequence: u64,
    ) -> CoreResult<u64> {
        let Some(original) = self.events.event_at(context, token)? else {
            warn!(context, token, "invalid event to replace");
            return Err(CoreError::validation(format!("event not found: {token}")));
        };
        if original.aggregate_sequence_number != event.aggregate_sequence_number {
            return Err(CoreError::validation(format!(
                "invalid aggregate sequence number: {}, expecting {}",
                event.aggregate_sequence_number, original.aggregate_sequence_number
            )));
        }
        if original.aggregate_identifier != event.aggregate_identifier {
            return Err(CoreError::validation(format!(
                "invalid aggregate identifier: {}, expecting {}",
                event.aggregate_identifier, original.aggregate_identifier
            )));
        }
        self.processor.replace_event(id, token, event, sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::event::SerializedObject;
    use crate::transformation::event_store::{
        CancelFlag, EventStoreTransformer, EventTransformation, TransformRequest, TransformSummary,
    };
    use crate::transformation::registry::EntryStoreRegistry;
    use crate::transformation::state::InMemoryStateManager;
    use std::collections::HashMap;

    struct Events(HashMap<Token, Event>);

    impl EventProvider for Events {
        fn event_at(&self, _context: &str, token: Token) -> CoreResult<Option<Event>> {
            Ok(self.0.get(&token).cloned())
        }
    }

    struct Unused;

    impl EventStoreTransformer for Unused {
        fn transform_events(
            &self,
            _request: &TransformRequest,
            _transformation: &mut dyn EventTransformation,
            _progress: &mut dyn FnMut(Token) -> CoreResult<()>,
            _cancel: &CancelFlag,
        ) -> CoreResult<TransformSummary> {
            Ok(TransformSummary::default())
        }

        fn current_version(&self, _context: &str) -> CoreResult<u32> {
            Ok(0)
        }

        fn delete_old_versions(&self, _context: &str, _version: u32) -> CoreResult<usize> {
            Ok(0)
        }

        fn rollback_segments(&self, _context: &str, _version: u32) -> CoreResult<usize> {
            Ok(0)
        }
    }

    fn setup() -> (ValidatingTransformer, TransformationId) {
        let processor = Arc::new(TransformationProcessor::new(
            Arc::new(InMemoryStateManager::new()),
            Arc::new(Unused),
            Arc::new(EntryStoreRegistry::in_memory(StorageConfig::default())),
        ));
        let id = TransformationId::new("t");
        processor.start("default", &id, 1, "").unwrap();
        let stored = Event::new("order-1", 3, SerializedObject::new("Placed", vec![1]));
        let events = Events(HashMap::from([(7, stored)]));
        (ValidatingTransformer::new(processor, Arc::new(events)), id)
    }

    #[test]
    fn delete_requires_existing_event() {
        let (validator, id) = setup();
        assert!(matches!(
            validator.delete_event("default", &id, 8, 0),
            Err(CoreError::Validation { .. })
        ));
        assert_eq!(validator.delete_event("default", &id, 7, 0).unwrap(), 0);
    }

    #[test]
    fn replace_must_keep_identity() {
        let (validator, id) = setup();
        let payload = SerializedObject::new("Placed", vec![2]);

        let wrong_seq = Event::new("order-1", 4, payload.clone());
        let err = validator.replace_event("default", &id, 7, wrong_seq, 0).unwrap_err();
        assert!(err.to_string().contains("invalid aggregate sequence number: 4, expecting 3"));

        let wrong_agg = Event::new("order-2", 3, payload.clone());
        assert!(validator.replace_event("default", &id, 7, wrong_agg, 0).is_err());

        let missing = Event::new("order-1", 3, payload.clone());
        assert!(validator.replace_event("default", &id, 9, missing, 0).is_err());

        let good = Event::new("order-1", 3, payload);
        assert_eq!(validator.replace_event("default", &id, 7, good, 0).unwrap(), 0);
        assert_eq!(validator.processor().transformations("default").unwrap().len(), 1);
    }
}
