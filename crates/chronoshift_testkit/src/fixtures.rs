//! Test fixtures and engine helpers.
//!
//! A [`TestEngine`] wires a [`LocalEventStore`], a [`FileStateManager`], an
//! [`EntryStoreRegistry`] and a [`TransformationProcessor`] over one
//! temporary directory, the way a server process would. Dropping every
//! handle and reopening the same directory is how tests simulate a restart.

use chronoshift_core::transformation::TransformedEvent;
use chronoshift_core::{
    CoreResult, EntryStoreRegistry, Event, EventTransformation, EventType, FileStateManager,
    LocalEventStore, SegmentStore, SerializedObject, StorageConfig, Token, TransformationId,
    TransformationProcessor, ValidatingTransformer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Context used by fixtures that do not name one.
pub const DEFAULT_CONTEXT: &str = "default";

/// Payload type of the events built by [`sample_event`].
pub const SAMPLE_PAYLOAD_TYPE: &str = "SampleEvent";

/// A complete engine in a temporary directory.
pub struct TestEngine {
    /// The transformation processor.
    pub processor: Arc<TransformationProcessor>,
    /// Pending edit logs.
    pub entries: Arc<EntryStoreRegistry>,
    /// Durable transformation records.
    pub state: Arc<FileStateManager>,
    /// The segment stores of all contexts.
    pub store: Arc<LocalEventStore>,
    config: StorageConfig,
    temp_dir: TempDir,
}

impl TestEngine {
    /// Creates an engine with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates an engine with a custom configuration.
    pub fn with_config(config: StorageConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self::open(temp_dir, config)
    }

    fn open(temp_dir: TempDir, config: StorageConfig) -> Self {
        let root = temp_dir.path().join("events");
        let store = Arc::new(LocalEventStore::new(&root, config.clone()));
        let state = Arc::new(
            FileStateManager::open(temp_dir.path().join("state"))
                .expect("Failed to open transformation records"),
        );
        let entries = Arc::new(EntryStoreRegistry::new(&root, config.clone()));
        let processor = Arc::new(TransformationProcessor::new(
            state.clone(),
            store.clone(),
            entries.clone(),
        ));
        Self {
            processor,
            entries,
            state,
            store,
            config,
            temp_dir,
        }
    }

    /// Drops every handle and reopens the same directory.
    ///
    /// Context locks are released and reacquired, records and entry logs are
    /// reloaded from disk, and the segment indexes are recovered.
    #[must_use]
    pub fn restart(self) -> Self {
        let Self {
            processor,
            entries,
            state,
            store,
            config,
            temp_dir,
        } = self;
        drop(processor);
        drop(entries);
        drop(state);
        drop(store);
        Self::open(temp_dir, config)
    }

    /// Root of the segment store.
    pub fn root(&self) -> PathBuf {
        self.temp_dir.path().join("events")
    }

    /// Directory of the transformation records.
    pub fn state_dir(&self) -> PathBuf {
        self.temp_dir.path().join("state")
    }

    /// The configuration the engine was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The segment store of [`DEFAULT_CONTEXT`].
    pub fn segments(&self) -> Arc<SegmentStore> {
        self.context(DEFAULT_CONTEXT)
    }

    /// The segment store of a context, opened on first use.
    pub fn context(&self, context: &str) -> Arc<SegmentStore> {
        self.store.context(context).expect("Failed to open context")
    }

    /// Appends one segment of transactions to the default context and
    /// returns the token of its first event.
    pub fn append(&self, transactions: &[Vec<Event>]) -> Token {
        self.segments()
            .append_segment(EventType::Event, transactions)
            .expect("Failed to append segment")
            .segment
    }

    /// Starts a version 1 transformation on the default context.
    pub fn start_transformation(&self, description: &str) -> TransformationId {
        self.start_version(DEFAULT_CONTEXT, 1, description)
    }

    /// Starts a transformation producing `version` on `context`.
    pub fn start_version(&self, context: &str, version: u32, description: &str) -> TransformationId {
        let id = TransformationId::generate();
        self.processor
            .start(context, &id, version, description)
            .expect("Failed to start transformation");
        id
    }

    /// A validating front end over this engine's processor.
    pub fn validating(&self) -> ValidatingTransformer {
        ValidatingTransformer::new(self.processor.clone(), self.store.clone())
    }

    /// Reads the event at `token` of the default context.
    pub fn event(&self, token: Token) -> Option<Event> {
        self.segments().event(token).expect("Failed to read event")
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for tests: no fsync, fast sweeps.
pub fn test_config() -> StorageConfig {
    StorageConfig::default()
        .sync_on_write(false)
        .cleanup_interval(std::time::Duration::from_millis(50))
        .close_grace_period(std::time::Duration::from_millis(10))
}

/// An aggregate event whose payload names the aggregate and sequence.
pub fn sample_event(aggregate: &str, sequence: u64) -> Event {
    Event::new(
        aggregate,
        sequence,
        SerializedObject::new(SAMPLE_PAYLOAD_TYPE, format!("{aggregate}:{sequence}")),
    )
    .with_aggregate_type("Sample")
}

/// An event that belongs to no aggregate.
pub fn tick_event() -> Event {
    Event {
        payload: Some(SerializedObject::new("Tick", Vec::new())),
        ..Event::default()
    }
}

/// Runs a test with a fresh engine.
///
/// # Example
///
/// ```rust,ignore
/// use chronoshift_testkit::with_temp_engine;
///
/// #[test]
/// fn my_test() {
///     with_temp_engine(|engine| {
///         engine.append(&[vec![sample_event("a", 0)]]);
///     });
/// }
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::new();
    f(&engine)
}

/// Clears a fixed set of tokens.
///
/// Drives [`chronoshift_core::EventStoreTransformer`] directly, without an
/// entry store, e.g. to leave a partially rewritten store behind.
#[derive(Debug, Clone, Default)]
pub struct TokenEraser {
    tokens: Vec<Token>,
}

impl TokenEraser {
    /// Clears `tokens`.
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Self {
        let mut tokens: Vec<Token> = tokens.into_iter().collect();
        tokens.sort_unstable();
        tokens.dedup();
        Self { tokens }
    }
}

impl EventTransformation for TokenEraser {
    fn transform(&mut self, event: &Event, token: Token) -> CoreResult<TransformedEvent> {
        let replacement = self.tokens.binary_search(&token).is_ok().then(|| event.nullified());
        let next_token = self.tokens.iter().copied().find(|t| *t > token);
        Ok(TransformedEvent {
            replacement,
            next_token,
        })
    }
}

/// Prepared store contents.
pub mod scenarios {
    use super::*;

    /// Two segments in the default context.
    ///
    /// ```text
    /// segment 0: [a/0, a/1] [b/0]          tokens 0..=2
    /// segment 3: [a/2] [b/1, tick]         tokens 3..=5
    /// ```
    pub fn two_segments(engine: &TestEngine) {
        engine.append(&[
            vec![sample_event("a", 0), sample_event("a", 1)],
            vec![sample_event("b", 0)],
        ]);
        engine.append(&[
            vec![sample_event("a", 2)],
            vec![sample_event("b", 1), tick_event()],
        ]);
    }

    /// `segments` segments of `per_segment` single-event transactions,
    /// rotating over `aggregates` aggregates. Returns the next free token.
    pub fn many_segments(engine: &TestEngine, segments: usize, per_segment: usize, aggregates: usize) -> Token {
        let mut sequences = vec![0u64; aggregates.max(1)];
        let mut next = 0;
        for _ in 0..segments {
            let transactions: Vec<Vec<Event>> = (0..per_segment)
                .map(|i| {
                    let slot = i % sequences.len();
                    let event = sample_event(&format!("agg-{slot}"), sequences[slot]);
                    sequences[slot] += 1;
                    vec![event]
                })
                .collect();
            engine.append(&transactions);
            next += per_segment as Token;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_segments_layout() {
        let engine = TestEngine::new();
        scenarios::two_segments(&engine);
        let store = engine.segments();
        assert_eq!(store.next_token(EventType::Event), 6);
        assert_eq!(store.segments(EventType::Event).len(), 2);
        assert!(engine.event(5).unwrap().aggregate_identifier.is_empty());
    }

    #[test]
    fn test_many_segments_rotates_aggregates() {
        let engine = TestEngine::new();
        let next = scenarios::many_segments(&engine, 3, 4, 2);
        assert_eq!(next, 12);
        let store = engine.segments();
        assert_eq!(store.last_sequence_number("agg-0").unwrap(), Some(5));
        assert_eq!(store.last_sequence_number("agg-1").unwrap(), Some(5));
    }

    #[test]
    fn test_restart_keeps_segments_and_records() {
        let engine = TestEngine::new();
        scenarios::two_segments(&engine);
        let id = engine.start_transformation("restart");
        engine.processor.delete_event(&id, 1, 0).unwrap();

        let engine = engine.restart();
        assert_eq!(engine.segments().next_token(EventType::Event), 6);
        assert!(engine.processor.transformation(&id).unwrap().is_some());
        assert_eq!(engine.entries.open(DEFAULT_CONTEXT, &id).unwrap().len(), 1);
    }

    #[test]
    fn test_token_eraser_hints_next_token() {
        let mut eraser = TokenEraser::new([4, 1, 4]);
        let event = sample_event("a", 0);
        let first = eraser.transform(&event, 0).unwrap();
        assert!(first.replacement.is_none());
        assert_eq!(first.next_token, Some(1));
        let hit = eraser.transform(&event, 1).unwrap();
        assert!(hit.replacement.unwrap().payload.is_none());
        assert_eq!(hit.next_token, Some(4));
        assert_eq!(eraser.transform(&event, 4).unwrap().next_token, None);
    }
}
