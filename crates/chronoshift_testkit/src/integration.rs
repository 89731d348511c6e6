//! Cross-crate integration test helpers.
//!
//! [`IntegrationHarness`] remembers the expected content of every token it
//! appended, mirrors the edits a test schedules, and checks the store
//! against that model through both token reads and index lookups.

use crate::fixtures::TestEngine;
use chronoshift_core::{EntryOp, Event, EventType, Token};
use std::collections::BTreeMap;

/// A test harness tracking the expected event at every token of the
/// default context.
pub struct IntegrationHarness {
    /// The engine under test.
    pub engine: TestEngine,
    expected: BTreeMap<Token, Event>,
}

impl IntegrationHarness {
    /// Creates a harness over a fresh engine.
    pub fn new() -> Self {
        Self::with_engine(TestEngine::new())
    }

    /// Creates a harness over an empty engine.
    pub fn with_engine(engine: TestEngine) -> Self {
        Self {
            engine,
            expected: BTreeMap::new(),
        }
    }

    /// Appends a segment and tracks its events. Returns the first token.
    pub fn append(&mut self, transactions: &[Vec<Event>]) -> Token {
        let first = self.engine.segments().next_token(EventType::Event);
        let segment = self.engine.append(transactions);
        assert_eq!(segment, first, "segment must start at the next free token");
        for (offset, event) in transactions.iter().flatten().enumerate() {
            self.expected.insert(first + offset as Token, event.clone());
        }
        first
    }

    /// Tracks the events already in the store, e.g. appended by a scenario.
    pub fn adopt_existing(&mut self) {
        let store = self.engine.segments();
        for token in 0..store.next_token(EventType::Event) {
            let event = store
                .event(token)
                .expect("Failed to read event")
                .unwrap_or_else(|| panic!("no event at token {token}"));
            self.expected.insert(token, event);
        }
    }

    /// Mirrors an edit that the test expects to be applied.
    pub fn expect_edit(&mut self, op: &EntryOp) {
        let original = self
            .expected
            .get(&op.token())
            .unwrap_or_else(|| panic!("token {} is not tracked", op.token()));
        let edited = op.apply(original);
        self.expected.insert(op.token(), edited);
    }

    /// Restarts the engine, keeping the model.
    #[must_use]
    pub fn restart(self) -> Self {
        Self {
            engine: self.engine.restart(),
            expected: self.expected,
        }
    }

    /// Expected event at `token`.
    pub fn expected(&self, token: Token) -> Option<&Event> {
        self.expected.get(&token)
    }

    /// Checks every tracked token.
    pub fn verify_all(&self) {
        let store = self.engine.segments();
        for (token, expected) in &self.expected {
            let actual = store.event(*token).expect("Failed to read event");
            assert_eq!(actual.as_ref(), Some(expected), "event mismatch at token {token}");
        }
        let next = store.next_token(EventType::Event);
        assert!(
            store.event(next).expect("Failed to read event").is_none(),
            "unexpected event past the end"
        );
    }

    /// Checks every tracked aggregate through the index.
    pub fn verify_aggregates(&self) {
        let store = self.engine.segments();
        let mut aggregates: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
        for event in self.expected.values().filter(|e| e.is_domain_event()) {
            aggregates.entry(event.aggregate_identifier.as_str()).or_default().push(event);
        }
        for (aggregate, expected) in aggregates {
            let actual = store
                .read_aggregate(aggregate, 0, u64::MAX)
                .expect("Failed to read aggregate");
            let actual: Vec<&Event> = actual.iter().collect();
            assert_eq!(actual, expected, "aggregate {aggregate} mismatch");
            let last = expected.last().map(|e| e.aggregate_sequence_number);
            assert_eq!(
                store.last_sequence_number(aggregate).expect("Failed to read sequence"),
                last,
                "aggregate {aggregate} last sequence mismatch"
            );
        }
    }

    /// Number of tracked tokens.
    pub fn tracked_count(&self) -> usize {
        self.expected.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}
