//! Property-based test generators using proptest.
//!
//! Provides strategies for events, transactions and edit logs that keep the
//! invariants the engine relies on: edit logs target strictly increasing
//! tokens, and every transaction holds at least one event.

use chronoshift_core::{EntryOp, Event, SerializedObject, Token};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for aggregate identifiers.
pub fn aggregate_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}-[0-9]{1,4}").expect("Invalid regex")
}

/// Strategy for serialized payloads.
pub fn payload_strategy() -> impl Strategy<Value = SerializedObject> {
    (
        prop::string::string_regex("[A-Z][A-Za-z]{0,15}").expect("Invalid regex"),
        prop::collection::vec(any::<u8>(), 0..256),
    )
        .prop_map(|(payload_type, data)| SerializedObject::new(payload_type, data))
}

/// Strategy for metadata maps.
pub fn metadata_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,10}").expect("Invalid regex"),
        prop::string::string_regex("[ -~]{0,20}").expect("Invalid regex"),
        0..4,
    )
}

/// Strategy for aggregate events.
pub fn event_strategy() -> impl Strategy<Value = Event> {
    (
        aggregate_id_strategy(),
        0u64..1_000,
        payload_strategy(),
        metadata_strategy(),
        any::<i64>(),
    )
        .prop_map(|(aggregate, sequence, payload, metadata, timestamp)| {
            let mut event = Event::new(aggregate, sequence, payload).with_timestamp(timestamp);
            event.metadata = metadata;
            event
        })
}

/// Strategy for one non-empty transaction.
pub fn transaction_strategy(max_events: usize) -> impl Strategy<Value = Vec<Event>> {
    prop::collection::vec(event_strategy(), 1..=max_events.max(1))
}

/// Strategy for the transactions of one segment.
pub fn segment_strategy(max_transactions: usize, max_events: usize) -> impl Strategy<Value = Vec<Vec<Event>>> {
    prop::collection::vec(transaction_strategy(max_events), 1..=max_transactions.max(1))
}

/// Strategy for one edit of `token`.
pub fn edit_strategy(token: Token) -> impl Strategy<Value = EntryOp> {
    prop_oneof![
        Just(EntryOp::Delete { token }),
        (payload_strategy(), metadata_strategy()).prop_map(move |(payload, metadata)| {
            let mut event = Event::new("", 0, payload);
            event.metadata = metadata;
            EntryOp::Replace { token, event }
        }),
    ]
}

/// Strategy for an edit log of up to `max_len` edits over tokens below
/// `max_token`, in strictly increasing token order.
pub fn edit_log_strategy(max_token: Token, max_len: usize) -> impl Strategy<Value = Vec<EntryOp>> {
    prop::collection::btree_set(0..max_token.max(1), 0..=max_len)
        .prop_flat_map(|tokens| tokens.into_iter().map(edit_strategy).collect::<Vec<_>>())
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronoshift_core::{StorageConfig, TransformationEntry, TransformationEntryStore};

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn edit_logs_have_increasing_tokens(ops in edit_log_strategy(500, 20)) {
            prop_assert!(ops.windows(2).all(|w| w[0].token() < w[1].token()));
        }

        #[test]
        fn entry_store_keeps_edit_log(ops in edit_log_strategy(500, 20)) {
            let store = TransformationEntryStore::in_memory(&StorageConfig::default());
            for (sequence, op) in ops.iter().enumerate() {
                store.store(&TransformationEntry::new(sequence as u64, op).unwrap()).unwrap();
            }
            let read: Vec<_> = store.read().unwrap().map(|e| e.unwrap()).collect();
            prop_assert_eq!(read.len(), ops.len());
            for (i, (entry, op)) in read.iter().zip(&ops).enumerate() {
                prop_assert_eq!(entry.sequence, i as u64);
                prop_assert_eq!(&entry.op().unwrap(), op);
            }
        }

        #[test]
        fn applied_edits_keep_aggregate_identity(
            original in event_strategy(),
            op in edit_strategy(7),
        ) {
            let edited = op.apply(&original);
            prop_assert_eq!(&edited.aggregate_identifier, &original.aggregate_identifier);
            prop_assert_eq!(edited.aggregate_sequence_number, original.aggregate_sequence_number);
            prop_assert_eq!(edited.timestamp, original.timestamp);
            match op {
                EntryOp::Delete { .. } => {
                    prop_assert!(edited.payload.is_none());
                }
                EntryOp::Replace { event, .. } => {
                    prop_assert_eq!(edited.payload, event.payload);
                }
            }
        }

        #[test]
        fn transactions_are_never_empty(segment in segment_strategy(4, 3)) {
            prop_assert!(segment.iter().all(|t| !t.is_empty()));
        }
    }
}
