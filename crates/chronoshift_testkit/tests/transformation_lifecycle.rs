//! End-to-end transformation scenarios over real segment files.

use chronoshift_core::layout::entries_file;
use chronoshift_core::transformation::{ApplyStart, TransformRequest, TransformedEvent};
use chronoshift_core::{
    ApplyOutcome, CancelFlag, CoreError, CoreResult, EntryOp, Event, EventStoreTransformer,
    EventTransformation, EventType, FileVersion, SerializedObject, Token, TransformationId,
    TransformationStateManager, TransformationStatus,
};
use chronoshift_testkit::prelude::*;
use std::fs::OpenOptions;
use std::io::Write;

/// Four segments of five single-event transactions: tokens 0..20, segments
/// 0, 5, 10 and 15, aggregates rotating over `agg-0..agg-3`.
fn four_segments() -> IntegrationHarness {
    let mut harness = IntegrationHarness::new();
    let mut sequences = [0u64; 3];
    for _ in 0..4 {
        let transactions: Vec<_> = (0..5)
            .map(|i| {
                let slot = i % 3;
                let event = sample_event(&format!("agg-{slot}"), sequences[slot]);
                sequences[slot] += 1;
                vec![event]
            })
            .collect();
        harness.append(&transactions);
    }
    harness
}

/// Tokens 0..160: one segment of 100 events, then three of 20.
fn one_hundred_sixty() -> IntegrationHarness {
    let mut harness = IntegrationHarness::new();
    let mut sequences = [0u64; 4];
    let mut token = 0usize;
    for size in [100, 20, 20, 20] {
        let transactions: Vec<_> = (0..size)
            .map(|_| {
                let slot = token % 4;
                let event = sample_event(&format!("agg-{slot}"), sequences[slot]);
                sequences[slot] += 1;
                token += 1;
                vec![event]
            })
            .collect();
        harness.append(&transactions);
    }
    harness
}

/// Deletes a fixed set of tokens and records every token it is offered.
struct RecordingEraser {
    targets: Vec<Token>,
    offered: Vec<Token>,
}

impl EventTransformation for RecordingEraser {
    fn transform(&mut self, event: &Event, token: Token) -> CoreResult<TransformedEvent> {
        self.offered.push(token);
        Ok(TransformedEvent {
            replacement: self.targets.contains(&token).then(|| event.nullified()),
            next_token: Some(token + 1),
        })
    }
}

fn replacement(note: &str) -> Event {
    Event::new("", 0, SerializedObject::new("Redacted", note.as_bytes().to_vec())).with_metadata("redacted", "true")
}

fn status_on_disk(engine: &TestEngine, id: &TransformationId) -> Option<String> {
    let path = engine.state_dir().join(format!("{id}.json"));
    let bytes = std::fs::read(path).ok()?;
    let record: serde_json::Value = serde_json::from_slice(&bytes).expect("record is JSON");
    record["transformation"]["status"].as_str().map(str::to_string)
}

#[test]
fn apply_rewrites_only_touched_segments() {
    let mut harness = four_segments();
    let engine = &harness.engine;
    let id = engine.start_transformation("redact");
    let edits = [
        EntryOp::Delete { token: 6 },
        EntryOp::Replace {
            token: 7,
            event: replacement("seven"),
        },
        EntryOp::Delete { token: 17 },
    ];
    for (sequence, op) in edits.iter().enumerate() {
        let stored = match op {
            EntryOp::Delete { token } => engine.processor.delete_event(&id, *token, sequence as u64),
            EntryOp::Replace { token, event } => {
                engine
                    .processor
                    .replace_event(&id, *token, event.clone(), sequence as u64)
            }
        };
        assert_eq!(stored.unwrap(), sequence as u64);
    }

    let report = engine.processor.apply(&id, false, "ops", 1_700_000_000_000).unwrap();
    assert_eq!(report.outcome, ApplyOutcome::Applied);
    assert_eq!(report.first_token, Some(6));
    assert_eq!(report.last_token, Some(17));
    assert_eq!(report.events_transformed, 3);
    assert_eq!(report.segments_rewritten, 2);

    assert_eq!(
        engine.segments().segments(EventType::Event),
        vec![
            FileVersion::new(0, 0),
            FileVersion::new(5, 1),
            FileVersion::new(10, 0),
            FileVersion::new(15, 1),
        ]
    );
    let record = engine.processor.transformation(&id).unwrap().unwrap();
    assert_eq!(record.status, TransformationStatus::Applied);
    assert_eq!(record.applied_by.as_deref(), Some("ops"));
    assert_eq!(status_on_disk(engine, &id).as_deref(), Some("APPLIED"));

    for op in &edits {
        harness.expect_edit(op);
    }
    harness.verify_all();
    harness.verify_aggregates();

    // The rewritten state and its indexes survive a restart
    let harness = harness.restart();
    harness.verify_all();
    harness.verify_aggregates();
}

#[test]
fn replay_of_token_range_modifies_only_targets() {
    let mut harness = one_hundred_sixty();
    let request = TransformRequest {
        context: "default".into(),
        first_token: 100,
        last_token: 150,
        keep_old_versions: false,
        version: 1,
    };
    let mut eraser = RecordingEraser {
        targets: vec![100, 101, 111],
        offered: Vec::new(),
    };
    let mut checkpoints = Vec::new();
    let summary = harness
        .engine
        .segments()
        .transform_events(
            &request,
            &mut eraser,
            &mut |token| {
                checkpoints.push(token);
                Ok(())
            },
            &CancelFlag::new(),
        )
        .unwrap();

    assert_eq!(eraser.offered, (100..=150).collect::<Vec<Token>>());
    assert_eq!(summary.events_transformed, 3);
    assert_eq!(summary.segments_rewritten, 1);
    assert!(!summary.cancelled);
    assert_eq!(checkpoints, vec![119, 139, 150]);
    assert_eq!(
        harness.engine.segments().segments(EventType::Event),
        vec![
            FileVersion::new(0, 0),
            FileVersion::new(100, 1),
            FileVersion::new(120, 0),
            FileVersion::new(140, 0),
        ]
    );

    for token in [100, 101, 111] {
        harness.expect_edit(&EntryOp::Delete { token });
    }
    harness.verify_all();
    harness.verify_aggregates();
}

#[test]
fn second_transformation_needs_a_newer_version() {
    let mut harness = four_segments();
    let engine = &harness.engine;
    let first = engine.start_transformation("first");
    engine.processor.delete_event(&first, 0, 0).unwrap();
    engine.processor.apply(&first, false, "ops", 0).unwrap();

    let second = TransformationId::generate();
    assert!(matches!(
        engine.processor.start("default", &second, 1, "same version"),
        Err(CoreError::StaleVersion { version: 1, current: 1, .. })
    ));

    let second = engine.start_version("default", 2, "next version");
    engine.processor.delete_event(&second, 1, 0).unwrap();
    let report = engine.processor.apply(&second, false, "ops", 0).unwrap();
    assert_eq!(report.events_transformed, 1);
    assert_eq!(engine.segments().segments(EventType::Event)[0], FileVersion::new(0, 2));
    assert!(engine.event(1).unwrap().payload.is_none());

    harness.expect_edit(&EntryOp::Delete { token: 0 });
    harness.expect_edit(&EntryOp::Delete { token: 1 });
    harness.verify_all();
    harness.verify_aggregates();
}

#[test]
fn repeated_and_interrupted_rollbacks_complete() {
    let harness = four_segments();
    let engine = &harness.engine;
    let id = engine.start_transformation("undo");
    engine.processor.delete_event(&id, 2, 0).unwrap();
    engine.processor.delete_event(&id, 12, 1).unwrap();
    engine.processor.apply(&id, true, "ops", 0).unwrap();

    // A crash after the segments were reverted leaves ROLLING_BACK behind
    engine.state.set_status(&id, TransformationStatus::RollingBack).unwrap();
    engine.segments().rollback_segments("default", 1).unwrap();
    let harness = harness.restart();
    let engine = &harness.engine;
    assert_eq!(status_on_disk(engine, &id).as_deref(), Some("ROLLING_BACK"));

    assert_eq!(engine.processor.rollback_transformation("default", &id).unwrap(), 0);
    assert!(engine.processor.transformation(&id).unwrap().is_none());
    assert_eq!(engine.processor.rollback_transformation("default", &id).unwrap(), 0);
    harness.verify_all();
    harness.verify_aggregates();
}

#[test]
fn rollback_restores_kept_versions() {
    let harness = four_segments();
    let engine = &harness.engine;
    let id = engine.start_transformation("mistake");
    engine.processor.delete_event(&id, 2, 0).unwrap();
    engine.processor.delete_event(&id, 12, 1).unwrap();
    engine.processor.apply(&id, true, "ops", 0).unwrap();
    assert!(engine.event(2).unwrap().payload.is_none());

    let reverted = engine.processor.rollback_transformation("default", &id).unwrap();
    assert_eq!(reverted, 2);
    assert!(engine.processor.transformation(&id).unwrap().is_none());
    assert_eq!(status_on_disk(engine, &id), None);
    assert!(!entries_file(&engine.root(), "default", &id).exists());
    assert!(engine
        .segments()
        .segments(EventType::Event)
        .iter()
        .all(|v| v.version == 0));

    harness.verify_all();
    harness.verify_aggregates();
}

#[test]
fn deleted_old_versions_cannot_be_rolled_back() {
    let harness = four_segments();
    let engine = &harness.engine;
    let id = engine.start_transformation("final");
    engine.processor.delete_event(&id, 3, 0).unwrap();
    engine.processor.apply(&id, true, "ops", 0).unwrap();

    assert_eq!(engine.processor.delete_old_versions("default", &id).unwrap(), 1);
    let err = engine.processor.rollback_transformation("default", &id).unwrap_err();
    assert!(matches!(err, CoreError::RollbackUnavailable { .. }));
    assert_eq!(
        engine.processor.transformation(&id).unwrap().unwrap().status,
        TransformationStatus::Applied
    );
}

#[test]
fn restart_resumes_after_last_checkpoint() {
    let mut harness = IntegrationHarness::new();
    scenarios::two_segments(&harness.engine);
    harness.adopt_existing();

    let engine = &harness.engine;
    let id = engine.start_transformation("interrupted");
    engine.processor.delete_event(&id, 1, 0).unwrap();
    engine.processor.delete_event(&id, 4, 1).unwrap();

    // Segment 0 is rewritten and checkpointed, then the process dies
    engine
        .state
        .prepare_apply(
            &id,
            &ApplyStart {
                keep_old_versions: true,
                applied_by: "ops".into(),
                applied_at: 0,
                first_event_token: 1,
                last_event_token: 4,
            },
        )
        .unwrap();
    engine.state.set_status(&id, TransformationStatus::Applying).unwrap();
    let request = TransformRequest {
        context: "default".into(),
        first_token: 1,
        last_token: 2,
        keep_old_versions: true,
        version: 1,
    };
    let state = engine.state.clone();
    engine
        .segments()
        .transform_events(
            &request,
            &mut TokenEraser::new([1]),
            &mut |token| state.set_progress(&id, token),
            &CancelFlag::new(),
        )
        .unwrap();
    assert_eq!(engine.processor.progress(&id).unwrap().unwrap().last_token_applied, 2);

    let mut harness = harness.restart();
    let engine = &harness.engine;
    let report = engine.processor.restart_apply("default").unwrap().unwrap();
    assert_eq!(report.outcome, ApplyOutcome::Applied);
    assert_eq!(report.segments_rewritten, 1);
    assert_eq!(report.events_transformed, 1);
    assert_eq!(
        engine.processor.transformation(&id).unwrap().unwrap().status,
        TransformationStatus::Applied
    );
    assert_eq!(
        engine.segments().segments(EventType::Event),
        vec![FileVersion::new(0, 1), FileVersion::new(3, 1)]
    );

    harness.expect_edit(&EntryOp::Delete { token: 1 });
    harness.expect_edit(&EntryOp::Delete { token: 4 });
    harness.verify_all();
    harness.verify_aggregates();

    // Nothing left to resume
    assert!(harness.engine.processor.restart_apply("default").unwrap().is_none());
}

#[test]
fn cancel_before_apply_discards_edits() {
    let harness = four_segments();
    let engine = &harness.engine;
    let id = engine.start_transformation("abandoned");
    engine.processor.delete_event(&id, 1, 0).unwrap();
    let path = entries_file(&engine.root(), "default", &id);
    assert!(path.exists());

    engine.processor.cancel(&id).unwrap();
    assert!(engine.processor.transformation(&id).unwrap().is_none());
    assert!(!path.exists());
    harness.verify_all();
}

#[test]
fn empty_transformation_applies_nothing() {
    let harness = four_segments();
    let engine = &harness.engine;
    let id = engine.start_transformation("noop");
    let report = engine.processor.apply(&id, false, "ops", 0).unwrap();
    assert_eq!(report.outcome, ApplyOutcome::Empty);
    assert_eq!(report.segments_rewritten, 0);
    assert_eq!(
        engine.processor.transformation(&id).unwrap().unwrap().status,
        TransformationStatus::Applied
    );
    assert!(engine
        .segments()
        .segments(EventType::Event)
        .iter()
        .all(|v| v.version == 0));
}

#[test]
fn validation_checks_stored_events() {
    let harness = four_segments();
    let engine = &harness.engine;
    let validating = engine.validating();
    let id = engine.start_transformation("validated");

    let err = validating.delete_event("default", &id, 99, 0).unwrap_err();
    assert_eq!(err.to_string(), "validation failed: trying to delete non-existing event 99");

    let stored = engine.event(4).unwrap();
    let mut wrong = stored.clone();
    wrong.aggregate_sequence_number += 1;
    assert!(matches!(
        validating.replace_event("default", &id, 4, wrong, 0),
        Err(CoreError::Validation { .. })
    ));

    let mut update = stored.clone();
    update.payload = Some(SerializedObject::new("Redacted", Vec::new()));
    assert_eq!(validating.replace_event("default", &id, 4, update, 0).unwrap(), 0);
}

#[test]
fn torn_entry_log_is_repaired_on_restart() {
    let harness = four_segments();
    let id = harness.engine.start_transformation("torn");
    harness.engine.processor.delete_event(&id, 1, 0).unwrap();

    // A crash in the middle of the second append leaves half a record
    let path = entries_file(&harness.engine.root(), "default", &id);
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[9, 0, 0, 0, 1, 1, 0]).unwrap();
    drop(file);

    let harness = harness.restart();
    let engine = &harness.engine;
    engine.processor.delete_event(&id, 2, 1).unwrap();
    let store = engine.entries.open("default", &id).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(
        store.last_entry().unwrap().unwrap().op().unwrap(),
        EntryOp::Delete { token: 2 }
    );

    let report = engine.processor.apply(&id, false, "ops", 0).unwrap();
    assert_eq!(report.events_transformed, 2);
}

#[test]
fn contexts_are_independent() {
    let engine = TestEngine::new();
    engine
        .context("billing")
        .append_segment(EventType::Event, &[vec![sample_event("invoice-1", 0)]])
        .unwrap();
    scenarios::two_segments(&engine);

    let id = engine.start_version("billing", 1, "billing only");
    engine.processor.delete_event(&id, 0, 0).unwrap();
    engine.processor.apply(&id, false, "ops", 0).unwrap();

    assert!(engine.context("billing").event(0).unwrap().unwrap().payload.is_none());
    assert!(engine.event(0).unwrap().payload.is_some());
    assert!(engine.processor.transformations("default").unwrap().is_empty());
    assert_eq!(engine.processor.transformations("billing").unwrap().len(), 1);
}
