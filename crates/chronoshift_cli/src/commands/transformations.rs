//! Transformations command implementation.

use chronoshift_core::transformation::Transformation;
use chronoshift_core::{FileStateManager, TransformationStateManager};
use serde::Serialize;
use std::path::Path;

/// A transformation record and its apply checkpoint.
#[derive(Debug, Serialize)]
pub struct TransformationInfo {
    /// The record.
    #[serde(flatten)]
    pub transformation: Transformation,
    /// Last token whose segment was fully rewritten.
    pub last_token_applied: Option<u64>,
}

/// Runs the transformations command.
pub fn run(state_dir: &Path, context: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !state_dir.is_dir() {
        return Err(format!("No transformation records at {state_dir:?}").into());
    }
    let manager = FileStateManager::open(state_dir)?;
    let mut records = Vec::new();
    for transformation in manager.transformations(context)? {
        let last_token_applied = manager.progress(&transformation.id)?.map(|p| p.last_token_applied);
        records.push(TransformationInfo {
            transformation,
            last_token_applied,
        });
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => print_text_output(context, &records),
    }
    Ok(())
}

fn print_text_output(context: &str, records: &[TransformationInfo]) {
    println!("Chronoshift Transformations ({context})");
    println!("============================");
    println!();
    if records.is_empty() {
        println!("No transformations");
        return;
    }
    for info in records {
        let t = &info.transformation;
        println!("{} [{}] version {}", t.id, t.status, t.version);
        if !t.description.is_empty() {
            println!("  Description: {}", t.description);
        }
        if let (Some(first), Some(last)) = (t.first_event_token, t.last_event_token) {
            println!("  Tokens:      {first}..={last}");
        }
        if let Some(applied) = info.last_token_applied {
            println!("  Checkpoint:  {applied}");
        }
        if let Some(by) = &t.applied_by {
            println!("  Applied by:  {by} at {}", t.applied_at.unwrap_or_default());
        }
        println!("  Keeps old versions: {}", t.keep_old_versions);
    }
}
