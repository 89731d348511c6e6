//! Verify command implementation.

use super::EVENT_TYPES;
use chronoshift_core::index::{IndexMode, PersistedBloomFilter, SegmentIndex};
use chronoshift_core::{EventType, FileVersion, SegmentLayout, SegmentReader, Token};
use std::path::Path;
use tracing::debug;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of segment versions checked.
    pub segments_checked: usize,
    /// Number of events read.
    pub events_checked: usize,
    /// Number of index entries resolved against the data file.
    pub index_entries_checked: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(root: &Path, context: &str, all_versions: bool) -> Result<(), Box<dyn std::error::Error>> {
    let dir = root.join(context);
    if !dir.is_dir() {
        return Err(format!("No context {context:?} found at {root:?}").into());
    }
    println!("Verifying context {context:?} at {root:?}");
    println!();

    let mut ok = true;
    for event_type in EVENT_TYPES {
        let layout = SegmentLayout::new(&dir, event_type);
        let result = verify_family(&layout, all_versions)?;
        print_result(event_type, &result);
        ok &= result.is_ok();
    }

    println!();
    if ok {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    }
}

fn verify_family(layout: &SegmentLayout, all_versions: bool) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    let mut expected_start: Option<Token> = None;

    for (segment, versions) in layout.data_versions()? {
        let Some(&current) = versions.last() else {
            continue;
        };
        let checked: Vec<u32> = if all_versions { versions.clone() } else { vec![current] };
        for version in checked {
            let file_version = FileVersion::new(segment, version);
            debug!(%file_version, "checking segment");
            result.segments_checked += 1;
            match verify_version(layout, file_version, &mut result) {
                Ok(next_token) if version == current => {
                    // Snapshot segments are sparse; only event segments chain
                    if layout.event_type() == EventType::Event {
                        if let Some(start) = expected_start {
                            if start != segment {
                                result.errors.push(format!(
                                    "segment {segment} does not follow the previous segment ending at {start}"
                                ));
                            }
                        }
                    }
                    expected_start = Some(next_token);
                }
                Ok(_) => {}
                Err(err) => result.errors.push(format!("{file_version}: {err}")),
            }
        }
    }
    Ok(result)
}

/// Checks one segment version and returns the token following its last event.
fn verify_version(
    layout: &SegmentLayout,
    file_version: FileVersion,
    result: &mut VerifyResult,
) -> Result<Token, Box<dyn std::error::Error>> {
    let reader = SegmentReader::open_file(&layout.data_file(file_version))?;
    let mut next_token = file_version.segment;
    let mut domain_events = 0usize;
    for stored in reader.events() {
        let stored = stored?;
        result.events_checked += 1;
        next_token = stored.token + 1;
        if stored.event.is_domain_event() {
            domain_events += 1;
        }
    }

    let index = SegmentIndex::open(&layout.index_file(file_version), file_version, IndexMode::Resident)?;
    let bloom = PersistedBloomFilter::load(&layout.bloom_file(file_version))?;
    let mut indexed = 0usize;
    for aggregate in index.aggregates() {
        if !bloom.might_contain(aggregate) {
            result
                .errors
                .push(format!("{file_version}: bloom filter does not contain {aggregate}"));
        }
        let Some(entries) = index.lookup(aggregate)? else {
            continue;
        };
        for entry in entries.entries() {
            indexed += 1;
            result.index_entries_checked += 1;
            let event = reader.read_event(u64::from(entry.position))?;
            if event.aggregate_identifier != aggregate
                || event.aggregate_sequence_number != entry.sequence_number
            {
                result.errors.push(format!(
                    "{file_version}: index entry {aggregate}/{} points at {}/{}",
                    entry.sequence_number, event.aggregate_identifier, event.aggregate_sequence_number
                ));
            }
        }
    }
    if indexed != domain_events {
        result.errors.push(format!(
            "{file_version}: {domain_events} aggregate events but {indexed} index entries"
        ));
    }
    Ok(next_token)
}

fn print_result(event_type: EventType, result: &VerifyResult) {
    println!("{event_type} segments:");
    println!("  Segments checked:      {}", result.segments_checked);
    println!("  Events checked:        {}", result.events_checked);
    println!("  Index entries checked: {}", result.index_entries_checked);
    if !result.errors.is_empty() {
        println!("  Errors:");
        for error in &result.errors {
            println!("    - {error}");
        }
    }
}
