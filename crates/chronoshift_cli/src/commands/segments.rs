//! Segments command implementation.

use super::EVENT_TYPES;
use chronoshift_core::{FileVersion, SegmentLayout};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// One version of a segment.
#[derive(Debug, Serialize)]
pub struct VersionInfo {
    /// Version number.
    pub version: u32,
    /// Data file size in bytes.
    pub data_size: u64,
    /// Whether the index file exists.
    pub has_index: bool,
    /// Whether the bloom filter file exists.
    pub has_bloom: bool,
}

/// One segment with every version present on disk.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// Segment family.
    pub event_type: String,
    /// Token of the first event.
    pub segment: u64,
    /// Versions, ascending.
    pub versions: Vec<VersionInfo>,
}

/// Runs the segments command.
pub fn run(root: &Path, context: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let dir = root.join(context);
    if !dir.is_dir() {
        return Err(format!("No context {context:?} found at {root:?}").into());
    }

    let mut segments = Vec::new();
    for event_type in EVENT_TYPES {
        let layout = SegmentLayout::new(&dir, event_type);
        for (segment, versions) in layout.data_versions()? {
            let versions = versions
                .into_iter()
                .map(|version| {
                    let file_version = FileVersion::new(segment, version);
                    VersionInfo {
                        version,
                        data_size: fs::metadata(layout.data_file(file_version)).map_or(0, |m| m.len()),
                        has_index: layout.index_file(file_version).exists(),
                        has_bloom: layout.bloom_file(file_version).exists(),
                    }
                })
                .collect();
            segments.push(SegmentInfo {
                event_type: event_type.to_string(),
                segment,
                versions,
            });
        }
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&segments)?);
        }
        _ => print_text_output(context, &segments),
    }
    Ok(())
}

fn print_text_output(context: &str, segments: &[SegmentInfo]) {
    println!("Chronoshift Segments ({context})");
    println!("=====================");
    println!();
    if segments.is_empty() {
        println!("No segments");
        return;
    }
    for info in segments {
        let versions: Vec<String> = info
            .versions
            .iter()
            .map(|v| {
                let mut flags = String::new();
                if !v.has_index {
                    flags.push_str(" no-index");
                }
                if !v.has_bloom {
                    flags.push_str(" no-bloom");
                }
                format!("v{} ({} bytes{flags})", v.version, v.data_size)
            })
            .collect();
        println!("  {:<8} {:>20}  {}", info.event_type, info.segment, versions.join(", "));
    }
}
