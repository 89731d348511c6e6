//! Entries command implementation.

use chronoshift_core::layout::entries_file;
use chronoshift_core::{EntryOp, StorageConfig, TransformationEntryStore, TransformationId};
use std::path::Path;

/// Runs the entries command.
pub fn run(
    root: &Path,
    context: &str,
    id: &str,
    from: u64,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = entries_file(root, context, &TransformationId::new(id));
    if !path.exists() {
        return Err(format!("No entries for transformation {id} at {path:?}").into());
    }
    let store = TransformationEntryStore::open(&path, &StorageConfig::default().sync_on_write(false))?;
    println!("Transformation {id}: {} entries", store.len());
    println!();

    for entry in store.read_from(from)?.take(limit.unwrap_or(usize::MAX)) {
        let entry = entry?;
        match entry.op()? {
            EntryOp::Delete { token } => {
                println!("[{:>6}] delete  token {token}", entry.sequence);
            }
            EntryOp::Replace { token, event } => {
                let payload = event
                    .payload
                    .as_ref()
                    .map_or("-", |p| p.payload_type.as_str());
                println!(
                    "[{:>6}] replace token {token} payload {payload} ({} metadata entries)",
                    entry.sequence,
                    event.metadata.len()
                );
            }
        }
    }
    Ok(())
}
