//! Transformation records, checkpoints and the managers that keep them.

use crate::error::{CoreError, CoreResult};
use crate::types::{Token, TransformationId};
use chronoshift_storage::fs::{remove_if_exists, write_durable};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lifecycle status of a transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformationStatus {
    /// Open for edits.
    Active,
    /// Closed for edits, apply about to start.
    Closed,
    /// Segments are being rewritten.
    Applying,
    /// All edits were applied.
    Applied,
    /// Apply failed; rewritten segments were kept.
    Failed,
    /// Cancelled while applying.
    Cancelled,
    /// Segments are being reverted to their previous versions.
    RollingBack,
    /// Segments were reverted.
    RolledBack,
}

impl TransformationStatus {
    /// Upper-case name, as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
            Self::Applying => "APPLYING",
            Self::Applied => "APPLIED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for TransformationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one transformation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transformation {
    /// Identifier.
    pub id: TransformationId,
    /// Context whose events are edited.
    pub context: String,
    /// Segment version the rewrite produces.
    pub version: u32,
    /// Free-form description.
    pub description: String,
    /// Current status.
    pub status: TransformationStatus,
    /// Who applied it.
    pub applied_by: Option<String>,
    /// When it was applied, in milliseconds since the epoch.
    pub applied_at: Option<i64>,
    /// Whether superseded segment versions are kept for rollback.
    pub keep_old_versions: bool,
    /// Token of the first pending edit, set when apply starts.
    pub first_event_token: Option<Token>,
    /// Token of the last pending edit, set when apply starts.
    pub last_event_token: Option<Token>,
}

impl Transformation {
    /// A new, active transformation.
    pub fn new(
        id: TransformationId,
        context: impl Into<String>,
        version: u32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id,
            context: context.into(),
            version,
            description: description.into(),
            status: TransformationStatus::Active,
            applied_by: None,
            applied_at: None,
            keep_old_versions: false,
            first_event_token: None,
            last_event_token: None,
        }
    }
}

/// Durable apply checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationProgress {
    /// Last token whose segment was fully rewritten.
    pub last_token_applied: Token,
}

/// Values recorded when a transformation is closed for apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyStart {
    /// Keep superseded segment versions.
    pub keep_old_versions: bool,
    /// Who applies.
    pub applied_by: String,
    /// When, in milliseconds since the epoch.
    pub applied_at: i64,
    /// Token of the first pending edit.
    pub first_event_token: Token,
    /// Token of the last pending edit.
    pub last_event_token: Token,
}

/// Persistence of transformation records and checkpoints.
pub trait TransformationStateManager: Send + Sync {
    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransformationExists`] for a duplicate id.
    fn create(&self, transformation: Transformation) -> CoreResult<()>;

    /// Fetches a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    fn transformation(&self, id: &TransformationId) -> CoreResult<Option<Transformation>>;

    /// All records of a context, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    fn transformations(&self, context: &str) -> CoreResult<Vec<Transformation>>;

    /// Removes a record and its checkpoint. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails.
    fn delete(&self, id: &TransformationId) -> CoreResult<()>;

    /// The apply checkpoint of a transformation.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be read.
    fn progress(&self, id: &TransformationId) -> CoreResult<Option<TransformationProgress>>;

    /// Changes the status.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransformationNotFound`] for an unknown id.
    fn set_status(&self, id: &TransformationId, status: TransformationStatus) -> CoreResult<()>;

    /// Closes the transformation for edits and records the apply parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransformationNotFound`] for an unknown id.
    fn prepare_apply(&self, id: &TransformationId, start: &ApplyStart) -> CoreResult<()>;

    /// Advances the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `token` is below the stored
    /// checkpoint.
    fn set_progress(&self, id: &TransformationId, token: Token) -> CoreResult<()>;

    /// Marks the transformation as applied.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransformationNotFound`] for an unknown id.
    fn complete(&self, id: &TransformationId) -> CoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Record {
    transformation: Transformation,
    progress: Option<TransformationProgress>,
}

/// Record table shared by both managers; `dir` enables persistence.
#[derive(Debug)]
struct Ledger {
    records: RwLock<BTreeMap<TransformationId, Record>>,
    dir: Option<PathBuf>,
}

impl Ledger {
    fn record_path(dir: &Path, id: &TransformationId) -> PathBuf {
        dir.join(format!("{id}.json"))
    }

    fn persist(&self, record: &Record) -> CoreResult<()> {
        if let Some(dir) = &self.dir {
            let path = Self::record_path(dir, &record.transformation.id);
            let bytes = serde_json::to_vec_pretty(record)?;
            write_durable(&path.with_extension("json.tmp"), &path, &bytes)?;
        }
        Ok(())
    }

    fn create(&self, transformation: Transformation) -> CoreResult<()> {
        let mut records = self.records.write();
        if records.contains_key(&transformation.id) {
            return Err(CoreError::TransformationExists {
                id: transformation.id.to_string(),
            });
        }
        let record = Record {
            transformation,
            progress: None,
        };
        self.persist(&record)?;
        records.insert(record.transformation.id.clone(), record);
        Ok(())
    }

    /// Applies `change` to a copy, persists it, then publishes it.
    fn modify(
        &self,
        id: &TransformationId,
        change: impl FnOnce(&mut Record) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let mut records = self.records.write();
        let current = records
            .get(id)
            .ok_or_else(|| CoreError::transformation_not_found(id))?;
        let mut updated = current.clone();
        change(&mut updated)?;
        if &updated == current {
            return Ok(());
        }
        self.persist(&updated)?;
        records.insert(id.clone(), updated);
        Ok(())
    }

    fn get(&self, id: &TransformationId) -> Option<Record> {
        self.records.read().get(id).cloned()
    }

    fn by_context(&self, context: &str) -> Vec<Transformation> {
        self.records
            .read()
            .values()
            .filter(|r| r.transformation.context == context)
            .map(|r| r.transformation.clone())
            .collect()
    }

    fn delete(&self, id: &TransformationId) -> CoreResult<()> {
        let mut records = self.records.write();
        if let Some(dir) = &self.dir {
            remove_if_exists(&Self::record_path(dir, id))?;
        }
        records.remove(id);
        Ok(())
    }

    fn set_status(&self, id: &TransformationId, status: TransformationStatus) -> CoreResult<()> {
        self.modify(id, |record| {
            record.transformation.status = status;
            Ok(())
        })
    }

    fn prepare_apply(&self, id: &TransformationId, start: &ApplyStart) -> CoreResult<()> {
        self.modify(id, |record| {
            let t = &mut record.transformation;
            t.status = TransformationStatus::Closed;
            t.keep_old_versions = start.keep_old_versions;
            t.applied_by = Some(start.applied_by.clone());
            t.applied_at = Some(start.applied_at);
            t.first_event_token = Some(start.first_event_token);
            t.last_event_token = Some(start.last_event_token);
            Ok(())
        })
    }

    fn set_progress(&self, id: &TransformationId, token: Token) -> CoreResult<()> {
        self.modify(id, |record| {
            if let Some(previous) = record.progress {
                if token < previous.last_token_applied {
                    return Err(CoreError::invalid_operation(format!(
                        "checkpoint of {id} cannot move back from {} to {token}",
                        previous.last_token_applied
                    )));
                }
            }
            record.progress = Some(TransformationProgress {
                last_token_applied: token,
            });
            Ok(())
        })
    }
}

/// Keeps records in memory.
#[derive(Debug)]
pub struct InMemoryStateManager {
    ledger: Ledger,
}

impl InMemoryStateManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ledger: Ledger {
                records: RwLock::new(BTreeMap::new()),
                dir: None,
            },
        }
    }
}

impl Default for InMemoryStateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one JSON file per transformation in a directory.
///
/// Every change rewrites the record through a temporary file and an atomic
/// rename, so a crash leaves either the old or the new record.
#[derive(Debug)]
pub struct FileStateManager {
    ledger: Ledger,
}

impl FileStateManager {
    /// Opens (creating if missing) a record directory and loads its records.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a record is not
    /// valid JSON.
    pub fn open(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut records = BTreeMap::new();
        for item in fs::read_dir(&dir)? {
            let path = item?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.ends_with(".json.tmp") {
                warn!(path = %path.display(), "removing unfinished transformation record");
                remove_if_exists(&path)?;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: Record = serde_json::from_slice(&fs::read(&path)?)?;
            records.insert(record.transformation.id.clone(), record);
        }
        debug!(dir = %dir.display(), records = records.len(), "transformation records loaded");
        Ok(Self {
            ledger: Ledger {
                records: RwLock::new(records),
                dir: Some(dir),
            },
        })
    }
}

macro_rules! delegate_state_manager {
    ($manager:ty) => {
        impl TransformationStateManager for $manager {
            fn create(&self, transformation: Transformation) -> CoreResult<()> {
                self.ledger.create(transformation)
            }

            fn transformation(&self, id: &TransformationId) -> CoreResult<Option<Transformation>> {
                Ok(self.ledger.get(id).map(|r| r.transformation))
            }

            fn transformations(&self, context: &str) -> CoreResult<Vec<Transformation>> {
                Ok(self.ledger.by_context(context))
            }

            fn delete(&self, id: &TransformationId) -> CoreResult<()> {
                self.ledger.delete(id)
            }

            fn progress(&self, id: &TransformationId) -> CoreResult<Option<TransformationProgress>> {
                Ok(self.ledger.get(id).and_then(|r| r.progress))
            }

            fn set_status(&self, id: &TransformationId, status: TransformationStatus) -> CoreResult<()> {
                self.ledger.set_status(id, status)
            }

            fn prepare_apply(&self, id: &TransformationId, start: &ApplyStart) -> CoreResult<()> {
                self.ledger.prepare_apply(id, start)
            }

            fn set_progress(&self, id: &TransformationId, token: Token) -> CoreResult<()> {
                self.ledger.set_progress(id, token)
            }

            fn complete(&self, id: &TransformationId) -> CoreResult<()> {
                self.ledger.set_status(id, TransformationStatus::Applied)
            }
        }
    };
}

delegate_state_manager!(InMemoryStateManager);
delegate_state_manager!(FileStateManager);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn start() -> ApplyStart {
        ApplyStart {
            keep_old_versions: true,
            applied_by: "ops".into(),
            applied_at: 1_700_000_000_000,
            first_event_token: 100,
            last_event_token: 111,
        }
    }

    #[test]
    fn lifecycle_in_memory() {
        let manager = InMemoryStateManager::new();
        let id = TransformationId::new("t1");
        manager.create(Transformation::new(id.clone(), "default", 1, "fix")).unwrap();
        assert!(matches!(
            manager.create(Transformation::new(id.clone(), "default", 1, "again")),
            Err(CoreError::TransformationExists { .. })
        ));

        manager.prepare_apply(&id, &start()).unwrap();
        let t = manager.transformation(&id).unwrap().unwrap();
        assert_eq!(t.status, TransformationStatus::Closed);
        assert_eq!(t.first_event_token, Some(100));
        assert_eq!(t.applied_by.as_deref(), Some("ops"));

        manager.set_progress(&id, 105).unwrap();
        manager.set_progress(&id, 105).unwrap();
        assert!(manager.set_progress(&id, 104).is_err());
        assert_eq!(manager.progress(&id).unwrap().unwrap().last_token_applied, 105);

        manager.complete(&id).unwrap();
        assert_eq!(
            manager.transformation(&id).unwrap().unwrap().status,
            TransformationStatus::Applied
        );
        manager.delete(&id).unwrap();
        manager.delete(&id).unwrap();
        assert!(manager.transformation(&id).unwrap().is_none());
    }

    #[test]
    fn unknown_ids_are_reported() {
        let manager = InMemoryStateManager::new();
        let id = TransformationId::new("nope");
        assert!(matches!(
            manager.set_status(&id, TransformationStatus::Closed),
            Err(CoreError::TransformationNotFound { .. })
        ));
        assert!(manager.progress(&id).unwrap().is_none());
    }

    #[test]
    fn file_manager_survives_reopen() {
        let dir = tempdir().unwrap();
        let id = TransformationId::new("t1");
        {
            let manager = FileStateManager::open(dir.path()).unwrap();
            manager.create(Transformation::new(id.clone(), "default", 2, "fix")).unwrap();
            manager.create(Transformation::new("t2".into(), "other", 1, "")).unwrap();
            manager.prepare_apply(&id, &start()).unwrap();
            manager.set_status(&id, TransformationStatus::Applying).unwrap();
            manager.set_progress(&id, 110).unwrap();
        }
        std::fs::write(dir.path().join("t3.json.tmp"), b"{").unwrap();

        let manager = FileStateManager::open(dir.path()).unwrap();
        let t = manager.transformation(&id).unwrap().unwrap();
        assert_eq!(t.status, TransformationStatus::Applying);
        assert_eq!(t.version, 2);
        assert_eq!(manager.progress(&id).unwrap().unwrap().last_token_applied, 110);
        assert_eq!(manager.transformations("default").unwrap().len(), 1);
        assert!(!dir.path().join("t3.json.tmp").exists());
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&TransformationStatus::RollingBack).unwrap();
        assert_eq!(json, "\"ROLLING_BACK\"");
    }
}
