//! Lookup of the entry stores of all transformations.

use super::entry_store::TransformationEntryStore;
use crate::config::StorageConfig;
use crate::error::CoreResult;
use crate::layout::entries_file;
use crate::types::TransformationId;
use chronoshift_storage::fs::remove_if_exists;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type StoreKey = (String, TransformationId);

/// Opens and caches entry stores, one per transformation.
///
/// File-backed registries keep each log at
/// `<root>/<context>/transformations/<id>.entries`; in-memory registries lose
/// everything when dropped.
#[derive(Debug)]
pub struct EntryStoreRegistry {
    root: Option<PathBuf>,
    config: StorageConfig,
    stores: Mutex<HashMap<StoreKey, Arc<TransformationEntryStore>>>,
}

impl EntryStoreRegistry {
    /// Creates a registry keeping logs under `root`.
    pub fn new(root: impl Into<PathBuf>, config: StorageConfig) -> Self {
        Self {
            root: Some(root.into()),
            config,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a registry whose logs live in memory.
    #[must_use]
    pub fn in_memory(config: StorageConfig) -> Self {
        Self {
            root: None,
            config,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory, for file-backed registries.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Returns the store of a transformation, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened.
    pub fn open(&self, context: &str, id: &TransformationId) -> CoreResult<Arc<TransformationEntryStore>> {
        let mut stores = self.stores.lock();
        let key = (context.to_string(), id.clone());
        if let Some(store) = stores.get(&key) {
            return Ok(Arc::clone(store));
        }
        let store = match &self.root {
            Some(root) => TransformationEntryStore::open(&entries_file(root, context, id), &self.config)?,
            None => TransformationEntryStore::in_memory(&self.config),
        };
        let store = Arc::new(store);
        stores.insert(key, Arc::clone(&store));
        Ok(store)
    }

    /// Returns the store of a transformation only if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing log cannot be opened.
    pub fn existing(
        &self,
        context: &str,
        id: &TransformationId,
    ) -> CoreResult<Option<Arc<TransformationEntryStore>>> {
        let key = (context.to_string(), id.clone());
        if let Some(store) = self.stores.lock().get(&key) {
            return Ok(Some(Arc::clone(store)));
        }
        match &self.root {
            Some(root) if entries_file(root, context, id).exists() => self.open(context, id).map(Some),
            _ => Ok(None),
        }
    }

    /// Deletes the store of a transformation. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be removed.
    pub fn delete(&self, context: &str, id: &TransformationId) -> CoreResult<()> {
        let removed = self.stores.lock().remove(&(context.to_string(), id.clone()));
        if let Some(store) = removed {
            store.delete()?;
        }
        if let Some(root) = &self.root {
            remove_if_exists(&entries_file(root, context, id))?;
        }
        Ok(())
    }
}
