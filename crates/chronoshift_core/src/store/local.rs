//! Several contexts behind one handle.

use super::segment_store::SegmentStore;
use crate::config::StorageConfig;
use crate::error::CoreResult;
use crate::event::Event;
use crate::transformation::{
    CancelFlag, EventProvider, EventStoreTransformer, EventTransformation, TransformRequest,
    TransformSummary,
};
use crate::types::Token;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opens a [`SegmentStore`] per context on first use and routes calls to it.
#[derive(Debug)]
pub struct LocalEventStore {
    root: PathBuf,
    config: StorageConfig,
    contexts: RwLock<BTreeMap<String, Arc<SegmentStore>>>,
}

impl LocalEventStore {
    /// Creates a store rooted at `root`; one subdirectory per context.
    pub fn new(root: impl Into<PathBuf>, config: StorageConfig) -> Self {
        Self {
            root: root.into(),
            config,
            contexts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The store of `context`, opened if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be opened.
    pub fn context(&self, context: &str) -> CoreResult<Arc<SegmentStore>> {
        if let Some(store) = self.contexts.read().get(context) {
            return Ok(Arc::clone(store));
        }
        let mut contexts = self.contexts.write();
        if let Some(store) = contexts.get(context) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(SegmentStore::open(&self.root, context, self.config.clone())?);
        contexts.insert(context.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Names of the opened contexts.
    #[must_use]
    pub fn contexts(&self) -> Vec<String> {
        self.contexts.read().keys().cloned().collect()
    }

    /// Closes a context, releasing its directory lock once no caller holds it.
    pub fn close(&self, context: &str) -> bool {
        self.contexts.write().remove(context).is_some()
    }
}

impl EventStoreTransformer for LocalEventStore {
    fn transform_events(
        &self,
        request: &TransformRequest,
        transformation: &mut dyn EventTransformation,
        progress: &mut dyn FnMut(Token) -> CoreResult<()>,
        cancel: &CancelFlag,
    ) -> CoreResult<TransformSummary> {
        self.context(&request.context)?
            .transform_events(request, transformation, progress, cancel)
    }

    fn current_version(&self, context: &str) -> CoreResult<u32> {
        self.context(context)?.current_version(context)
    }

    fn delete_old_versions(&self, context: &str, version: u32) -> CoreResult<usize> {
        self.context(context)?.delete_old_versions(context, version)
    }

    fn rollback_segments(&self, context: &str, version: u32) -> CoreResult<usize> {
        self.context(context)?.rollback_segments(context, version)
    }
}

impl EventProvider for LocalEventStore {
    fn event_at(&self, context: &str, token: Token) -> CoreResult<Option<Event>> {
        self.context(context)?.event(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SerializedObject;
    use crate::types::EventType;
    use tempfile::tempdir;

    #[test]
    fn contexts_are_independent() {
        let dir = tempdir().unwrap();
        let store = LocalEventStore::new(dir.path(), StorageConfig::default());
        let first = store.context("one").unwrap();
        first
            .append_segment(
                EventType::Event,
                &[vec![Event::new("a", 0, SerializedObject::new("T", vec![]))]],
            )
            .unwrap();
        assert!(Arc::ptr_eq(&first, &store.context("one").unwrap()));

        assert!(store.event_at("one", 0).unwrap().is_some());
        assert!(store.event_at("two", 0).unwrap().is_none());
        assert_eq!(store.contexts(), vec!["one".to_string(), "two".to_string()]);

        drop(first);
        assert!(store.close("one"));
        assert!(!store.close("one"));
    }
}
