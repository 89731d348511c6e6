//! A context's segment files and the indexes over them.

use crate::config::StorageConfig;
use crate::error::{CoreError, CoreResult};
use crate::event::Event;
use crate::index::{
    IndexEntry, IndexManager, IndexStats, RemoteSequenceResolver, SegmentIndexEntries,
};
use crate::layout::{ContextDir, SegmentLayout};
use crate::segment::{SegmentReader, SegmentTransformer, SegmentWriter};
use crate::transformation::{
    CancelFlag, EventProvider, EventStoreTransformer, EventTransformation, TransformRequest,
    TransformSummary,
};
use crate::types::{EventType, FileVersion, Token};
use chronoshift_storage::fs::{promote, remove_if_exists};
use chronoshift_storage::{FileBackend, StorageError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One segment family (events or snapshots) of a context.
struct Family {
    layout: SegmentLayout,
    indexes: IndexManager,
    next_token: Mutex<Token>,
}

impl Family {
    fn open(context: &str, layout: SegmentLayout, config: &StorageConfig) -> CoreResult<Self> {
        let removed = layout.remove_temp_files()?;
        if removed > 0 {
            warn!(context, event_type = %layout.event_type(), removed, "removed unfinished files");
        }
        let indexes = IndexManager::new(context, layout.clone(), config.clone());
        let index_versions = layout.scan(layout.event_type().index_extension())?;
        let data_versions = layout.data_versions()?;
        let mut last = None;

        for (segment, versions) in &data_versions {
            let chosen = Self::pick_version(&layout, &indexes, *segment, versions)?;
            indexes.activate_version(*segment, chosen);
            last = Some(FileVersion::new(*segment, chosen));
        }
        // index files left by a rewrite that crashed before promoting its data
        for (segment, versions) in &index_versions {
            let with_data = data_versions.get(segment);
            for version in versions {
                if with_data.is_some_and(|data| data.contains(version)) {
                    continue;
                }
                debug!(context, segment, version, "removing index without data");
                indexes.remove_version(FileVersion::new(*segment, *version))?;
            }
        }

        let next_token = match last {
            Some(version) => SegmentReader::open_file(&layout.data_file(version))?.next_token()?,
            None => 0,
        };
        info!(
            context,
            event_type = %layout.event_type(),
            segments = indexes.completed_segments().len(),
            next_token,
            "segment family opened"
        );
        Ok(Self {
            layout,
            indexes,
            next_token: Mutex::new(next_token),
        })
    }

    /// Newest data version with a usable index, rebuilding the index of the
    /// newest data version if none has one.
    fn pick_version(
        layout: &SegmentLayout,
        indexes: &IndexManager,
        segment: u64,
        versions: &[u32],
    ) -> CoreResult<u32> {
        for version in versions.iter().rev() {
            if indexes.valid_index(FileVersion::new(segment, *version)) {
                return Ok(*version);
            }
        }
        let Some(newest) = versions.last().copied() else {
            return Err(CoreError::segment_not_found(format!("segment {segment} has no data file")));
        };
        let version = FileVersion::new(segment, newest);
        warn!(%version, "rebuilding segment index");
        let reader = SegmentReader::open_file(&layout.data_file(version))?;
        indexes.create_new_version(segment, newest, &index_entries(&reader)?)?;
        Ok(newest)
    }

    fn data_file(&self, version: FileVersion) -> PathBuf {
        self.layout.data_file(version)
    }

    /// Segments with their current versions and inclusive last tokens.
    fn ranges(&self) -> Vec<(FileVersion, Token)> {
        let segments = self.indexes.completed_segments();
        let next_token = *self.next_token.lock();
        segments
            .iter()
            .enumerate()
            .map(|(i, version)| {
                let end = segments.get(i + 1).map_or(next_token, |next| next.segment);
                (*version, end.saturating_sub(1))
            })
            .collect()
    }

    fn segment_for(&self, token: Token) -> Option<FileVersion> {
        if token >= *self.next_token.lock() {
            return None;
        }
        self.indexes
            .completed_segments()
            .into_iter()
            .rev()
            .find(|version| version.segment <= token)
    }

    /// Opens the current version of the segment holding `token`.
    ///
    /// A rewrite may replace and delete the version between lookup and open,
    /// so a vanished file is looked up once more.
    fn reader_for(&self, token: Token) -> CoreResult<Option<SegmentReader>> {
        for _ in 0..2 {
            let Some(version) = self.segment_for(token) else {
                return Ok(None);
            };
            match SegmentReader::open_file(&self.data_file(version)) {
                Ok(reader) => return Ok(Some(reader)),
                Err(CoreError::Storage(StorageError::NotFound(path))) => {
                    debug!(path = %path.display(), "segment version vanished, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(CoreError::segment_not_found(format!("no readable segment for token {token}")))
    }
}

fn index_entries(reader: &SegmentReader) -> CoreResult<SegmentIndexEntries> {
    let mut entries = SegmentIndexEntries::new();
    for stored in reader.events() {
        let stored = stored?;
        if !stored.event.is_domain_event() {
            continue;
        }
        let position = u32::try_from(stored.position)
            .map_err(|_| CoreError::segment_corruption("event position beyond 4 GiB"))?;
        entries
            .entry(stored.event.aggregate_identifier.clone())
            .or_default()
            .add(IndexEntry::new(stored.event.aggregate_sequence_number, position));
    }
    Ok(entries)
}

/// The segmented event log of one context.
///
/// Appends write whole segments: each call produces one completed segment
/// whose index moves from the active to the completed set once the data file
/// is in place. Transformations rewrite segments in place of the version
/// readers see; older versions stay on disk until deleted.
pub struct SegmentStore {
    dir: ContextDir,
    config: StorageConfig,
    events: Family,
    snapshots: Family,
    write_lock: Mutex<()>,
}

impl SegmentStore {
    /// Opens (creating if missing) the store of `context` under `root`.
    ///
    /// Leftover temporary files are removed. Each segment is served at its
    /// newest version whose index and data are both complete.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ContextLocked`] if another process has the
    /// context open, or an error if a segment cannot be read.
    pub fn open(root: &Path, context: &str, config: StorageConfig) -> CoreResult<Self> {
        let dir = ContextDir::open(root, context)?;
        let events = Family::open(context, dir.layout(EventType::Event), &config)?;
        let snapshots = Family::open(context, dir.layout(EventType::Snapshot), &config)?;
        events.indexes.start_cleanup()?;
        snapshots.indexes.start_cleanup()?;
        Ok(Self {
            dir,
            config,
            events,
            snapshots,
            write_lock: Mutex::new(()),
        })
    }

    /// The context name.
    #[must_use]
    pub fn context(&self) -> &str {
        self.dir.context()
    }

    /// The context directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn family(&self, event_type: EventType) -> &Family {
        match event_type {
            EventType::Event => &self.events,
            EventType::Snapshot => &self.snapshots,
        }
    }

    /// Index engine of a segment family.
    #[must_use]
    pub fn indexes(&self, event_type: EventType) -> &IndexManager {
        &self.family(event_type).indexes
    }

    /// Index engine counters of a segment family.
    #[must_use]
    pub fn stats(&self, event_type: EventType) -> IndexStats {
        self.family(event_type).indexes.stats()
    }

    /// Token the next appended event of a family receives.
    #[must_use]
    pub fn next_token(&self, event_type: EventType) -> Token {
        *self.family(event_type).next_token.lock()
    }

    /// Completed segments of a family with their current versions.
    #[must_use]
    pub fn segments(&self, event_type: EventType) -> Vec<FileVersion> {
        self.family(event_type).indexes.completed_segments()
    }

    /// Installs a resolver for sequence numbers of segments held elsewhere.
    pub fn set_remote_resolver(&self, resolver: Arc<dyn RemoteSequenceResolver>) {
        self.events.indexes.set_remote_resolver(Arc::clone(&resolver));
        self.snapshots.indexes.set_remote_resolver(resolver);
    }

    /// Writes `transactions` as one new completed segment.
    ///
    /// # Errors
    ///
    /// Returns an error if there is nothing to write or any write fails; the
    /// partial segment is discarded.
    pub fn append_segment(
        &self,
        event_type: EventType,
        transactions: &[Vec<Event>],
    ) -> CoreResult<FileVersion> {
        if transactions.iter().all(Vec::is_empty) {
            return Err(CoreError::invalid_operation("cannot write an empty segment"));
        }
        let _guard = self.write_lock.lock();
        let family = self.family(event_type);
        let segment = *family.next_token.lock();
        let version = FileVersion::new(segment, 0);
        let target = family.data_file(version);
        let temp = SegmentLayout::temp_of(&target);

        let written = (|| -> CoreResult<_> {
            let mut writer = SegmentWriter::create(Box::new(FileBackend::create_new(&temp)?), segment)?;
            for events in transactions.iter().filter(|events| !events.is_empty()) {
                let positions = writer.append(events)?;
                for (event, position) in events.iter().zip(positions) {
                    if !event.is_domain_event() {
                        continue;
                    }
                    let position = u32::try_from(position)
                        .map_err(|_| CoreError::invalid_operation("segment exceeds 4 GiB"))?;
                    family.indexes.add_to_active_segment(
                        segment,
                        &event.aggregate_identifier,
                        IndexEntry::new(event.aggregate_sequence_number, position),
                    )?;
                }
            }
            let written = writer.finish(self.config.sync_on_write)?;
            promote(&temp, &target)?;
            family.indexes.complete(version)?;
            Ok(written)
        })();

        match written {
            Ok(written) => {
                *family.next_token.lock() = written.next_token;
                debug!(
                    context = %self.context(),
                    %version,
                    next_token = written.next_token,
                    "segment appended"
                );
                Ok(version)
            }
            Err(err) => {
                let _ = remove_if_exists(&temp);
                let _ = remove_if_exists(&target);
                if let Err(cleanup) = family.indexes.remove(segment) {
                    warn!(segment, error = %cleanup, "could not discard index of failed segment");
                }
                Err(err)
            }
        }
    }

    /// The event stored at `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment cannot be read.
    pub fn event(&self, token: Token) -> CoreResult<Option<Event>> {
        let Some(reader) = self.events.reader_for(token)? else {
            return Ok(None);
        };
        for stored in reader.events() {
            let stored = stored?;
            if stored.token == token {
                return Ok(Some(stored.event));
            }
        }
        Ok(None)
    }

    /// Events of an aggregate with sequence numbers in `[first_seq, last_seq)`,
    /// in order.
    ///
    /// # Errors
    ///
    /// Returns an error if an index or segment cannot be read.
    pub fn read_aggregate(&self, aggregate_id: &str, first_seq: u64, last_seq: u64) -> CoreResult<Vec<Event>> {
        let located = self
            .events
            .indexes
            .lookup_aggregate(aggregate_id, first_seq, last_seq, usize::MAX, 0)?;
        let mut events = Vec::new();
        for found in located {
            let reader = SegmentReader::open_file(&self.events.data_file(found.file_version))?;
            for entry in found.entries.entries() {
                events.push(reader.read_event(u64::from(entry.position))?);
            }
        }
        Ok(events)
    }

    /// The newest snapshot of an aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if an index or segment cannot be read.
    pub fn last_snapshot(&self, aggregate_id: &str) -> CoreResult<Option<Event>> {
        let Some(found) = self.snapshots.indexes.last_index_entries(aggregate_id, u64::MAX)? else {
            return Ok(None);
        };
        let Some(entry) = found.entries.entries().last() else {
            return Ok(None);
        };
        let reader = SegmentReader::open_file(&self.snapshots.data_file(found.file_version))?;
        reader.read_event(u64::from(entry.position)).map(Some)
    }

    /// Highest stored sequence number of an aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if an index cannot be read.
    pub fn last_sequence_number(&self, aggregate_id: &str) -> CoreResult<Option<u64>> {
        self.events
            .indexes
            .get_last_sequence_number(aggregate_id, usize::MAX, Token::MAX)
    }

    fn check_context(&self, context: &str) -> CoreResult<()> {
        if context == self.context() {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "store of context {} asked for context {context}",
                self.context()
            )))
        }
    }

    /// Replays one segment; returns whether it was rewritten.
    fn transform_segment(
        &self,
        request: &TransformRequest,
        source: FileVersion,
        transformation: &mut dyn EventTransformation,
        skip_to: &mut Token,
        cancel: &CancelFlag,
        summary: &mut TransformSummary,
    ) -> CoreResult<bool> {
        let family = &self.events;
        let reader = SegmentReader::open_file(&family.data_file(source))?;
        let mut transformer: Option<SegmentTransformer> = None;

        let outcome = (|| -> CoreResult<Option<usize>> {
            let mut replaced = 0;
            for stored in reader.events() {
                let stored = stored?;
                if stored.token < request.first_token || stored.token < *skip_to {
                    continue;
                }
                if stored.token > request.last_token {
                    break;
                }
                let result = transformation.transform(&stored.event, stored.token)?;
                *skip_to = result.next_token.unwrap_or(Token::MAX);
                let Some(replacement) = result.replacement else {
                    continue;
                };
                if transformer.is_none() {
                    let mut rewrite = SegmentTransformer::new(
                        self.context(),
                        family.layout.clone(),
                        family.indexes.clone(),
                        source,
                        request.version,
                        self.config.sync_on_write,
                    );
                    rewrite.initialize()?;
                    transformer = Some(rewrite);
                }
                if let Some(rewrite) = transformer.as_mut() {
                    rewrite.transform_event(replacement, stored.token)?;
                    replaced += 1;
                }
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }
            Ok(Some(replaced))
        })();

        let replaced = match outcome {
            Ok(Some(replaced)) => replaced,
            Ok(None) => {
                if let Some(rewrite) = transformer.as_mut() {
                    rewrite.cancel();
                }
                summary.cancelled = true;
                return Ok(false);
            }
            Err(err) => {
                if let Some(rewrite) = transformer.as_mut() {
                    rewrite.rollback(&err);
                }
                return Err(err);
            }
        };
        let Some(mut rewrite) = transformer else {
            return Ok(false);
        };

        let target = rewrite.complete_segment()?;
        family.indexes.activate_version(target.segment, target.version);
        if !request.keep_old_versions {
            remove_if_exists(&family.data_file(source))?;
            family.indexes.remove_version(source)?;
        }
        summary.events_transformed += replaced;
        summary.segments_rewritten += 1;
        info!(context = %self.context(), %source, %target, replaced, "segment rewritten");
        Ok(true)
    }
}

impl EventStoreTransformer for SegmentStore {
    fn transform_events(
        &self,
        request: &TransformRequest,
        transformation: &mut dyn EventTransformation,
        progress: &mut dyn FnMut(Token) -> CoreResult<()>,
        cancel: &CancelFlag,
    ) -> CoreResult<TransformSummary> {
        self.check_context(&request.context)?;
        let _guard = self.write_lock.lock();
        let mut summary = TransformSummary::default();
        let mut skip_to = request.first_token;

        for (source, last_token) in self.events.ranges() {
            if last_token < request.first_token {
                continue;
            }
            if source.segment > request.last_token {
                break;
            }
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let covered = last_token.min(request.last_token);
            if source.version > request.version && skip_to <= covered {
                return Err(CoreError::StaleVersion {
                    context: self.context().to_string(),
                    version: request.version,
                    current: source.version,
                });
            }
            if source.version >= request.version {
                debug!(context = %self.context(), %source, "segment already at target version");
            } else if skip_to <= covered {
                self.transform_segment(request, source, transformation, &mut skip_to, cancel, &mut summary)?;
                if summary.cancelled {
                    break;
                }
            }
            progress(covered)?;
        }
        Ok(summary)
    }

    fn current_version(&self, context: &str) -> CoreResult<u32> {
        self.check_context(context)?;
        Ok(self
            .events
            .indexes
            .completed_segments()
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0))
    }

    fn delete_old_versions(&self, context: &str, version: u32) -> CoreResult<usize> {
        self.check_context(context)?;
        let _guard = self.write_lock.lock();
        let family = &self.events;
        let on_disk = family.layout.data_versions()?;
        let mut removed = 0;
        for current in family.indexes.completed_segments() {
            if current.version != version {
                continue;
            }
            for old in on_disk.get(&current.segment).into_iter().flatten().filter(|v| **v < version) {
                let old = FileVersion::new(current.segment, *old);
                remove_if_exists(&family.data_file(old))?;
                family.indexes.remove_version(old)?;
                removed += 1;
            }
        }
        info!(context, version, removed, "superseded segment versions deleted");
        Ok(removed)
    }

    fn rollback_segments(&self, context: &str, version: u32) -> CoreResult<usize> {
        self.check_context(context)?;
        let _guard = self.write_lock.lock();
        let family = &self.events;
        let on_disk = family.layout.data_versions()?;

        let mut plan = Vec::new();
        for current in family.indexes.completed_segments() {
            if current.version != version {
                continue;
            }
            let previous = on_disk
                .get(&current.segment)
                .into_iter()
                .flatten()
                .copied()
                .filter(|v| *v < version)
                .max()
                .filter(|v| family.indexes.valid_index(FileVersion::new(current.segment, *v)));
            let Some(previous) = previous else {
                return Err(CoreError::RollbackUnavailable {
                    segment: current.segment,
                    version: version.saturating_sub(1),
                });
            };
            plan.push((current, previous));
        }

        for (current, previous) in &plan {
            family.indexes.activate_version(current.segment, *previous);
            remove_if_exists(&family.data_file(*current))?;
            family.indexes.remove_version(*current)?;
            debug!(context, segment = current.segment, from = current.version, to = previous, "segment rolled back");
        }
        info!(context, version, segments = plan.len(), "segments rolled back");
        Ok(plan.len())
    }
}

impl EventProvider for SegmentStore {
    fn event_at(&self, context: &str, token: Token) -> CoreResult<Option<Event>> {
        self.check_context(context)?;
        self.event(token)
    }
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("context", &self.context())
            .field("next_token", &self.next_token(EventType::Event))
            .finish_non_exhaustive()
    }
}
