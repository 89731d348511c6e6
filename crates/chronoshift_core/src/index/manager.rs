//! Index engine of one context and segment family.

use super::bloom::PersistedBloomFilter;
use super::file::{write_index, IndexMode, SegmentIndex};
use super::{IndexEntries, IndexEntry, LocatedEntries, SegmentIndexEntries};
use crate::config::StorageConfig;
use crate::error::{CoreError, CoreResult};
use crate::layout::SegmentLayout;
use crate::types::{EventType, FileVersion, Token};
use chronoshift_storage::fs::remove_if_exists;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Resolves sequence numbers for segments this node does not hold locally.
pub trait RemoteSequenceResolver: Send + Sync {
    /// Highest sequence number of `aggregate_id` in segments before
    /// `max_token`, scanning at most `max_segments` segments.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote lookup fails.
    fn last_sequence_number(
        &self,
        context: &str,
        aggregate_id: &str,
        max_segments: usize,
        max_token: Token,
    ) -> CoreResult<Option<u64>>;
}

/// Counters describing index engine activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexStats {
    /// Active (still written) segments.
    pub active_segments: usize,
    /// Completed segments.
    pub completed_segments: usize,
    /// Indexes currently cached.
    pub open_indexes: usize,
    /// Bloom filters currently cached.
    pub loaded_blooms: usize,
    /// Evicted indexes waiting for their grace period.
    pub pending_closes: usize,
    /// Index files opened since start.
    pub index_opens: u64,
    /// Indexes closed since start.
    pub index_closes: u64,
    /// Bloom filters loaded since start.
    pub bloom_loads: u64,
    /// Bloom filters evicted since start.
    pub bloom_evictions: u64,
    /// Lookups answered negatively by a bloom filter.
    pub bloom_skips: u64,
}

#[derive(Default)]
struct Counters {
    index_opens: AtomicU64,
    index_closes: AtomicU64,
    bloom_loads: AtomicU64,
    bloom_evictions: AtomicU64,
    bloom_skips: AtomicU64,
}

/// Index of a segment that is still being written.
#[derive(Default)]
struct ActiveSegment {
    sealed: AtomicBool,
    aggregates: RwLock<HashMap<String, Arc<Mutex<IndexEntries>>>>,
}

impl ActiveSegment {
    fn snapshot(&self) -> SegmentIndexEntries {
        self.aggregates
            .read()
            .iter()
            .map(|(aggregate, entries)| (aggregate.clone(), entries.lock().clone()))
            .collect()
    }

    fn entries(&self, aggregate_id: &str) -> Option<IndexEntries> {
        let bucket = self.aggregates.read().get(aggregate_id).cloned();
        bucket.map(|entries| entries.lock().clone())
    }
}

#[derive(Clone)]
enum SegmentRef {
    Active(u64, Arc<ActiveSegment>),
    Completed(FileVersion),
}

impl SegmentRef {
    fn segment(&self) -> u64 {
        match self {
            Self::Active(segment, _) => *segment,
            Self::Completed(version) => version.segment,
        }
    }

    fn file_version(&self) -> FileVersion {
        match self {
            Self::Active(segment, _) => FileVersion::new(*segment, 0),
            Self::Completed(version) => *version,
        }
    }
}

struct Sweeper {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    context: String,
    layout: SegmentLayout,
    config: StorageConfig,
    active: RwLock<BTreeMap<u64, Arc<ActiveSegment>>>,
    completed: RwLock<BTreeMap<u64, u32>>,
    indexes: Mutex<LruCache<FileVersion, Arc<SegmentIndex>>>,
    blooms: Mutex<LruCache<FileVersion, Arc<PersistedBloomFilter>>>,
    pending_close: Mutex<Vec<(Instant, Arc<SegmentIndex>)>>,
    remote: RwLock<Option<Arc<dyn RemoteSequenceResolver>>>,
    counters: Counters,
    sweeper: Mutex<Option<Sweeper>>,
}

/// Owns the active and completed indexes of one context's segment family.
///
/// Cloning yields another handle to the same engine.
///
/// Active segments live in memory and are appended to while the segment is
/// written. [`IndexManager::complete`] writes the index and bloom filter of a
/// segment and moves it to the completed set in one step. Completed indexes
/// are opened lazily, cached in access order and evicted by
/// [`IndexManager::sweep`], which runs periodically once
/// [`IndexManager::start_cleanup`] has been called.
///
/// # Example
///
/// ```rust,no_run
/// use chronoshift_core::index::{IndexEntry, IndexManager};
/// use chronoshift_core::layout::SegmentLayout;
/// use chronoshift_core::{EventType, FileVersion, StorageConfig};
///
/// let layout = SegmentLayout::new("/data/default", EventType::Event);
/// let manager = IndexManager::new("default", layout, StorageConfig::default());
/// manager.add_to_active_segment(0, "order-1", IndexEntry::new(0, 13)).unwrap();
/// manager.complete(FileVersion::new(0, 0)).unwrap();
/// let last = manager.get_last_sequence_number("order-1", 10, u64::MAX).unwrap();
/// assert_eq!(last, Some(0));
/// ```
#[derive(Clone)]
pub struct IndexManager {
    inner: Arc<Inner>,
}

impl IndexManager {
    /// Creates an index engine for `layout`.
    #[must_use]
    pub fn new(context: impl Into<String>, layout: SegmentLayout, config: StorageConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                context: context.into(),
                layout,
                config,
                active: RwLock::new(BTreeMap::new()),
                completed: RwLock::new(BTreeMap::new()),
                indexes: Mutex::new(LruCache::unbounded()),
                blooms: Mutex::new(LruCache::unbounded()),
                pending_close: Mutex::new(Vec::new()),
                remote: RwLock::new(None),
                counters: Counters::default(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Context served by this engine.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.inner.context
    }

    /// File layout used by this engine.
    #[must_use]
    pub fn layout(&self) -> &SegmentLayout {
        &self.inner.layout
    }

    /// Installs the resolver consulted when local segments run out.
    pub fn set_remote_resolver(&self, resolver: Arc<dyn RemoteSequenceResolver>) {
        *self.inner.remote.write() = Some(resolver);
    }

    /// Registers the newest index version of every segment found on disk.
    ///
    /// Returns the number of completed segments.
    ///
    /// # Errors
    ///
    /// Returns an error if the context directory cannot be read.
    pub fn init(&self) -> CoreResult<usize> {
        let found = self
            .inner
            .layout
            .scan(self.inner.layout.event_type().index_extension())?;
        let mut completed = self.inner.completed.write();
        for (segment, versions) in found {
            if let Some(version) = versions.last() {
                completed.insert(segment, *version);
            }
        }
        info!(
            context = %self.inner.context,
            event_type = %self.inner.layout.event_type(),
            segments = completed.len(),
            "index manager initialized"
        );
        Ok(completed.len())
    }

    /// Appends one entry to the active index of `segment`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SegmentAlreadyCompleted`] if the segment was completed.
    pub fn add_to_active_segment(
        &self,
        segment: u64,
        aggregate_id: &str,
        entry: IndexEntry,
    ) -> CoreResult<()> {
        let mut single = IndexEntries::new();
        single.add(entry);
        self.add_all_to_active_segment(segment, aggregate_id, &single)
    }

    /// Appends several entries of one aggregate to the active index of `segment`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SegmentAlreadyCompleted`] if the segment was completed.
    pub fn add_all_to_active_segment(
        &self,
        segment: u64,
        aggregate_id: &str,
        entries: &IndexEntries,
    ) -> CoreResult<()> {
        let active = self.active_segment(segment)?;
        let bucket = {
            let aggregates = active.aggregates.read();
            if active.sealed.load(Ordering::Acquire) {
                return Err(CoreError::SegmentAlreadyCompleted { segment });
            }
            aggregates.get(aggregate_id).cloned()
        };
        let bucket = match bucket {
            Some(bucket) => bucket,
            None => {
                let mut aggregates = active.aggregates.write();
                if active.sealed.load(Ordering::Acquire) {
                    return Err(CoreError::SegmentAlreadyCompleted { segment });
                }
                aggregates.entry(aggregate_id.to_string()).or_default().clone()
            }
        };
        // The aggregates lock is re-taken so completion cannot snapshot
        // between the sealed check and the append.
        let aggregates = active.aggregates.read();
        if active.sealed.load(Ordering::Acquire) {
            return Err(CoreError::SegmentAlreadyCompleted { segment });
        }
        bucket.lock().add_all(entries);
        drop(aggregates);
        Ok(())
    }

    fn active_segment(&self, segment: u64) -> CoreResult<Arc<ActiveSegment>> {
        if let Some(active) = self.inner.active.read().get(&segment) {
            return Ok(Arc::clone(active));
        }
        let mut active = self.inner.active.write();
        if self.inner.completed.read().contains_key(&segment) {
            return Err(CoreError::SegmentAlreadyCompleted { segment });
        }
        Ok(Arc::clone(active.entry(segment).or_default()))
    }

    /// Writes the index and bloom filter of an active segment and moves it to
    /// the completed set.
    ///
    /// A segment with no aggregate events gets an empty index.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is already completed or the files
    /// cannot be written; the segment then stays active.
    pub fn complete(&self, file_version: FileVersion) -> CoreResult<()> {
        let segment = file_version.segment;
        let active = self.active_segment(segment)?;
        let snapshot = {
            let aggregates = active.aggregates.write();
            active.sealed.store(true, Ordering::Release);
            drop(aggregates);
            active.snapshot()
        };

        if let Err(err) = self.write_files(file_version, &snapshot) {
            active.sealed.store(false, Ordering::Release);
            return Err(err);
        }

        {
            let mut active = self.inner.active.write();
            let mut completed = self.inner.completed.write();
            active.remove(&segment);
            completed.insert(segment, file_version.version);
        }
        debug!(
            context = %self.inner.context,
            %file_version,
            aggregates = snapshot.len(),
            "segment index completed"
        );
        Ok(())
    }

    /// Writes the index and bloom filter of a rewritten segment version.
    ///
    /// The active set and the version readers use are left unchanged; see
    /// [`IndexManager::activate_version`].
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn create_new_version(
        &self,
        segment: u64,
        version: u32,
        entries: &SegmentIndexEntries,
    ) -> CoreResult<FileVersion> {
        let file_version = FileVersion::new(segment, version);
        self.write_files(file_version, entries)?;
        debug!(context = %self.inner.context, %file_version, "index version created");
        Ok(file_version)
    }

    fn write_files(&self, file_version: FileVersion, entries: &SegmentIndexEntries) -> CoreResult<()> {
        let layout = &self.inner.layout;
        let index = layout.index_file(file_version);
        write_index(&index, &SegmentLayout::temp_of(&index), file_version, entries)?;
        let bloom = layout.bloom_file(file_version);
        PersistedBloomFilter::for_entries(entries, self.inner.config.bloom_false_positive_rate)
            .write(&bloom, &SegmentLayout::temp_of(&bloom))
    }

    /// Makes `version` the version readers see for `segment`.
    ///
    /// Cached state of the previous version is evicted.
    pub fn activate_version(&self, segment: u64, version: u32) {
        let previous = self.inner.completed.write().insert(segment, version);
        if let Some(previous) = previous.filter(|p| *p != version) {
            self.evict(FileVersion::new(segment, previous));
        }
    }

    /// Version readers currently see for a completed segment.
    #[must_use]
    pub fn current_version(&self, segment: u64) -> Option<u32> {
        self.inner.completed.read().get(&segment).copied()
    }

    /// Completed segments and their current versions, oldest first.
    #[must_use]
    pub fn completed_segments(&self) -> Vec<FileVersion> {
        self.inner
            .completed
            .read()
            .iter()
            .map(|(segment, version)| FileVersion::new(*segment, *version))
            .collect()
    }

    /// Segments still being written, oldest first.
    #[must_use]
    pub fn active_segments(&self) -> Vec<u64> {
        self.inner.active.read().keys().copied().collect()
    }

    /// Whether the index and bloom filter of exactly `file_version` exist
    /// and open cleanly.
    #[must_use]
    pub fn valid_index(&self, file_version: FileVersion) -> bool {
        let layout = &self.inner.layout;
        let index = layout.index_file(file_version);
        let bloom = layout.bloom_file(file_version);
        if !index.exists() || !bloom.exists() {
            return false;
        }
        let index_ok = SegmentIndex::open(&index, file_version, IndexMode::Resident)
            .map(|index| index.close())
            .map_err(|err| debug!(%file_version, error = %err, "index failed validation"))
            .is_ok();
        index_ok && PersistedBloomFilter::load(&bloom).is_ok()
    }

    /// Drops every version of `segment`, in memory and on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed.
    pub fn remove(&self, segment: u64) -> CoreResult<()> {
        {
            let mut active = self.inner.active.write();
            let mut completed = self.inner.completed.write();
            active.remove(&segment);
            completed.remove(&segment);
        }
        let layout = &self.inner.layout;
        let mut versions: Vec<u32> = Vec::new();
        for extension in [
            layout.event_type().index_extension(),
            layout.event_type().bloom_extension(),
        ] {
            if let Some(found) = layout.scan(extension)?.remove(&segment) {
                versions.extend(found);
            }
        }
        versions.sort_unstable();
        versions.dedup();
        for version in versions {
            self.remove_version(FileVersion::new(segment, version))?;
        }
        Ok(())
    }

    /// Drops one version of a segment, in memory and on disk.
    ///
    /// If readers currently use that version the segment leaves the
    /// completed set.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed.
    pub fn remove_version(&self, file_version: FileVersion) -> CoreResult<()> {
        {
            let mut completed = self.inner.completed.write();
            if completed.get(&file_version.segment) == Some(&file_version.version) {
                completed.remove(&file_version.segment);
            }
        }
        self.evict(file_version);
        let layout = &self.inner.layout;
        remove_if_exists(&layout.index_file(file_version))?;
        remove_if_exists(&layout.bloom_file(file_version))?;
        debug!(context = %self.inner.context, %file_version, "index version removed");
        Ok(())
    }

    fn evict(&self, file_version: FileVersion) {
        if let Some(index) = self.inner.indexes.lock().pop(&file_version) {
            self.defer_close(index);
        }
        self.inner.blooms.lock().pop(&file_version);
    }

    fn defer_close(&self, index: Arc<SegmentIndex>) {
        let due = Instant::now() + self.inner.config.close_grace_period;
        self.inner.pending_close.lock().push((due, index));
    }

    /// Highest sequence number of an aggregate.
    ///
    /// Active then completed segments are scanned newest first, skipping
    /// segments that start after `max_token`, until a match or until
    /// `max_segments` segments were scanned. When local segments run out
    /// with budget left, a configured [`RemoteSequenceResolver`] gets the
    /// remaining budget.
    ///
    /// # Errors
    ///
    /// Returns an error if an index cannot be opened.
    pub fn get_last_sequence_number(
        &self,
        aggregate_id: &str,
        max_segments: usize,
        max_token: Token,
    ) -> CoreResult<Option<u64>> {
        let segments = self.segments_descending(max_token);
        let mut scanned = 0;
        let mut oldest = None;
        for segment in &segments {
            if scanned >= max_segments {
                return Ok(None);
            }
            scanned += 1;
            oldest = Some(segment.segment());
            if let Some(last) = self
                .entries_in(segment, aggregate_id)?
                .and_then(|entries| entries.last_sequence_number())
            {
                return Ok(Some(last));
            }
        }

        let remaining = max_segments - scanned;
        if remaining == 0 {
            return Ok(None);
        }
        let remote_max = match oldest {
            Some(0) => return Ok(None),
            Some(segment) => segment - 1,
            None => max_token,
        };
        let resolver = self.inner.remote.read().clone();
        match resolver {
            Some(resolver) => resolver.last_sequence_number(
                &self.inner.context,
                aggregate_id,
                remaining,
                remote_max,
            ),
            None => Ok(None),
        }
    }

    /// Entries of the newest segment holding the aggregate with a sequence
    /// number below `max_sequence_number`.
    ///
    /// # Errors
    ///
    /// Returns an error if an index cannot be opened.
    pub fn last_index_entries(
        &self,
        aggregate_id: &str,
        max_sequence_number: u64,
    ) -> CoreResult<Option<LocatedEntries>> {
        for segment in self.segments_descending(Token::MAX) {
            if let Some(entries) = self.entries_in(&segment, aggregate_id)? {
                let entries = entries.range(0, max_sequence_number, self.is_snapshot());
                if !entries.is_empty() {
                    return Ok(Some(LocatedEntries {
                        file_version: segment.file_version(),
                        entries,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Entries of an aggregate with `first_seq <= sequence < last_seq`,
    /// oldest segment first.
    ///
    /// Segments are scanned newest first and the scan stops once the oldest
    /// requested sequence number is found, `max_results` entries were
    /// collected, or a scanned segment starts below `min_token`. Snapshot
    /// engines return only the newest matching entry.
    ///
    /// # Errors
    ///
    /// Returns an error if an index cannot be opened.
    pub fn lookup_aggregate(
        &self,
        aggregate_id: &str,
        first_seq: u64,
        last_seq: u64,
        max_results: usize,
        min_token: Token,
    ) -> CoreResult<Vec<LocatedEntries>> {
        let snapshot = self.is_snapshot();
        let mut found = Vec::new();
        let mut collected = 0;
        for segment in self.segments_descending(Token::MAX) {
            if let Some(entries) = self.entries_in(&segment, aggregate_id)? {
                let entries = entries.range(first_seq, last_seq, snapshot);
                if let Some(first) = entries.first_sequence_number() {
                    collected += entries.len();
                    found.push(LocatedEntries {
                        file_version: segment.file_version(),
                        entries,
                    });
                    if first <= first_seq || collected >= max_results || snapshot {
                        break;
                    }
                }
            }
            if segment.segment() < min_token {
                break;
            }
        }
        found.reverse();
        Ok(found)
    }

    fn is_snapshot(&self) -> bool {
        self.inner.layout.event_type() == EventType::Snapshot
    }

    /// Active segments then completed segments, each newest first, holding
    /// both maps' locks together so a completing segment is seen exactly once.
    fn segments_descending(&self, max_token: Token) -> Vec<SegmentRef> {
        let active = self.inner.active.read();
        let completed = self.inner.completed.read();
        let mut segments: Vec<SegmentRef> = active
            .range(..=max_token)
            .rev()
            .map(|(segment, active)| SegmentRef::Active(*segment, Arc::clone(active)))
            .collect();
        segments.extend(
            completed
                .range(..=max_token)
                .rev()
                .map(|(segment, version)| SegmentRef::Completed(FileVersion::new(*segment, *version))),
        );
        segments
    }

    fn entries_in(&self, segment: &SegmentRef, aggregate_id: &str) -> CoreResult<Option<IndexEntries>> {
        match segment {
            SegmentRef::Active(_, active) => Ok(active.entries(aggregate_id)),
            SegmentRef::Completed(file_version) => {
                if !self.might_contain(*file_version, aggregate_id) {
                    self.inner.counters.bloom_skips.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                self.index(*file_version)?.lookup(aggregate_id)
            }
        }
    }

    /// Bloom gate. A missing or unreadable filter lets the lookup through.
    fn might_contain(&self, file_version: FileVersion, aggregate_id: &str) -> bool {
        if let Some(bloom) = self.inner.blooms.lock().get(&file_version) {
            return bloom.might_contain(aggregate_id);
        }
        match PersistedBloomFilter::load(&self.inner.layout.bloom_file(file_version)) {
            Ok(bloom) => {
                let bloom = Arc::new(bloom);
                self.inner.counters.bloom_loads.fetch_add(1, Ordering::Relaxed);
                self.inner.blooms.lock().put(file_version, Arc::clone(&bloom));
                bloom.might_contain(aggregate_id)
            }
            Err(err) => {
                warn!(
                    context = %self.inner.context,
                    %file_version,
                    error = %err,
                    "bloom filter unavailable, falling back to index"
                );
                true
            }
        }
    }

    /// Opens (or fetches from cache) the index of a completed segment version.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] once all attempts failed.
    pub fn index(&self, file_version: FileVersion) -> CoreResult<Arc<SegmentIndex>> {
        if let Some(index) = self.inner.indexes.lock().get(&file_version) {
            if !index.is_closed() {
                return Ok(Arc::clone(index));
            }
        }

        let mode = if self.is_hot(file_version.segment) {
            IndexMode::Resident
        } else {
            IndexMode::Streamed
        };
        let path = self.inner.layout.index_file(file_version);
        let attempts = self.inner.config.index_open_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match SegmentIndex::open(&path, file_version, mode) {
                Ok(index) => {
                    let index = Arc::new(index);
                    self.inner.counters.index_opens.fetch_add(1, Ordering::Relaxed);
                    if let Some(replaced) = self.inner.indexes.lock().put(file_version, Arc::clone(&index)) {
                        self.defer_close(replaced);
                    }
                    return Ok(index);
                }
                Err(err) => {
                    debug!(%file_version, attempt, error = %err, "index open failed");
                    let transient = err.is_transient();
                    last_error = Some(err);
                    if !transient {
                        break;
                    }
                }
            }
        }

        self.evict(file_version);
        let reason = last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string());
        warn!(context = %self.inner.context, %file_version, %reason, "index not found");
        Err(CoreError::index_not_found(file_version, reason))
    }

    /// Whether `segment` is among the newest `hot_index_segments` completed segments.
    fn is_hot(&self, segment: u64) -> bool {
        let hot = self.inner.config.hot_index_segments;
        if hot == 0 {
            return false;
        }
        let completed = self.inner.completed.read();
        completed
            .keys()
            .rev()
            .nth(hot - 1)
            .map_or(true, |floor| segment >= *floor)
    }

    /// Evicts cached indexes and bloom filters above the configured maxima,
    /// least recently used first, and closes evicted indexes whose grace
    /// period has passed.
    pub fn sweep(&self) {
        let now = Instant::now();
        let due = now + self.inner.config.close_grace_period;
        let mut evicted = Vec::new();
        {
            let mut indexes = self.inner.indexes.lock();
            while indexes.len() > self.inner.config.max_indexes_in_memory {
                match indexes.pop_lru() {
                    Some((_, index)) => evicted.push((due, index)),
                    None => break,
                }
            }
        }
        {
            let mut blooms = self.inner.blooms.lock();
            while blooms.len() > self.inner.config.max_bloom_filters_in_memory {
                if blooms.pop_lru().is_none() {
                    break;
                }
                self.inner.counters.bloom_evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        let closing: Vec<Arc<SegmentIndex>> = {
            let mut pending = self.inner.pending_close.lock();
            pending.extend(evicted);
            let (ready, waiting): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(deadline, _)| *deadline <= now);
            *pending = waiting;
            ready.into_iter().map(|(_, index)| index).collect()
        };
        for index in closing {
            index.close();
            self.inner.counters.index_closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Starts the background sweeper if it is not running.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start_cleanup(&self) -> CoreResult<()> {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }
        let (stop, ticks) = mpsc::channel::<()>();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.cleanup_interval;
        let handle = thread::Builder::new()
            .name(format!("chronoshift-index-sweep-{}", self.inner.context))
            .spawn(move || loop {
                match ticks.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match weak.upgrade() {
                        Some(inner) => IndexManager { inner }.sweep(),
                        None => break,
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        *sweeper = Some(Sweeper { stop, handle });
        Ok(())
    }

    /// Stops the background sweeper and closes every cached index.
    pub fn shutdown(&self) {
        stop_sweeper(&self.inner);
        let cached: Vec<Arc<SegmentIndex>> = {
            let mut indexes = self.inner.indexes.lock();
            let mut drained = Vec::with_capacity(indexes.len());
            while let Some((_, index)) = indexes.pop_lru() {
                drained.push(index);
            }
            drained
        };
        let pending: Vec<_> = self.inner.pending_close.lock().drain(..).collect();
        for index in cached.into_iter().chain(pending.into_iter().map(|(_, index)| index)) {
            index.close();
            self.inner.counters.index_closes.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.blooms.lock().clear();
    }

    /// Shuts down and forgets every segment; with `delete` set the index and
    /// bloom files are removed too.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed.
    pub fn cleanup(&self, delete: bool) -> CoreResult<()> {
        self.shutdown();
        let segments: Vec<u64> = {
            let mut active = self.inner.active.write();
            let mut completed = self.inner.completed.write();
            let segments = completed.keys().copied().collect();
            active.clear();
            completed.clear();
            segments
        };
        if delete {
            for segment in segments {
                self.remove(segment)?;
            }
        }
        Ok(())
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let counters = &self.inner.counters;
        IndexStats {
            active_segments: self.inner.active.read().len(),
            completed_segments: self.inner.completed.read().len(),
            open_indexes: self.inner.indexes.lock().len(),
            loaded_blooms: self.inner.blooms.lock().len(),
            pending_closes: self.inner.pending_close.lock().len(),
            index_opens: counters.index_opens.load(Ordering::Relaxed),
            index_closes: counters.index_closes.load(Ordering::Relaxed),
            bloom_loads: counters.bloom_loads.load(Ordering::Relaxed),
            bloom_evictions: counters.bloom_evictions.load(Ordering::Relaxed),
            bloom_skips: counters.bloom_skips.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("context", &self.inner.context)
            .field("event_type", &self.inner.layout.event_type())
            .finish_non_exhaustive()
    }
}

fn stop_sweeper(inner: &Inner) {
    let Some(sweeper) = inner.sweeper.lock().take() else {
        return;
    };
    let _ = sweeper.stop.send(());
    // The sweeper may itself drop the last handle; it exits on its own then.
    if sweeper.handle.thread().id() != thread::current().id() {
        let _ = sweeper.handle.join();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        stop_sweeper(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn manager(config: StorageConfig) -> (TempDir, IndexManager) {
        let dir = tempdir().unwrap();
        let layout = SegmentLayout::new(dir.path(), EventType::Event);
        (dir, IndexManager::new("default", layout, config))
    }

    fn complete_segment(manager: &IndexManager, segment: u64, aggregates: &[(&str, u64)]) {
        for (i, (aggregate, seq)) in aggregates.iter().enumerate() {
            manager
                .add_to_active_segment(segment, aggregate, IndexEntry::new(*seq, 13 + i as u32))
                .unwrap();
        }
        manager.complete(FileVersion::new(segment, 0)).unwrap();
    }

    #[test]
    fn active_segment_is_queryable_before_completion() {
        let (_dir, manager) = manager(StorageConfig::default());
        manager.add_to_active_segment(0, "a", IndexEntry::new(0, 13)).unwrap();
        manager.add_to_active_segment(0, "a", IndexEntry::new(1, 40)).unwrap();

        assert_eq!(manager.get_last_sequence_number("a", 10, u64::MAX).unwrap(), Some(1));
        assert_eq!(manager.active_segments(), vec![0]);
        assert_eq!(manager.stats().index_opens, 0);
    }

    #[test]
    fn completion_hands_off_segment() {
        let (_dir, manager) = manager(StorageConfig::default());
        complete_segment(&manager, 0, &[("a", 0), ("a", 1)]);

        assert!(manager.active_segments().is_empty());
        assert_eq!(manager.completed_segments(), vec![FileVersion::new(0, 0)]);
        assert!(manager.valid_index(FileVersion::new(0, 0)));
        assert!(matches!(
            manager.add_to_active_segment(0, "a", IndexEntry::new(2, 99)),
            Err(CoreError::SegmentAlreadyCompleted { segment: 0 })
        ));
        assert_eq!(manager.get_last_sequence_number("a", 10, u64::MAX).unwrap(), Some(1));
    }

    #[test]
    fn last_sequence_respects_token_hint_and_budget() {
        let (_dir, manager) = manager(StorageConfig::default());
        complete_segment(&manager, 0, &[("a", 0)]);
        complete_segment(&manager, 10, &[("b", 0)]);
        complete_segment(&manager, 20, &[("a", 1)]);

        assert_eq!(manager.get_last_sequence_number("a", 10, 19).unwrap(), Some(0));
        assert_eq!(manager.get_last_sequence_number("a", 1, 19).unwrap(), None);
        assert_eq!(manager.get_last_sequence_number("a", 10, u64::MAX).unwrap(), Some(1));
    }

    struct FixedResolver(Mutex<Vec<(usize, Token)>>);

    impl RemoteSequenceResolver for FixedResolver {
        fn last_sequence_number(
            &self,
            _context: &str,
            _aggregate_id: &str,
            max_segments: usize,
            max_token: Token,
        ) -> CoreResult<Option<u64>> {
            self.0.lock().push((max_segments, max_token));
            Ok(Some(42))
        }
    }

    #[test]
    fn remote_resolver_gets_remaining_budget() {
        let (_dir, manager) = manager(StorageConfig::default());
        complete_segment(&manager, 100, &[("b", 0)]);
        let resolver = Arc::new(FixedResolver(Mutex::new(Vec::new())));
        manager.set_remote_resolver(resolver.clone());

        assert_eq!(manager.get_last_sequence_number("a", 5, u64::MAX).unwrap(), Some(42));
        assert_eq!(resolver.0.lock().as_slice(), &[(4, 99)]);
    }

    #[test]
    fn lookup_stops_at_first_sequence() {
        let (_dir, manager) = manager(StorageConfig::default());
        complete_segment(&manager, 0, &[("a", 0), ("a", 1)]);
        complete_segment(&manager, 10, &[("a", 2), ("a", 3)]);
        complete_segment(&manager, 20, &[("a", 4)]);

        let found = manager.lookup_aggregate("a", 2, u64::MAX, usize::MAX, 0).unwrap();
        let segments: Vec<u64> = found.iter().map(|f| f.file_version.segment).collect();
        assert_eq!(segments, vec![10, 20]);

        let capped = manager.lookup_aggregate("a", 0, u64::MAX, 1, 0).unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].file_version.segment, 20);

        let bounded = manager.lookup_aggregate("a", 0, u64::MAX, usize::MAX, 15).unwrap();
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn bloom_filter_skips_index_open() {
        let (_dir, manager) = manager(StorageConfig::default().hot_index_segments(0));
        complete_segment(&manager, 0, &[("a", 0)]);

        assert_eq!(manager.get_last_sequence_number("absent", 1, u64::MAX).unwrap(), None);
        let stats = manager.stats();
        // a false positive would open the index; the filter holds one item
        assert!(stats.bloom_skips + stats.index_opens == 1);

        manager.get_last_sequence_number("a", 1, u64::MAX).unwrap();
        assert_eq!(manager.index(FileVersion::new(0, 0)).unwrap().mode(), IndexMode::Streamed);
    }

    #[test]
    fn new_version_keeps_old_one_valid() {
        let (_dir, manager) = manager(StorageConfig::default());
        complete_segment(&manager, 0, &[("a", 0)]);
        let mut entries = SegmentIndexEntries::new();
        entries.insert("a".into(), IndexEntries::from_entries(vec![IndexEntry::new(0, 77)]));

        let created = manager.create_new_version(0, 1, &entries).unwrap();
        assert!(manager.valid_index(created));
        assert!(manager.valid_index(FileVersion::new(0, 0)));
        assert_eq!(manager.current_version(0), Some(0));

        manager.activate_version(0, 1);
        let located = manager.last_index_entries("a", u64::MAX).unwrap().unwrap();
        assert_eq!(located.file_version, created);
        assert_eq!(located.entries.positions(), vec![77]);

        manager.remove_version(FileVersion::new(0, 0)).unwrap();
        assert!(!manager.valid_index(FileVersion::new(0, 0)));
        assert!(manager.valid_index(created));
    }

    #[test]
    fn missing_index_surfaces_after_retries() {
        let (dir, manager) = manager(StorageConfig::default());
        complete_segment(&manager, 0, &[("a", 0)]);
        let version = FileVersion::new(0, 0);
        std::fs::remove_file(manager.layout().index_file(version)).unwrap();

        let err = manager.get_last_sequence_number("a", 1, u64::MAX).unwrap_err();
        assert!(matches!(err, CoreError::IndexNotFound { .. }));
        assert_eq!(manager.stats().open_indexes, 0);
        drop(dir);
    }

    #[test]
    fn sweep_bounds_cached_indexes() {
        let config = StorageConfig::default()
            .max_indexes_in_memory(2)
            .max_bloom_filters_in_memory(2)
            .close_grace_period(Duration::ZERO);
        let (_dir, manager) = manager(config);
        for segment in 0..5 {
            complete_segment(&manager, segment * 10, &[("a", segment)]);
        }
        for segment in 0..5 {
            manager.index(FileVersion::new(segment * 10, 0)).unwrap();
        }
        assert_eq!(manager.stats().open_indexes, 5);

        let evicted = manager.index(FileVersion::new(0, 0)).unwrap();
        manager.sweep();
        let stats = manager.stats();
        assert!(stats.open_indexes <= 2);
        assert!(stats.loaded_blooms <= 2);
        assert_eq!(stats.index_closes, 3);
        // segment 0 was touched last, so it survives
        assert!(!evicted.is_closed());
    }

    #[test]
    fn grace_period_defers_close() {
        let config = StorageConfig::default()
            .max_indexes_in_memory(0)
            .close_grace_period(Duration::from_secs(60));
        let (_dir, manager) = manager(config);
        complete_segment(&manager, 0, &[("a", 0)]);
        let held = manager.index(FileVersion::new(0, 0)).unwrap();

        manager.sweep();
        assert_eq!(manager.stats().pending_closes, 1);
        assert!(held.lookup("a").unwrap().is_some());

        manager.shutdown();
        assert!(held.is_closed());
    }

    #[test]
    fn background_sweeper_runs_and_stops() {
        let config = StorageConfig::default()
            .max_indexes_in_memory(0)
            .cleanup_interval(Duration::from_millis(10))
            .close_grace_period(Duration::ZERO);
        let (_dir, manager) = manager(config);
        complete_segment(&manager, 0, &[("a", 0)]);
        manager.index(FileVersion::new(0, 0)).unwrap();
        manager.start_cleanup().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.stats().index_closes == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        manager.shutdown();
        assert_eq!(manager.stats().open_indexes, 0);
        assert!(manager.stats().index_closes >= 1);
    }

    #[test]
    fn concurrent_adds_race_completion_without_loss() {
        let (_dir, manager) = manager(StorageConfig::default());
        let added = AtomicU64::new(0);
        let accepted: Vec<u64> = thread::scope(|scope| {
            let writers: Vec<_> = (0..4)
                .map(|writer| {
                    let manager = &manager;
                    let added = &added;
                    scope.spawn(move || {
                        let aggregate = format!("agg-{writer}");
                        let mut sequence = 0;
                        loop {
                            let entry = IndexEntry::new(sequence, sequence as u32);
                            match manager.add_to_active_segment(0, &aggregate, entry) {
                                Ok(()) => {
                                    sequence += 1;
                                    added.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(CoreError::SegmentAlreadyCompleted { segment: 0 }) => break sequence,
                                Err(err) => panic!("unexpected error: {err}"),
                            }
                        }
                    })
                })
                .collect();

            let deadline = Instant::now() + Duration::from_secs(10);
            while added.load(Ordering::SeqCst) < 200 && Instant::now() < deadline {
                thread::yield_now();
            }
            manager.complete(FileVersion::new(0, 0)).unwrap();
            writers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let index = manager.index(FileVersion::new(0, 0)).unwrap();
        for (writer, count) in accepted.iter().enumerate() {
            let entries = index.lookup(&format!("agg-{writer}")).unwrap().unwrap_or_default();
            assert_eq!(entries.len() as u64, *count, "entries of agg-{writer}");
            if *count > 0 {
                assert_eq!(entries.last_sequence_number(), Some(count - 1));
            }
        }
        assert!(matches!(
            manager.add_to_active_segment(0, "late", IndexEntry::new(0, 0)),
            Err(CoreError::SegmentAlreadyCompleted { segment: 0 })
        ));
    }

    #[test]
    fn held_index_survives_concurrent_sweeps() {
        let config = StorageConfig::default()
            .max_indexes_in_memory(0)
            .max_bloom_filters_in_memory(0)
            .close_grace_period(Duration::from_secs(60));
        let (_dir, manager) = manager(config);
        complete_segment(&manager, 0, &[("a", 0), ("a", 1)]);
        complete_segment(&manager, 10, &[("b", 0)]);

        thread::scope(|scope| {
            let sweeper = scope.spawn(|| {
                for _ in 0..200 {
                    manager.sweep();
                    thread::yield_now();
                }
            });
            for _ in 0..200 {
                let held = manager.index(FileVersion::new(0, 0)).unwrap();
                manager.sweep();
                let entries = held.lookup("a").unwrap().unwrap();
                assert_eq!(entries.last_sequence_number(), Some(1));
                assert_eq!(manager.get_last_sequence_number("b", 10, u64::MAX).unwrap(), Some(0));
            }
            sweeper.join().unwrap();
        });

        assert_eq!(manager.stats().index_closes, 0);
        manager.shutdown();
    }

    #[test]
    fn init_discovers_existing_indexes() {
        let (dir, manager) = manager(StorageConfig::default());
        complete_segment(&manager, 0, &[("a", 0)]);
        manager.create_new_version(0, 2, &SegmentIndexEntries::new()).unwrap();
        complete_segment(&manager, 10, &[("b", 0)]);

        let reopened = IndexManager::new(
            "default",
            SegmentLayout::new(dir.path(), EventType::Event),
            StorageConfig::default(),
        );
        assert_eq!(reopened.init().unwrap(), 2);
        assert_eq!(reopened.current_version(0), Some(2));
    }

    #[test]
    fn remove_deletes_all_versions() {
        let (_dir, manager) = manager(StorageConfig::default());
        complete_segment(&manager, 0, &[("a", 0)]);
        manager.create_new_version(0, 1, &SegmentIndexEntries::new()).unwrap();

        manager.remove(0).unwrap();
        assert!(manager.completed_segments().is_empty());
        assert!(!manager.layout().index_file(FileVersion::new(0, 1)).exists());
        assert!(!manager.layout().bloom_file(FileVersion::new(0, 0)).exists());
    }
}
