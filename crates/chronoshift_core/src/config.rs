//! Storage and index engine configuration.

use std::time::Duration;

/// What an entry store does when a declared sequence skips ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceGapPolicy {
    /// Append anyway and log a warning; reads renumber contiguously.
    #[default]
    Accept,
    /// Fail the append with [`crate::CoreError::SequenceGap`].
    Reject,
}

/// Configuration shared by the segment store, the index engine and the
/// transformation entry stores of a context.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Target false-positive probability of segment bloom filters.
    pub bloom_false_positive_rate: f64,

    /// Completed indexes kept open before the sweep evicts the oldest.
    pub max_indexes_in_memory: usize,

    /// Bloom filters kept loaded before the sweep evicts the oldest.
    pub max_bloom_filters_in_memory: usize,

    /// Number of newest completed segments whose indexes load fully resident.
    /// Older segments are opened in streamed mode.
    pub hot_index_segments: usize,

    /// Interval between background eviction sweeps.
    pub cleanup_interval: Duration,

    /// Delay between evicting an index and closing it.
    pub close_grace_period: Duration,

    /// Attempts made to open an index before giving up.
    pub index_open_retries: u32,

    /// Whether appends and rewrites are fsynced.
    pub sync_on_write: bool,

    /// Handling of entry-store sequence gaps.
    pub sequence_gap_policy: SequenceGapPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bloom_false_positive_rate: 0.03,
            max_indexes_in_memory: 50,
            max_bloom_filters_in_memory: 100,
            hot_index_segments: 50,
            cleanup_interval: Duration::from_secs(10),
            close_grace_period: Duration::from_secs(2),
            index_open_retries: 3,
            sync_on_write: true,
            sequence_gap_policy: SequenceGapPolicy::Accept,
        }
    }
}

impl StorageConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bloom filter false-positive probability.
    #[must_use]
    pub const fn bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_false_positive_rate = rate;
        self
    }

    /// Sets the maximum number of open completed indexes.
    #[must_use]
    pub const fn max_indexes_in_memory(mut self, max: usize) -> Self {
        self.max_indexes_in_memory = max;
        self
    }

    /// Sets the maximum number of loaded bloom filters.
    #[must_use]
    pub const fn max_bloom_filters_in_memory(mut self, max: usize) -> Self {
        self.max_bloom_filters_in_memory = max;
        self
    }

    /// Sets how many newest segments are indexed resident.
    #[must_use]
    pub const fn hot_index_segments(mut self, count: usize) -> Self {
        self.hot_index_segments = count;
        self
    }

    /// Sets the eviction sweep interval.
    #[must_use]
    pub const fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Sets the deferred close grace period.
    #[must_use]
    pub const fn close_grace_period(mut self, grace: Duration) -> Self {
        self.close_grace_period = grace;
        self
    }

    /// Sets the number of index open attempts.
    #[must_use]
    pub const fn index_open_retries(mut self, retries: u32) -> Self {
        self.index_open_retries = retries;
        self
    }

    /// Sets whether writes are fsynced.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets the entry-store sequence gap policy.
    #[must_use]
    pub const fn sequence_gap_policy(mut self, policy: SequenceGapPolicy) -> Self {
        self.sequence_gap_policy = policy;
        self
    }
}
