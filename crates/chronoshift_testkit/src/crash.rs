//! Crash simulation for byte backends.
//!
//! [`CrashableBackend`] wraps any [`StorageBackend`] and fails writes after a
//! byte budget, leaving a partial record behind exactly like a process that
//! died mid-`write`. It is controlled through a shared [`CrashSwitch`], so the
//! test keeps control after the backend was moved into an entry store.
//!
//! [`EntryLogCrashHarness`] runs the standard recovery scenarios against
//! [`TransformationEntryStore`].

use chronoshift_core::{StorageConfig, TransformationEntry, TransformationEntryStore};
use chronoshift_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Controls {
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

/// Shared control handle of a [`CrashableBackend`].
#[derive(Debug, Clone)]
pub struct CrashSwitch {
    controls: Arc<Controls>,
}

impl CrashSwitch {
    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: usize) {
        let written = self.controls.bytes_written.load(Ordering::SeqCst);
        self.controls
            .crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Sets whether `flush` and `sync` fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.controls.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Clears the crash state; writes succeed again.
    pub fn reset(&self) {
        self.controls.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.controls.crashed.store(false, Ordering::SeqCst);
        self.controls.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Whether a simulated crash happened.
    pub fn has_crashed(&self) -> bool {
        self.controls.crashed.load(Ordering::SeqCst)
    }

    /// Bytes accepted by the backend so far.
    pub fn bytes_written(&self) -> usize {
        self.controls.bytes_written.load(Ordering::SeqCst)
    }
}

/// A storage backend wrapper that can simulate crashes.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    controls: Arc<Controls>,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            controls: Arc::new(Controls {
                crash_after_bytes: AtomicUsize::new(usize::MAX),
                bytes_written: AtomicUsize::new(0),
                crashed: AtomicBool::new(false),
                fail_on_sync: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a handle controlling this backend.
    pub fn switch(&self) -> CrashSwitch {
        CrashSwitch {
            controls: Arc::clone(&self.controls),
        }
    }

    fn crash(&self, what: &str) -> StorageError {
        self.controls.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let current = self.controls.bytes_written.load(Ordering::SeqCst);
        let threshold = self.controls.crash_after_bytes.load(Ordering::SeqCst);

        if current >= threshold {
            return Err(self.crash("write"));
        }

        // Write the part that fits before the crash point
        if current + data.len() > threshold {
            let partial = threshold - current;
            if partial > 0 {
                self.inner.append(&data[..partial])?;
                self.controls.bytes_written.fetch_add(partial, Ordering::SeqCst);
            }
            return Err(self.crash("partial write"));
        }

        let offset = self.inner.append(data)?;
        self.controls.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.controls.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.controls.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// Result of one crash recovery scenario.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Scenario name.
    pub name: String,
    /// Whether recovery produced the expected entries.
    pub passed: bool,
    /// Entries expected after recovery.
    pub expected_entries: usize,
    /// Entries found after recovery.
    pub actual_entries: usize,
    /// Error, if the scenario could not run.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    fn check(name: &str, expected: usize, actual: usize) -> Self {
        Self {
            name: name.to_string(),
            passed: expected == actual,
            expected_entries: expected,
            actual_entries: actual,
            error: None,
        }
    }

    fn error(name: &str, expected: usize, error: impl std::fmt::Display) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            expected_entries: expected,
            actual_entries: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Crash recovery scenarios for transformation entry logs.
///
/// Every scenario writes through a [`CrashableBackend`] over a shared
/// [`InMemoryBackend`], crashes, then reopens a fresh store over the
/// surviving bytes.
#[derive(Debug, Default)]
pub struct EntryLogCrashHarness {
    results: Vec<CrashRecoveryResult>,
}

impl EntryLogCrashHarness {
    /// Creates a harness.
    pub fn new() -> Self {
        Self::default()
    }

    fn config() -> StorageConfig {
        StorageConfig::default()
    }

    fn write(store: &TransformationEntryStore, count: u64) -> Result<(), String> {
        for sequence in 0..count {
            let entry = TransformationEntry::delete(sequence, sequence * 10).map_err(|e| e.to_string())?;
            store.store(&entry).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn reopen(bytes: &InMemoryBackend) -> Result<TransformationEntryStore, String> {
        TransformationEntryStore::with_backend(Box::new(bytes.clone()), &Self::config())
            .map_err(|e| e.to_string())
    }

    /// Stored entries survive a crash in the middle of the next append.
    pub fn test_torn_append(&mut self) -> CrashRecoveryResult {
        let name = "torn_append";
        let bytes = InMemoryBackend::new();
        let backend = CrashableBackend::new(Box::new(bytes.clone()));
        let switch = backend.switch();
        let result = (|| -> Result<usize, String> {
            let store = TransformationEntryStore::with_backend(Box::new(backend), &Self::config())
                .map_err(|e| e.to_string())?;
            Self::write(&store, 3)?;
            switch.crash_after(7);
            let torn = TransformationEntry::delete(3, 30).map_err(|e| e.to_string())?;
            if store.store(&torn).is_ok() || !switch.has_crashed() {
                return Err("append did not crash".to_string());
            }
            Ok(Self::reopen(&bytes)?.len())
        })();
        self.record(name, 3, result)
    }

    /// A store reopened after a torn append accepts the next entry.
    pub fn test_append_after_torn_tail(&mut self) -> CrashRecoveryResult {
        let name = "append_after_torn_tail";
        let bytes = InMemoryBackend::new();
        let backend = CrashableBackend::new(Box::new(bytes.clone()));
        let switch = backend.switch();
        let result = (|| -> Result<usize, String> {
            let store = TransformationEntryStore::with_backend(Box::new(backend), &Self::config())
                .map_err(|e| e.to_string())?;
            Self::write(&store, 2)?;
            switch.crash_after(20);
            let _ = store.store(&TransformationEntry::delete(2, 20).map_err(|e| e.to_string())?);
            drop(store);

            let store = Self::reopen(&bytes)?;
            store
                .store(&TransformationEntry::delete(2, 25).map_err(|e| e.to_string())?)
                .map_err(|e| e.to_string())?;
            Ok(Self::reopen(&bytes)?.len())
        })();
        self.record(name, 3, result)
    }

    /// Entries written after the last sync are lost on power loss, earlier
    /// ones are not.
    pub fn test_power_loss(&mut self) -> CrashRecoveryResult {
        let name = "power_loss";
        let bytes = InMemoryBackend::new();
        let result = (|| -> Result<usize, String> {
            let synced = TransformationEntryStore::with_backend(Box::new(bytes.clone()), &Self::config())
                .map_err(|e| e.to_string())?;
            Self::write(&synced, 2)?;
            drop(synced);

            let unsynced_config = Self::config().sync_on_write(false);
            let store = TransformationEntryStore::with_backend(Box::new(bytes.clone()), &unsynced_config)
                .map_err(|e| e.to_string())?;
            store
                .store(&TransformationEntry::delete(2, 20).map_err(|e| e.to_string())?)
                .map_err(|e| e.to_string())?;
            drop(store);

            bytes.lose_unsynced();
            Ok(Self::reopen(&bytes)?.len())
        })();
        self.record(name, 2, result)
    }

    /// A failed sync leaves the entry out of the running store.
    pub fn test_failed_sync(&mut self) -> CrashRecoveryResult {
        let name = "failed_sync";
        let bytes = InMemoryBackend::new();
        let backend = CrashableBackend::new(Box::new(bytes.clone()));
        let switch = backend.switch();
        let result = (|| -> Result<usize, String> {
            let store = TransformationEntryStore::with_backend(Box::new(backend), &Self::config())
                .map_err(|e| e.to_string())?;
            Self::write(&store, 1)?;
            switch.set_fail_on_sync(true);
            if store
                .store(&TransformationEntry::delete(1, 10).map_err(|e| e.to_string())?)
                .is_ok()
            {
                return Err("sync did not fail".to_string());
            }
            switch.reset();
            store
                .store(&TransformationEntry::delete(1, 15).map_err(|e| e.to_string())?)
                .map_err(|e| e.to_string())?;
            let last = store.last_entry().map_err(|e| e.to_string())?;
            let token = last
                .ok_or("no last entry")?
                .op()
                .map_err(|e| e.to_string())?
                .token();
            if token != 15 {
                return Err(format!("unexpected last token {token}"));
            }
            Ok(store.len())
        })();
        self.record(name, 2, result)
    }

    fn record(&mut self, name: &str, expected: usize, outcome: Result<usize, String>) -> CrashRecoveryResult {
        let result = match outcome {
            Ok(actual) => CrashRecoveryResult::check(name, expected, actual),
            Err(error) => CrashRecoveryResult::error(name, expected, error),
        };
        self.results.push(result.clone());
        result
    }

    /// Runs every scenario.
    pub fn run_all_tests(&mut self) -> &[CrashRecoveryResult] {
        self.test_torn_append();
        self.test_append_after_torn_tail();
        self.test_power_loss();
        self.test_failed_sync();
        &self.results
    }

    /// Results so far.
    pub fn results(&self) -> &[CrashRecoveryResult] {
        &self.results
    }

    /// Whether every scenario passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// One line per scenario.
    pub fn summary(&self) -> String {
        self.results
            .iter()
            .map(|r| {
                let status = if r.passed { "PASS" } else { "FAIL" };
                match &r.error {
                    Some(error) => format!("[{status}] {}: {error}", r.name),
                    None => format!(
                        "[{status}] {}: expected {} entries, found {}",
                        r.name, r.expected_entries, r.actual_entries
                    ),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crashable_backend_normal_operation() {
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()));

        let data = b"test data";
        let offset = backend.append(data).unwrap();
        backend.flush().unwrap();

        assert_eq!(backend.read_at(offset, data.len()).unwrap(), data);
        assert_eq!(backend.switch().bytes_written(), data.len());
    }

    #[test]
    fn test_crashable_backend_partial_write() {
        let inner = InMemoryBackend::new();
        let mut backend = CrashableBackend::new(Box::new(inner.clone()));
        let switch = backend.switch();

        backend.append(&[1u8; 5]).unwrap();
        switch.crash_after(3);
        assert!(backend.append(&[2u8; 10]).is_err());
        assert!(switch.has_crashed());
        assert_eq!(inner.data(), vec![1, 1, 1, 1, 1, 2, 2, 2]);

        // Nothing more gets through until reset
        assert!(backend.append(&[3u8]).is_err());
        switch.reset();
        backend.append(&[3u8]).unwrap();
    }

    #[test]
    fn test_crashable_backend_fails_sync() {
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()));
        let switch = backend.switch();

        switch.set_fail_on_sync(true);
        assert!(backend.sync().is_err());
        assert!(backend.flush().is_err());
        assert!(switch.has_crashed());
    }

    #[test]
    fn test_all_crash_recovery_scenarios() {
        let mut harness = EntryLogCrashHarness::new();
        harness.run_all_tests();
        assert!(harness.all_passed(), "{}", harness.summary());
        assert_eq!(harness.results().len(), 4);
    }
}
