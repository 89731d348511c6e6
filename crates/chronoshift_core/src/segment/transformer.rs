//! Rewrites one completed segment into a new version.

use super::reader::{SegmentReader, StoredEvent};
use super::record::TransactionRecord;
use super::writer::SegmentWriter;
use super::HEADER_SIZE;
use crate::error::{CoreError, CoreResult};
use crate::event::Event;
use crate::index::IndexManager;
use crate::layout::SegmentLayout;
use crate::types::{FileVersion, Token};
use chronoshift_storage::fs::{promote, remove_if_exists};
use chronoshift_storage::FileBackend;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Lifecycle of a [`SegmentTransformer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformerState {
    /// Created, no file allocated yet.
    Pending,
    /// Temporary file open, accepting replacements.
    Running,
    /// New version promoted and indexed.
    Completed(FileVersion),
    /// Rolled back or cancelled; the temporary file is gone.
    Aborted,
}

/// Result of one [`SegmentTransformer::transform_event`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteProgress {
    /// The token that was supplied.
    pub token: Token,
    /// Whether an original event was substituted at that token.
    pub replaced: bool,
}

struct OpenTransaction {
    version: u8,
    originals: VecDeque<StoredEvent>,
    output: Vec<Event>,
}

struct Run {
    reader: SegmentReader,
    writer: SegmentWriter,
    temp: PathBuf,
    offset: u64,
    next_token: Token,
    current: Option<OpenTransaction>,
    exhausted: bool,
    replaced: usize,
}

impl Run {
    /// Moves to the next original event, loading a transaction if needed.
    fn next_original(&mut self) -> CoreResult<Option<StoredEvent>> {
        if self.current.is_none() && !self.exhausted {
            match self.reader.read_transaction(self.offset, self.next_token)? {
                Some((tx, next_offset)) => {
                    self.offset = next_offset;
                    self.current = Some(OpenTransaction {
                        version: tx.version,
                        output: Vec::with_capacity(tx.events.len()),
                        originals: tx.events.into(),
                    });
                }
                None => self.exhausted = true,
            }
        }
        Ok(self
            .current
            .as_mut()
            .and_then(|tx| tx.originals.pop_front()))
    }

    /// Pushes an output event and flushes the transaction once all of its
    /// original events were matched.
    fn emit(&mut self, token: Token, event: Event) -> CoreResult<()> {
        self.next_token = token + 1;
        let Some(tx) = self.current.as_mut() else {
            return Err(CoreError::invalid_operation("no open transaction"));
        };
        tx.output.push(event);
        if tx.originals.is_empty() {
            if let Some(tx) = self.current.take() {
                self.writer.append_record(&TransactionRecord {
                    version: tx.version,
                    events: tx.output,
                })?;
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> CoreResult<()> {
        while let Some(original) = self.next_original()? {
            self.emit(original.token, original.event)?;
        }
        Ok(())
    }
}

/// Produces a new version of a completed segment.
///
/// Replacements are fed in ascending token order through
/// [`transform_event`](Self::transform_event); every original event up to
/// that token is copied unchanged, preserving transaction boundaries. The new
/// file is written next to the target as `.tmp`, and
/// [`complete_segment`](Self::complete_segment) indexes it before renaming it
/// into place, so a version becomes visible only once all its files exist.
///
/// ```text
/// Pending --initialize--> Running --complete_segment--> Completed
///                            |
///                            +--rollback / cancel--> Aborted
/// ```
pub struct SegmentTransformer {
    context: String,
    layout: SegmentLayout,
    index_manager: IndexManager,
    source: FileVersion,
    target: FileVersion,
    sync: bool,
    state: TransformerState,
    run: Option<Run>,
}

impl SegmentTransformer {
    /// Prepares a rewrite of `source` into version `target_version`.
    #[must_use]
    pub fn new(
        context: impl Into<String>,
        layout: SegmentLayout,
        index_manager: IndexManager,
        source: FileVersion,
        target_version: u32,
        sync: bool,
    ) -> Self {
        Self {
            context: context.into(),
            layout,
            index_manager,
            source,
            target: FileVersion::new(source.segment, target_version),
            sync,
            state: TransformerState::Pending,
            run: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TransformerState {
        self.state
    }

    /// The version being produced.
    #[must_use]
    pub const fn target(&self) -> FileVersion {
        self.target
    }

    /// Number of events substituted so far.
    #[must_use]
    pub fn replaced(&self) -> usize {
        self.run.as_ref().map_or(0, |run| run.replaced)
    }

    /// Opens the source segment and a fresh temporary file for the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the transformer is not pending, the target version
    /// is not newer than the source, or a file cannot be opened.
    pub fn initialize(&mut self) -> CoreResult<()> {
        if self.state != TransformerState::Pending {
            return Err(self.wrong_state("pending"));
        }
        if self.target.version <= self.source.version {
            return Err(CoreError::invalid_operation(format!(
                "target {} is not newer than source {}",
                self.target, self.source
            )));
        }
        let reader = SegmentReader::open_file(&self.layout.data_file(self.source))?;
        let temp = SegmentLayout::temp_of(&self.layout.data_file(self.target));
        if remove_if_exists(&temp)? {
            debug!(context = %self.context, path = %temp.display(), "removed stale rewrite file");
        }
        let writer = SegmentWriter::create(Box::new(FileBackend::create_new(&temp)?), self.source.segment)?;
        self.run = Some(Run {
            reader,
            writer,
            temp,
            offset: HEADER_SIZE,
            next_token: self.source.segment,
            current: None,
            exhausted: false,
            replaced: 0,
        });
        self.state = TransformerState::Running;
        debug!(context = %self.context, source = %self.source, target = %self.target, "segment rewrite started");
        Ok(())
    }

    /// Substitutes `event` at `token`, copying every earlier original event.
    ///
    /// A token that was already passed, or lies beyond the segment, is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the transformer is not running or I/O fails.
    pub fn transform_event(&mut self, event: Event, token: Token) -> CoreResult<RewriteProgress> {
        let run = self.running()?;
        let ignored = RewriteProgress {
            token,
            replaced: false,
        };
        if token < run.next_token {
            debug!(token, next = run.next_token, "replacement for a passed token ignored");
            return Ok(ignored);
        }
        let mut replacement = Some(event);
        while let Some(original) = run.next_original()? {
            if original.token == token {
                let event = replacement.take().unwrap_or(original.event);
                run.emit(token, event)?;
                run.replaced += 1;
                return Ok(RewriteProgress {
                    token,
                    replaced: true,
                });
            }
            run.emit(original.token, original.event)?;
        }
        debug!(token, "replacement beyond the end of the segment ignored");
        Ok(ignored)
    }

    /// Copies the rest of the segment, indexes the new version and promotes it.
    ///
    /// On failure the rewrite is rolled back before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the transformer is not running or any write fails.
    pub fn complete_segment(&mut self) -> CoreResult<FileVersion> {
        self.running()?;
        match self.finish_run() {
            Ok(replaced) => {
                self.state = TransformerState::Completed(self.target);
                debug!(
                    context = %self.context,
                    target = %self.target,
                    replaced,
                    "segment rewrite completed"
                );
                Ok(self.target)
            }
            Err(err) => {
                self.rollback(&err);
                Err(err)
            }
        }
    }

    fn finish_run(&mut self) -> CoreResult<usize> {
        let mut run = self
            .run
            .take()
            .ok_or_else(|| CoreError::invalid_operation("rewrite not running"))?;
        let temp = run.temp.clone();
        let result = (|| -> CoreResult<usize> {
            run.drain()?;
            if run.current.is_some() {
                return Err(CoreError::segment_corruption(format!(
                    "segment {} ended inside a transaction",
                    self.source.segment
                )));
            }
            let replaced = run.replaced;
            let written = run.writer.finish(self.sync)?;
            self.index_manager.create_new_version(
                self.target.segment,
                self.target.version,
                &written.entries,
            )?;
            promote(&temp, &self.layout.data_file(self.target))?;
            Ok(replaced)
        })();
        if result.is_err() {
            let _ = remove_if_exists(&temp);
        }
        result
    }

    /// Discards the rewrite after a failure. Idempotent.
    pub fn rollback(&mut self, cause: &dyn fmt::Display) {
        if self.abort() {
            warn!(
                context = %self.context,
                target = %self.target,
                %cause,
                "segment rewrite rolled back"
            );
        }
    }

    /// Discards the rewrite on request. Idempotent.
    pub fn cancel(&mut self) {
        if self.abort() {
            debug!(context = %self.context, target = %self.target, "segment rewrite cancelled");
        }
    }

    fn abort(&mut self) -> bool {
        if matches!(self.state, TransformerState::Completed(_) | TransformerState::Aborted) {
            return false;
        }
        if let Some(run) = self.run.take() {
            let temp = run.temp.clone();
            drop(run);
            if let Err(err) = remove_if_exists(&temp) {
                warn!(path = %temp.display(), error = %err, "could not remove rewrite file");
            }
        }
        if let Err(err) = self.index_manager.remove_version(self.target) {
            warn!(target = %self.target, error = %err, "could not remove index of discarded version");
        }
        self.state = TransformerState::Aborted;
        true
    }

    fn running(&mut self) -> CoreResult<&mut Run> {
        if self.state != TransformerState::Running {
            return Err(self.wrong_state("running"));
        }
        self.run
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("rewrite not running"))
    }

    fn wrong_state(&self, expected: &str) -> CoreError {
        CoreError::invalid_operation(format!(
            "segment transformer for {} is {:?}, expected {expected}",
            self.target, self.state
        ))
    }
}

impl Drop for SegmentTransformer {
    fn drop(&mut self) {
        if self.state == TransformerState::Running {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::event::SerializedObject;
    use crate::types::EventType;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        layout: SegmentLayout,
        manager: IndexManager,
    }

    fn event(aggregate: &str, seq: u64) -> Event {
        Event::new(aggregate, seq, SerializedObject::new("Evt", vec![seq as u8]))
    }

    /// Segment 100 with transactions [100, 101], [102], [103, 104].
    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let layout = SegmentLayout::new(dir.path(), EventType::Event);
        let manager = IndexManager::new("default", layout.clone(), StorageConfig::default());
        let source = FileVersion::new(100, 0);
        let backend = FileBackend::create_new(&layout.data_file(source)).unwrap();
        let mut writer = SegmentWriter::create(Box::new(backend), 100).unwrap();
        writer.append(&[event("a", 0), event("b", 0)]).unwrap();
        writer.append(&[event("a", 1)]).unwrap();
        writer.append(&[event("a", 2), event("b", 1)]).unwrap();
        let written = writer.finish(false).unwrap();
        for (aggregate, entries) in &written.entries {
            manager.add_all_to_active_segment(100, aggregate, entries).unwrap();
        }
        manager.complete(source).unwrap();
        Fixture {
            _dir: dir,
            layout,
            manager,
        }
    }

    fn transformer(fixture: &Fixture) -> SegmentTransformer {
        SegmentTransformer::new(
            "default",
            fixture.layout.clone(),
            fixture.manager.clone(),
            FileVersion::new(100, 0),
            1,
            false,
        )
    }

    fn read_all(fixture: &Fixture, version: FileVersion) -> Vec<StoredEvent> {
        let reader = SegmentReader::open_file(&fixture.layout.data_file(version)).unwrap();
        reader.events().collect::<CoreResult<_>>().unwrap()
    }

    #[test]
    fn substitutes_at_tokens_and_keeps_the_rest() {
        let fixture = fixture();
        let original = read_all(&fixture, FileVersion::new(100, 0));
        let mut transformer = transformer(&fixture);
        transformer.initialize().unwrap();

        let deleted = original[1].event.nullified();
        assert!(transformer.transform_event(deleted.clone(), 101).unwrap().replaced);
        let replaced = original[3].event.merged(&event("x", 9));
        assert!(transformer.transform_event(replaced.clone(), 103).unwrap().replaced);
        let target = transformer.complete_segment().unwrap();
        assert_eq!(target, FileVersion::new(100, 1));
        assert_eq!(transformer.state(), TransformerState::Completed(target));

        let rewritten = read_all(&fixture, target);
        assert_eq!(rewritten.len(), original.len());
        assert_eq!(rewritten[1].event, deleted);
        assert_eq!(rewritten[3].event, replaced);
        for i in [0, 2, 4] {
            assert_eq!(rewritten[i].event, original[i].event);
            assert_eq!(rewritten[i].token, original[i].token);
        }
        assert!(fixture.manager.valid_index(target));
        assert!(fixture.manager.valid_index(FileVersion::new(100, 0)));
    }

    #[test]
    fn passed_and_out_of_range_tokens_are_ignored() {
        let fixture = fixture();
        let mut transformer = transformer(&fixture);
        transformer.initialize().unwrap();

        assert!(transformer.transform_event(event("a", 1), 102).unwrap().replaced);
        assert!(!transformer.transform_event(event("a", 0), 100).unwrap().replaced);
        assert!(!transformer.transform_event(event("z", 0), 500).unwrap().replaced);
        assert_eq!(transformer.replaced(), 1);
        let target = transformer.complete_segment().unwrap();
        assert_eq!(read_all(&fixture, target).len(), 5);
    }

    #[test]
    fn rollback_removes_temporary_file() {
        let fixture = fixture();
        let mut transformer = transformer(&fixture);
        transformer.initialize().unwrap();
        transformer.transform_event(event("a", 0), 100).unwrap();

        let temp = SegmentLayout::temp_of(&fixture.layout.data_file(transformer.target()));
        assert!(temp.exists());
        transformer.rollback(&"disk full");
        assert!(!temp.exists());
        assert_eq!(transformer.state(), TransformerState::Aborted);
        assert!(!fixture.layout.data_file(transformer.target()).exists());
        assert!(transformer.complete_segment().is_err());
        transformer.cancel();
    }

    #[test]
    fn drop_while_running_cleans_up() {
        let fixture = fixture();
        let temp;
        {
            let mut transformer = transformer(&fixture);
            transformer.initialize().unwrap();
            temp = SegmentLayout::temp_of(&fixture.layout.data_file(transformer.target()));
        }
        assert!(!temp.exists());
    }

    #[test]
    fn target_must_be_newer() {
        let fixture = fixture();
        let mut transformer = SegmentTransformer::new(
            "default",
            fixture.layout.clone(),
            fixture.manager.clone(),
            FileVersion::new(100, 0),
            0,
            false,
        );
        assert!(transformer.initialize().is_err());
    }
}
