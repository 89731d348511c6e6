//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How a [`FileBackend`] opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open for reading and appending, creating the file if absent.
    ReadWrite,
    /// Create a fresh file; fails if one already exists.
    CreateNew,
    /// Open an existing file for reading only.
    ReadOnly,
}

/// A storage backend on top of a single OS file.
///
/// Segment data files are opened [`OpenMode::ReadOnly`] once completed, while
/// rewritten versions are produced through [`OpenMode::CreateNew`] on a
/// temporary path and promoted afterwards.
///
/// # Durability
///
/// - `flush()` pushes buffered data to the OS
/// - `sync()` calls `File::sync_all()`
/// - `truncate()` syncs immediately, since it is used to cut torn tails
///
/// # Example
///
/// ```no_run
/// use chronoshift_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("entries.log")).unwrap();
/// backend.append(b"record").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    mode: OpenMode,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens or creates a read-write backend at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_mode(path, OpenMode::ReadWrite)
    }

    /// Opens an existing file for reading only.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the file does not exist.
    pub fn open_existing(path: &Path) -> StorageResult<Self> {
        Self::open_with_mode(path, OpenMode::ReadOnly)
    }

    /// Creates a brand new file, failing if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an I/O error of kind `AlreadyExists` if the path is taken.
    pub fn create_new(path: &Path) -> StorageResult<Self> {
        Self::open_with_mode(path, OpenMode::CreateNew)
    }

    /// Opens or creates a read-write backend, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Opens `path` in the given mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened in that mode.
    pub fn open_with_mode(path: &Path, mode: OpenMode) -> StorageResult<Self> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::ReadWrite => options.read(true).write(true).create(true).truncate(false),
            OpenMode::CreateNew => options.read(true).write(true).create_new(true),
            OpenMode::ReadOnly => options.read(true),
        };
        let file = options.open(path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.to_path_buf()),
            _ => StorageError::Io(err),
        })?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            mode,
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the mode the file was opened with.
    #[must_use]
    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StorageError::ReadOnly(self.path.clone()));
        }
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        // Seeking mutates the shared cursor, so readers serialize here.
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.ensure_writable()?;
        let mut size = self.size.write();
        let offset = *size;
        if data.is_empty() {
            return Ok(offset);
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.mode == OpenMode::ReadOnly {
            return Ok(());
        }
        self.file.write().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.mode == OpenMode::ReadOnly {
            return Ok(());
        }
        self.file.write().sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.ensure_writable()?;
        let mut size = self.size.write();
        if new_size > *size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: *size,
            });
        }

        let file = self.file.write();
        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;
        Ok(())
    }
}
