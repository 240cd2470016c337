//! Plain file backend using positional reads and writes.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{debug, trace, warn};

use super::{Access, Backend, BackendFactory, LOCK_DELAY, LockMode, WriterClaim, WriterRegistry};
use crate::error::{BackendError, LockError, Result};

/// Creates [`FileBackend`]s sharing one [`WriterRegistry`].
#[derive(Debug, Clone, Default)]
pub struct FileBackendFactory {
    registry: WriterRegistry,
}

impl FileBackendFactory {
    /// Creates a factory with its own registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory that shares `registry` with other factories.
    pub fn with_registry(registry: WriterRegistry) -> Self {
        Self { registry }
    }

    /// Registry of paths open for writing through this factory.
    pub fn registry(&self) -> &WriterRegistry {
        &self.registry
    }
}

impl BackendFactory for FileBackendFactory {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&self, path: &Path, access: Access, lock_mode: LockMode) -> Result<Box<dyn Backend>> {
        let backend = FileBackend::open(path, access, lock_mode, &self.registry)?;
        Ok(Box::new(backend))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// A file handle plus the write claim and OS lock that go with it.
///
/// Shared by the plain and memory-mapped file backends.
#[derive(Debug)]
pub(crate) struct LockedFile {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    writable: bool,
    locked: bool,
    claim: Option<WriterClaim>,
}

impl LockedFile {
    /// Opens `path`, claiming it in `registry` and locking it when writable.
    pub(crate) fn open(
        path: &Path,
        access: Access,
        lock_mode: LockMode,
        registry: &WriterRegistry,
    ) -> Result<Self> {
        if access != Access::Create && !path.is_file() {
            return Err(BackendError::Missing {
                path: path.to_path_buf(),
            }
            .into());
        }

        let writable = access.is_writable();
        let claim = if writable {
            Some(registry.claim(path)?)
        } else {
            None
        };

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(access == Access::Create)
            .truncate(false)
            .open(path)
            .map_err(|source| BackendError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let locked = if writable {
            Self::lock(&file, path, lock_mode)?
        } else {
            false
        };

        debug!(path = %path.display(), ?access, ?lock_mode, "opened file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable,
            locked,
            claim,
        })
    }

    /// Applies `lock_mode`, returning whether an OS lock is now held.
    fn lock(file: &File, path: &Path, lock_mode: LockMode) -> Result<bool> {
        match lock_mode {
            LockMode::NoLocks => Ok(false),
            LockMode::ExceptionIfLocked => match file.try_lock() {
                Ok(()) => Ok(true),
                Err(TryLockError::WouldBlock) => Err(LockError::Contended {
                    path: path.to_path_buf(),
                }
                .into()),
                Err(TryLockError::Error(source)) => Err(LockError::Failed {
                    path: path.to_path_buf(),
                    source,
                }
                .into()),
            },
            LockMode::WaitIfLocked => loop {
                match file.try_lock() {
                    Ok(()) => return Ok(true),
                    Err(TryLockError::WouldBlock) => {
                        trace!(path = %path.display(), "waiting for lock");
                        thread::sleep(LOCK_DELAY);
                    }
                    Err(TryLockError::Error(source)) => {
                        return Err(LockError::Failed {
                            path: path.to_path_buf(),
                            source,
                        }
                        .into());
                    }
                }
            },
        }
    }

    pub(crate) fn length(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|source| {
                BackendError::Read {
                    path: self.path.clone(),
                    offset: 0,
                    source,
                }
                .into()
            })
    }

    pub(crate) fn set_length(&self, length: u64) -> Result<()> {
        self.file.set_len(length).map_err(|source| {
            BackendError::SetLength {
                path: self.path.clone(),
                length,
                source,
            }
            .into()
        })
    }

    pub(crate) fn sync(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.file.sync_data().map_err(|source| {
            BackendError::Sync {
                path: self.path.clone(),
                source,
            }
            .into()
        })
    }

    /// Syncs, unlocks and unregisters.
    ///
    /// The lock and claim are released even if the sync fails.
    pub(crate) fn release(self) -> Result<()> {
        let synced = self.sync();
        if self.locked {
            // Dropping the handle also releases the lock; the explicit unlock
            // makes it visible before any caller reopens the path.
            if let Err(err) = self.file.unlock() {
                warn!(path = %self.path.display(), error = %err, "failed to unlock file");
            }
        }
        drop(self.claim);
        debug!(path = %self.path.display(), "closed file");
        synced
    }
}

/// Database stored in a regular file.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Option<LockedFile>,
}

impl FileBackend {
    /// Opens a file backend directly, outside of a factory.
    ///
    /// # Errors
    ///
    /// See [`BackendFactory::open`].
    pub fn open(
        path: &Path,
        access: Access,
        lock_mode: LockMode,
        registry: &WriterRegistry,
    ) -> Result<Self> {
        let inner = LockedFile::open(path, access, lock_mode, registry)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Some(inner),
        })
    }

    fn inner(&mut self) -> Result<&mut LockedFile> {
        match self.inner.as_mut() {
            Some(inner) => Ok(inner),
            None => Err(BackendError::Closed {
                path: self.path.clone(),
            }
            .into()),
        }
    }
}

impl Backend for FileBackend {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        let mut buf = vec![0u8; length];
        let result = inner
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| inner.file.read_exact(&mut buf));

        match result {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                let available = inner.length()?;
                Err(BackendError::ShortRead {
                    path: inner.path.clone(),
                    offset,
                    length,
                    available,
                }
                .into())
            }
            Err(source) => Err(BackendError::Read {
                path: inner.path.clone(),
                offset,
                source,
            }
            .into()),
        }
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let inner = self.inner()?;
        inner
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| inner.file.write_all(bytes))
            .map_err(|source| {
                BackendError::Write {
                    path: inner.path.clone(),
                    offset,
                    source,
                }
                .into()
            })
    }

    fn length(&self) -> Result<u64> {
        match self.inner.as_ref() {
            Some(inner) => inner.length(),
            None => Err(BackendError::Closed {
                path: self.path.clone(),
            }
            .into()),
        }
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        self.inner()?.set_length(length)
    }

    fn sync(&mut self) -> Result<()> {
        self.inner()?.sync()
    }

    fn close(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => inner.release(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RrdError;

    fn factory() -> FileBackendFactory {
        FileBackendFactory::new()
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.rrd");
        let f = factory();

        let mut backend = f.open(&path, Access::Create, LockMode::NoLocks).unwrap();
        backend.set_length(32).unwrap();
        backend.write(8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read(8, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.read(0, 4).unwrap(), vec![0, 0, 0, 0]);
        assert_eq!(backend.length().unwrap(), 32);
        backend.close().unwrap();

        let mut reader = f.open(&path, Access::ReadOnly, LockMode::NoLocks).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 32);
    }

    #[test]
    fn test_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.rrd");
        let mut backend = factory().open(&path, Access::Create, LockMode::NoLocks).unwrap();
        backend.set_length(10).unwrap();

        let err = backend.read(8, 4).unwrap_err();
        assert!(matches!(
            err,
            RrdError::Io(BackendError::ShortRead {
                offset: 8,
                length: 4,
                available: 10,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = factory()
            .open(&dir.path().join("nope.rrd"), Access::ReadWrite, LockMode::NoLocks)
            .unwrap_err();
        assert!(matches!(err, RrdError::Io(BackendError::Missing { .. })));
    }

    #[test]
    fn test_second_writer_rejected_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.rrd");
        let f = factory();

        let mut first = f.open(&path, Access::Create, LockMode::NoLocks).unwrap();
        let err = f.open(&path, Access::ReadWrite, LockMode::NoLocks).unwrap_err();
        assert!(matches!(err, RrdError::Lock(LockError::AlreadyOpen { .. })));

        // Readers are not registered.
        assert!(f.open(&path, Access::ReadOnly, LockMode::NoLocks).is_ok());

        first.close().unwrap();
        first.close().unwrap();
        assert!(f.registry().is_empty());
        assert!(f.open(&path, Access::ReadWrite, LockMode::NoLocks).is_ok());
    }

    #[test]
    fn test_os_lock_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.rrd");

        // Separate registries stand in for separate processes.
        let mut holder = factory()
            .open(&path, Access::Create, LockMode::ExceptionIfLocked)
            .unwrap();
        let err = factory()
            .open(&path, Access::ReadWrite, LockMode::ExceptionIfLocked)
            .unwrap_err();
        assert!(matches!(err, RrdError::Lock(LockError::Contended { .. })));

        holder.close().unwrap();
        assert!(
            factory()
                .open(&path, Access::ReadWrite, LockMode::ExceptionIfLocked)
                .is_ok()
        );
    }

    #[test]
    fn test_use_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.rrd");
        let mut backend = factory().open(&path, Access::Create, LockMode::NoLocks).unwrap();
        backend.close().unwrap();

        assert!(matches!(
            backend.read(0, 1),
            Err(RrdError::Io(BackendError::Closed { .. }))
        ));
        assert!(matches!(
            backend.write(0, &[1]),
            Err(RrdError::Io(BackendError::Closed { .. }))
        ));
    }
}
