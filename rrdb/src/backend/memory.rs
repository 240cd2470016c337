//! Process-local in-memory backend.
//!
//! Useful for tests and for short-lived databases that never touch disk. All
//! backends created by one [`MemoryBackendFactory`] (and its clones) share a
//! namespace, so a database can be created, closed and reopened by path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Access, Backend, BackendFactory, LockMode};
use crate::error::{BackendError, LockError, Result};

type Buffer = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Default)]
struct Namespace {
    buffers: HashMap<PathBuf, Buffer>,
    writers: HashMap<PathBuf, usize>,
}

/// Creates [`MemoryBackend`]s in a shared namespace.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackendFactory {
    namespace: Arc<Mutex<Namespace>>,
}

impl MemoryBackendFactory {
    /// Creates an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the buffer stored at `path`, returning whether one existed.
    pub fn remove(&self, path: &Path) -> bool {
        self.lock().buffers.remove(path).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Namespace> {
        self.namespace.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BackendFactory for MemoryBackendFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    // In-memory buffers cannot be shared across processes, so the lock mode
    // only matters for the in-process writer check.
    fn open(&self, path: &Path, access: Access, _lock_mode: LockMode) -> Result<Box<dyn Backend>> {
        let mut ns = self.lock();

        let buffer = match access {
            Access::Create => Arc::clone(ns.buffers.entry(path.to_path_buf()).or_default()),
            Access::ReadWrite | Access::ReadOnly => match ns.buffers.get(path) {
                Some(buffer) => Arc::clone(buffer),
                None => {
                    return Err(BackendError::Missing {
                        path: path.to_path_buf(),
                    }
                    .into());
                }
            },
        };

        let writable = access.is_writable();
        if writable {
            let writers = ns.writers.entry(path.to_path_buf()).or_default();
            if *writers > 0 {
                return Err(LockError::AlreadyOpen {
                    path: path.to_path_buf(),
                }
                .into());
            }
            *writers += 1;
        }

        Ok(Box::new(MemoryBackend {
            path: path.to_path_buf(),
            buffer: Some(buffer),
            writable,
            factory: self.clone(),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().buffers.contains_key(path)
    }
}

/// Database stored in a shared in-memory buffer.
#[derive(Debug)]
pub struct MemoryBackend {
    path: PathBuf,
    buffer: Option<Buffer>,
    writable: bool,
    factory: MemoryBackendFactory,
}

impl MemoryBackend {
    fn buffer(&self) -> Result<MutexGuard<'_, Vec<u8>>> {
        match self.buffer.as_ref() {
            Some(buffer) => Ok(buffer.lock().unwrap_or_else(PoisonError::into_inner)),
            None => Err(BackendError::Closed {
                path: self.path.clone(),
            }
            .into()),
        }
    }
}

impl Backend for MemoryBackend {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let buffer = self.buffer()?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start.checked_add(length).and_then(|end| buffer.get(start..end)) {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(BackendError::ShortRead {
                path: self.path.clone(),
                offset,
                length,
                available: buffer.len() as u64,
            }
            .into()),
        }
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut buffer = self.buffer()?;
        let size = buffer.len() as u64;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let target = if self.writable {
            start
                .checked_add(bytes.len())
                .and_then(|end| buffer.get_mut(start..end))
        } else {
            None
        };
        match target {
            Some(target) => {
                target.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(BackendError::OutOfBounds {
                path: self.path.clone(),
                offset,
                length: bytes.len(),
                size,
            }
            .into()),
        }
    }

    fn length(&self) -> Result<u64> {
        Ok(self.buffer()?.len() as u64)
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        let new_len = usize::try_from(length).map_err(|_| BackendError::SetLength {
            path: self.path.clone(),
            length,
            source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        })?;
        self.buffer()?.resize(new_len, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.buffer().map(|_| ())
    }

    fn close(&mut self) -> Result<()> {
        if self.buffer.take().is_some() && self.writable {
            let mut ns = self.factory.lock();
            if let Some(writers) = ns.writers.get_mut(&self.path) {
                *writers = writers.saturating_sub(1);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
