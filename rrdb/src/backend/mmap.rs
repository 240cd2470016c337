//! Memory-mapped file backend.
//!
//! # Safety
//!
//! Mapping a file is unsafe because another process may truncate or modify
//! it underneath the mapping. Writers hold a [`WriterClaim`](super::WriterClaim)
//! for the path and, outside [`LockMode::NoLocks`], an OS lock; the backend
//! length is fixed after creation, so the mapping never outlives the bytes it
//! covers while those guarantees hold.

use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use super::file::LockedFile;
use super::{Access, Backend, BackendFactory, LockMode, WriterRegistry};
use crate::error::{BackendError, Result};

/// Creates [`MmapBackend`]s sharing one [`WriterRegistry`].
#[derive(Debug, Clone, Default)]
pub struct MmapBackendFactory {
    registry: WriterRegistry,
}

impl MmapBackendFactory {
    /// Creates a factory with its own registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory that shares `registry` with other factories.
    pub fn with_registry(registry: WriterRegistry) -> Self {
        Self { registry }
    }
}

impl BackendFactory for MmapBackendFactory {
    fn name(&self) -> &'static str {
        "mmap"
    }

    fn open(&self, path: &Path, access: Access, lock_mode: LockMode) -> Result<Box<dyn Backend>> {
        let backend = MmapBackend::open(path, access, lock_mode, &self.registry)?;
        Ok(Box::new(backend))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

#[derive(Debug)]
enum Mapping {
    Empty,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::ReadOnly(map) => &map[..],
            Self::ReadWrite(map) => &map[..],
        }
    }
}

#[derive(Debug)]
struct Mapped {
    file: LockedFile,
    map: Mapping,
    writable: bool,
}

impl Mapped {
    fn remap(&mut self) -> Result<()> {
        let length = self.file.length()?;
        self.map = if length == 0 {
            Mapping::Empty
        } else if self.writable {
            // SAFETY: The file is open read/write and claimed for this
            // process; its length only changes through `set_length`, which
            // drops the mapping before resizing and remaps afterwards.
            let map = unsafe { MmapMut::map_mut(&self.file.file) }.map_err(|source| {
                BackendError::Open {
                    path: self.file.path.clone(),
                    source,
                }
            })?;
            Mapping::ReadWrite(map)
        } else {
            // SAFETY: Read-only mapping of a file whose length is fixed after
            // creation; writers in this process never resize an open database.
            let map = unsafe { Mmap::map(&self.file.file) }.map_err(|source| BackendError::Open {
                path: self.file.path.clone(),
                source,
            })?;
            Mapping::ReadOnly(map)
        };
        Ok(())
    }
}

/// Database stored in a memory-mapped file.
///
/// Reads and writes are plain memory copies; [`sync`](Backend::sync) flushes
/// the dirty pages.
#[derive(Debug)]
pub struct MmapBackend {
    path: PathBuf,
    inner: Option<Mapped>,
}

impl MmapBackend {
    /// Opens a memory-mapped backend directly, outside of a factory.
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
        let file = LockedFile::open(path, access, lock_mode, registry)?;
        let mut mapped = Mapped {
            file,
            map: Mapping::Empty,
            writable: access.is_writable(),
        };
        mapped.remap()?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Some(mapped),
        })
    }

    fn inner(&mut self) -> Result<&mut Mapped> {
        match self.inner.as_mut() {
            Some(inner) => Ok(inner),
            None => Err(BackendError::Closed {
                path: self.path.clone(),
            }
            .into()),
        }
    }
}

impl Backend for MmapBackend {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let path = self.path.clone();
        let inner = self.inner()?;
        let data = inner.map.as_slice();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start.checked_add(length).and_then(|end| data.get(start..end)) {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(BackendError::ShortRead {
                path,
                offset,
                length,
                available: data.len() as u64,
            }
            .into()),
        }
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let inner = self.inner()?;
        let map = match &mut inner.map {
            Mapping::ReadWrite(map) => map,
            other => {
                return Err(BackendError::OutOfBounds {
                    path,
                    offset,
                    length: bytes.len(),
                    size: other.as_slice().len() as u64,
                }
                .into());
            }
        };
        let size = map.len() as u64;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start
            .checked_add(bytes.len())
            .and_then(|end| map.get_mut(start..end))
        {
            Some(target) => {
                target.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(BackendError::OutOfBounds {
                path,
                offset,
                length: bytes.len(),
                size,
            }
            .into()),
        }
    }

    fn length(&self) -> Result<u64> {
        match self.inner.as_ref() {
            Some(inner) => Ok(inner.map.as_slice().len() as u64),
            None => Err(BackendError::Closed {
                path: self.path.clone(),
            }
            .into()),
        }
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        let inner = self.inner()?;
        inner.map = Mapping::Empty;
        inner.file.set_length(length)?;
        inner.remap()
    }

    fn sync(&mut self) -> Result<()> {
        let path = self.path.clone();
        let inner = self.inner()?;
        if let Mapping::ReadWrite(map) = &inner.map {
            map.flush()
                .map_err(|source| BackendError::Sync { path, source })?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut inner) = self.inner.take() else {
            return Ok(());
        };
        let flushed = match &inner.map {
            Mapping::ReadWrite(map) => map.flush().map_err(|source| BackendError::Sync {
                path: self.path.clone(),
                source,
            }),
            _ => Ok(()),
        };
        inner.map = Mapping::Empty;
        let released = inner.file.release();
        flushed?;
        released
    }
}
