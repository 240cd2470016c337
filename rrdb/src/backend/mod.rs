//! Byte-addressable storage backends.
//!
//! A [`Backend`] is a flat, fixed-length byte medium. The engine never needs
//! more than positional reads and writes plus a one-time pre-allocation, so
//! the same database can live in a plain file, a memory-mapped file or a
//! process-local buffer. Backends are produced by a [`BackendFactory`], which
//! also owns whatever cross-instance coordination the medium needs (for files,
//! the [`WriterRegistry`] of paths currently open for writing).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

mod file;
mod memory;
mod mmap;
mod registry;

pub use file::{FileBackend, FileBackendFactory};
pub use memory::{MemoryBackend, MemoryBackendFactory};
pub use mmap::{MmapBackend, MmapBackendFactory};
pub use registry::{WriterClaim, WriterRegistry};

/// Polling interval used by [`LockMode::WaitIfLocked`].
pub const LOCK_DELAY: Duration = Duration::from_millis(100);

/// Cross-process coordination for writers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// No OS-level locking. Two processes writing the same file may corrupt it.
    #[default]
    NoLocks,
    /// Block until the lock is free, polling every [`LOCK_DELAY`].
    WaitIfLocked,
    /// Fail immediately with [`LockError::Contended`](crate::error::LockError::Contended).
    ExceptionIfLocked,
}

/// How a backend is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Create the medium (or reuse an existing one) for writing.
    Create,
    /// Open an existing medium for reading and writing.
    ReadWrite,
    /// Open an existing medium for reading only. No locks are taken.
    ReadOnly,
}

impl Access {
    /// Whether this access mode writes to the medium.
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Positional byte storage for a single database.
///
/// Implementations must fail with
/// [`BackendError::ShortRead`](crate::error::BackendError::ShortRead) when
/// fewer bytes than requested are available, and every method other than
/// [`close`](Backend::close) must fail with
/// [`BackendError::Closed`](crate::error::BackendError::Closed) after close.
pub trait Backend: Send + fmt::Debug {
    /// Path this backend was opened with.
    fn path(&self) -> &Path;

    /// Reads exactly `length` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the read fails or is short.
    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Writes `bytes` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Current length of the medium in bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the length cannot be determined.
    fn length(&self) -> Result<u64>;

    /// Resizes the medium. Called once at creation to pre-allocate.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if allocation fails.
    fn set_length(&mut self, length: u64) -> Result<()>;

    /// Flushes pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if flushing fails.
    fn sync(&mut self) -> Result<()>;

    /// Flushes and releases the medium, its lock and its writer registration.
    ///
    /// Calling `close` more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the final flush fails. Resources are released
    /// regardless.
    fn close(&mut self) -> Result<()>;

    /// Reads the whole medium.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the read fails.
    #[allow(clippy::cast_possible_truncation)] // backend images are addressable in memory
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let length = self.length()?;
        self.read(0, length as usize)
    }
}

/// Produces backends of one kind.
pub trait BackendFactory: Send + Sync + fmt::Debug {
    /// Short name of the backend kind, e.g. `"file"`.
    fn name(&self) -> &'static str;

    /// Opens or creates the backend at `path`.
    ///
    /// Writable access claims `path` for this process and applies
    /// `lock_mode`; read-only access does neither.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Io`](crate::RrdError::Io) if the medium is
    /// missing or unavailable, and [`RrdError::Lock`](crate::RrdError::Lock)
    /// if write access cannot be obtained.
    fn open(&self, path: &Path, access: Access, lock_mode: LockMode) -> Result<Box<dyn Backend>>;

    /// Whether a backend exists at `path`.
    fn exists(&self, path: &Path) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_writable() {
        assert!(Access::Create.is_writable());
        assert!(Access::ReadWrite.is_writable());
        assert!(!Access::ReadOnly.is_writable());
    }

    #[test]
    fn test_default_lock_mode() {
        assert_eq!(LockMode::default(), LockMode::NoLocks);
        assert_eq!(LOCK_DELAY, Duration::from_millis(100));
    }
}
