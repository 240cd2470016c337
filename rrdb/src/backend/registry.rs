//! In-process registry of paths open for writing.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{LockError, Result};

/// Set of canonical paths currently held by writers.
///
/// Cloning a registry shares it. Factories that should see each other's
/// writers (normally every file-backed factory in a process) must be built
/// from clones of the same registry.
#[derive(Debug, Clone, Default)]
pub struct WriterRegistry {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl WriterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` for writing.
    ///
    /// The claim is released when the returned [`WriterClaim`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyOpen`] if another claim on the same
    /// canonical path is alive.
    pub fn claim(&self, path: &Path) -> Result<WriterClaim> {
        let canonical = canonical_path(path);
        let mut paths = self.lock();
        if !paths.insert(canonical.clone()) {
            return Err(LockError::AlreadyOpen { path: canonical }.into());
        }
        Ok(WriterClaim {
            registry: self.clone(),
            path: canonical,
        })
    }

    /// Whether `path` is currently claimed.
    pub fn is_claimed(&self, path: &Path) -> bool {
        self.lock().contains(&canonical_path(path))
    }

    /// Number of live claims.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no claims are alive.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live claim on a path; releases it on drop.
#[derive(Debug)]
pub struct WriterClaim {
    registry: WriterRegistry,
    path: PathBuf,
}

impl WriterClaim {
    /// Canonical path held by this claim.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}

/// Resolves `path` to a canonical form, even if the file does not exist yet.
fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let parent = parent.map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    match (fs::canonicalize(parent), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}
