//! Filesystem directory locks.
//!
//! A lock is a directory created with `mkdir` and released with `rmdir`.
//! `mkdir` is atomic on every filesystem e2build targets, so whoever creates
//! the directory owns the lock; a second taker observes [`LockError::Busy`]
//! and must not touch the protected path.
//!
//! The [`LockRegistry`] tracks every lock the process holds so that all of
//! them can be drained on exit, including abnormal exit paths where
//! individual guards never run their `Drop`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// The lock directory already exists: someone else holds the lock.
    #[error("lock busy: {0}")]
    Busy(PathBuf),
    #[error("lock io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A held directory lock. Released by [`DirLock::release`] or on drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    registry: Option<LockRegistry>,
    held: bool,
}

impl DirLock {
    /// Take the lock at `path` by creating the directory.
    ///
    /// The parent directory must exist. Fails with [`LockError::Busy`] when
    /// the directory is already present.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        match fs::create_dir(path) {
            Ok(()) => Ok(Self {
                path: path.to_path_buf(),
                registry: None,
                held: true,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(LockError::Busy(path.to_path_buf()))
            }
            Err(e) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Like [`DirLock::acquire`], registering the lock for exit-time draining.
    pub fn acquire_registered(path: &Path, registry: &LockRegistry) -> Result<Self, LockError> {
        let mut lock = Self::acquire(path)?;
        registry.register(path);
        lock.registry = Some(registry.clone());
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock by removing the directory.
    pub fn release(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        if let Some(registry) = self.registry.take() {
            registry.unregister(&self.path);
        }
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Best effort; the registry catches anything left behind.
        let _ = self.release();
    }
}

/// Process-wide record of held lock directories.
///
/// Cloning shares the underlying set. The owner of the run (the context)
/// calls [`LockRegistry::drain`] from its cleanup path; a front-end signal
/// handler may call it as well, which is why draining is idempotent.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    held: Arc<Mutex<Vec<PathBuf>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, path: &Path) {
        self.held
            .lock()
            .expect("lock registry poisoned")
            .push(path.to_path_buf());
    }

    fn unregister(&self, path: &Path) {
        let mut held = self.held.lock().expect("lock registry poisoned");
        held.retain(|p| p != path);
    }

    /// Paths of all currently held locks, in acquisition order.
    pub fn held(&self) -> Vec<PathBuf> {
        self.held.lock().expect("lock registry poisoned").clone()
    }

    /// Remove every surviving lock directory. Idempotent.
    pub fn drain(&self) {
        let paths: Vec<PathBuf> = {
            let mut held = self.held.lock().expect("lock registry poisoned");
            std::mem::take(&mut *held)
        };
        for path in paths {
            let _ = fs::remove_dir(&path);
        }
    }
}
