//! The per-invocation run context.
//!
//! Everything that used to be process-global lives here: the cache, the
//! temp-path registry, the lock registry, warning toggles, the event log
//! and the interrupt flag. The context is constructed once at invocation
//! start; dropping it flushes the event log, removes temp paths and
//! releases any surviving locks, on every exit path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use e2build_lock::LockRegistry;

use crate::cache::Cache;
use crate::events::{BuildEvent, EventLog, events_path};
use crate::transport::Transport;
use crate::types::{Error, ServerEntry, Warnings};

/// A cooperative interrupt request. The front-end's signal handler trips
/// it; the driver observes it at suspension points and unwinds in order.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if an interrupt was requested.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_tripped() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}

/// Registry of temp paths, removed together when the run ends.
#[derive(Debug)]
pub struct TempRegistry {
    base: PathBuf,
    counter: AtomicUsize,
    paths: Mutex<Vec<PathBuf>>,
}

impl TempRegistry {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            counter: AtomicUsize::new(0),
            paths: Mutex::new(Vec::new()),
        }
    }

    /// Create and register a fresh scratch directory.
    pub fn create_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self
            .base
            .join(format!("e2-{prefix}-{}-{n}", std::process::id()));
        fs::create_dir_all(&path)?;
        self.register(path.clone());
        Ok(path)
    }

    /// Track a path created elsewhere for end-of-run removal.
    pub fn register(&self, path: PathBuf) {
        self.paths.lock().expect("temp registry poisoned").push(path);
    }

    /// Remove every registered path. Idempotent.
    pub fn cleanup(&self) {
        let paths: Vec<PathBuf> = {
            let mut paths = self.paths.lock().expect("temp registry poisoned");
            std::mem::take(&mut *paths)
        };
        for path in paths {
            if path.is_dir() {
                let _ = fs::remove_dir_all(&path);
            } else {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

impl Drop for TempRegistry {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[derive(Debug)]
pub struct RunContext {
    pub cache: Cache,
    pub tmp: TempRegistry,
    pub locks: LockRegistry,
    pub warnings: Warnings,
    pub interrupt: Interrupt,
    log_path: PathBuf,
    events: Mutex<EventLog>,
}

impl RunContext {
    pub fn builder() -> RunContextBuilder {
        RunContextBuilder::default()
    }

    /// Record an event and append it to the on-disk log immediately, so an
    /// aborted run still leaves a complete trail.
    pub fn record_event(&self, event: BuildEvent) {
        let mut log = self.events.lock().expect("event log poisoned");
        log.record(event);
        let _ = log.flush(&self.log_path);
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if let Ok(mut log) = self.events.lock() {
            let _ = log.flush(&self.log_path);
        }
        self.locks.drain();
        self.tmp.cleanup();
    }
}

/// Collects configuration before the context (and with it the cache) is
/// initialized. Writeback toggles requested now are queued and applied when
/// the cache comes up.
#[derive(Default)]
pub struct RunContextBuilder {
    warnings: Warnings,
    writeback_requests: Vec<(String, bool)>,
}

impl RunContextBuilder {
    pub fn warnings(mut self, warnings: Warnings) -> Self {
        self.warnings = warnings;
        self
    }

    /// Queue a writeback toggle to be applied once the cache exists.
    pub fn set_writeback(mut self, server: &str, enable: bool) -> Self {
        self.writeback_requests.push((server.to_string(), enable));
        self
    }

    pub fn build(
        self,
        cache_template: &str,
        user: &str,
        servers: Vec<ServerEntry>,
        transport: Arc<dyn Transport>,
        tmp_base: PathBuf,
        log_dir: &Path,
    ) -> Result<RunContext, Error> {
        let cache = Cache::new(
            cache_template,
            user,
            servers,
            transport,
            &self.writeback_requests,
        )?;
        Ok(RunContext {
            cache,
            tmp: TempRegistry::new(tmp_base),
            locks: LockRegistry::new(),
            warnings: self.warnings,
            interrupt: Interrupt::new(),
            log_path: events_path(log_dir),
            events: Mutex::new(EventLog::new()),
        })
    }
}
