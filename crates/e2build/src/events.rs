//! Append-only JSONL log of build-run events.
//!
//! One JSON object per line, written under `.e2/log/events.jsonl` of the
//! project. The log is the durable record of a run; the `Reporter` is only
//! the live view.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(log_dir: &Path) -> PathBuf {
    log_dir.join(EVENTS_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
    /// The result the event belongs to, or `all` for run-level events.
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted { mode: String, results: Vec<String> },
    RunFinished { ok: bool },
    ResultScheduled { buildid: String },
    ResultSkipped { buildid: String },
    ResultPrepared,
    ResultBuilt,
    ResultStored { buildid: String },
    ResultDone,
    ResultFailed { reason: String },
    SourceFetched { source: String },
    SourcePrepared { source: String },
    ChrootInstalled { groups: Vec<String> },
    CacheFetch { server: String, location: String, hit: bool },
}

impl BuildEvent {
    pub fn now(result: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            result: result.into(),
        }
    }
}

/// In-memory buffer of events, flushed by appending to the JSONL file.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<BuildEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: BuildEvent) {
        self.events.push(event);
    }

    pub fn all_events(&self) -> &[BuildEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Append buffered events to `path`, one JSON object per line.
    pub fn append_to_file(&self, path: &Path) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(file, "{line}")
                .with_context(|| format!("failed to append to {}", path.display()))?;
        }
        Ok(())
    }

    /// Flush buffered events to disk and clear the buffer.
    pub fn flush(&mut self, path: &Path) -> Result<()> {
        self.append_to_file(path)?;
        self.clear();
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        let mut events = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: BuildEvent = serde_json::from_str(&line).with_context(|| {
                format!("bad event at {}:{}", path.display(), lineno + 1)
            })?;
            events.push(event);
        }
        Ok(Self { events })
    }

    /// Events belonging to one result.
    pub fn for_result<'a>(&'a self, result: &'a str) -> impl Iterator<Item = &'a BuildEvent> {
        self.events.iter().filter(move |e| e.result == result)
    }
}
