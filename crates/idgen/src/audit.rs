//! Append-only log of issued batches.
//!
//! Every successful allocation writes one [`LogEntry`] before the batch is
//! returned to its caller. Sinks expose no way to alter or delete entries.

use crate::{Error, Result, SourceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Provenance of one issued batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: SourceId,
    pub count: usize,
    pub comment: String,
    pub generated_at: DateTime<Utc>,
    pub identifiers: Vec<String>,
}

impl LogEntry {
    pub fn new(source: SourceId, comment: impl Into<String>, identifiers: Vec<String>) -> Self {
        Self {
            source,
            count: identifiers.len(),
            comment: comment.into(),
            generated_at: Utc::now(),
            identifiers,
        }
    }
}

/// Destination for [`LogEntry`] records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Durably appends `entry`. An error here fails the allocation.
    ///
    /// Runs on the caller's task: sinks doing blocking I/O must move it off
    /// the async worker themselves.
    async fn record(&self, entry: &LogEntry) -> Result<()>;

    /// Entries for `source`, oldest first.
    fn entries(&self, source: SourceId) -> Result<Vec<LogEntry>>;
}

/// Keeps the log in process memory.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, entry: &LogEntry) -> Result<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    fn entries(&self, source: SourceId) -> Result<Vec<LogEntry>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.source == source)
            .cloned()
            .collect())
    }
}

/// Appends entries to a JSON-lines file, one entry per line.
///
/// Each append is written and synced on tokio's blocking pool; async workers
/// only wait for the result.
pub struct JsonlAuditLog {
    path: Arc<PathBuf>,
    file: Arc<Mutex<File>>,
}

impl JsonlAuditLog {
    /// Opens (or creates) the log at `path` in append mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            path: Arc::new(path),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, entry: &LogEntry) -> Result<()> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| Error::Storage(format!("encode entry: {e}")))?;
        line.push(b'\n');

        let file = Arc::clone(&self.file);
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let mut file = file.lock();
            file.write_all(&line)
                .and_then(|()| file.sync_data())
                .map_err(|e| Error::Storage(format!("append {}: {e}", path.display())))
        })
        .await
        .map_err(|e| Error::Storage(format!("audit writer task failed: {e}")))?
    }

    fn entries(&self, source: SourceId) -> Result<Vec<LogEntry>> {
        // Hold the writer lock so no half-written line is observed.
        let _guard = self.file.lock();
        let file = File::open(self.path.as_path())
            .map_err(|e| Error::Storage(format!("open {}: {e}", self.path.display())))?;

        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.map_err(|e| Error::Storage(format!("read {}: {e}", self.path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = serde_json::from_str(&line).map_err(|e| {
                Error::Storage(format!("{} line {}: {e}", self.path.display(), n + 1))
            })?;
            if entry.source == source {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
