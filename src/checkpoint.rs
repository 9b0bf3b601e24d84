use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CheckpointError;
use crate::record::Record;

const FLUSH_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 200;

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub record: Record,
    pub written_at: DateTime<Utc>,
}

/// Durable append-only log of completed records, one JSON entry per line.
/// Entries are idempotent by id: replay keeps the last complete entry per
/// id, so rewriting an id never duplicates it in the resumed view and a
/// torn trailing line from an interrupted run is simply skipped.
///
/// Writes are buffered and flushed every `flush_every` completions. The
/// store has a single driver (the orchestrator's completion loop), which is
/// the pipeline's single-writer discipline.
pub struct CheckpointStore {
    path: PathBuf,
    flush_every: usize,
    buf: Vec<String>,
}

impl CheckpointStore {
    pub fn open(path: impl Into<PathBuf>, flush_every: usize) -> Self {
        CheckpointStore {
            path: path.into(),
            flush_every: flush_every.max(1),
            buf: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Buffer one completed record; flushes when the batch is full.
    pub async fn append(&mut self, record: &Record) -> Result<(), CheckpointError> {
        let entry = CheckpointEntry {
            id: record.id.clone(),
            record: record.clone(),
            written_at: Utc::now(),
        };
        self.buf.push(serde_json::to_string(&entry)?);
        if self.buf.len() >= self.flush_every {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write the buffered batch out, retrying a bounded number of times.
    /// A persistent failure is fatal for the run.
    pub async fn flush(&mut self) -> Result<(), CheckpointError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut payload = self.buf.join("\n");
        payload.push('\n');

        let mut last_err = None;
        for attempt in 0..=FLUSH_RETRIES {
            match self.write_payload(&payload) {
                Ok(()) => {
                    self.buf.clear();
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "checkpoint write failed (attempt {}/{}): {}",
                        attempt + 1,
                        FLUSH_RETRIES + 1,
                        e
                    );
                    last_err = Some(e);
                }
            }
            if attempt < FLUSH_RETRIES {
                let backoff = RETRY_BACKOFF_MS * (attempt as u64 + 1);
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
        }
        Err(CheckpointError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::other("checkpoint write failed")
        })))
    }

    fn write_payload(&self, payload: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()
    }

    /// Replay the log into the last-known snapshot per id. Order in the
    /// file is completion order; callers must not assume any other order.
    pub fn load(path: &Path) -> Result<HashMap<String, Record>, CheckpointError> {
        let mut out = HashMap::new();
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointEntry>(&line) {
                Ok(entry) => {
                    out.insert(entry.id, entry.record);
                }
                Err(e) => {
                    // Interrupted mid-write; the records on this line stay
                    // pending on the next run.
                    warn!("skipping unreadable checkpoint line {}: {}", lineno + 1, e);
                }
            }
        }
        Ok(out)
    }
}
