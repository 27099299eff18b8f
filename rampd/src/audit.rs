//! Append-only audit log of stage transitions.
//!
//! Thread-safe ring buffer of recent transition records with optional
//! JSONL persistence. Appends never fail from the caller's perspective:
//! the in-memory write always lands, and a failed file append parks the
//! record in a pending queue retried on later appends. The audit log is
//! never on the evaluation hot path.

use chrono::{DateTime, Utc};
use ramp_common::types::{FlagId, TransitionRecord};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Default maximum number of records to retain in memory.
const DEFAULT_CAPACITY: usize = 1000;

/// Audit log manager.
pub struct AuditLog {
    /// Ring buffer of recent records, oldest first.
    records: RwLock<VecDeque<TransitionRecord>>,
    /// Maximum in-memory capacity.
    capacity: usize,
    /// Persistence path (optional, JSONL).
    persistence_path: Option<PathBuf>,
    /// Records whose file append failed and awaits retry. Shared with
    /// spawned persistence tasks.
    pending: Arc<Mutex<Vec<TransitionRecord>>>,
}

impl AuditLog {
    /// Create a new audit log with the given in-memory capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            persistence_path: None,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a new audit log with default capacity.
    #[allow(dead_code)] // Convenience constructor used by in-process tests
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Enable JSONL persistence to the given path.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persistence_path = Some(path);
        self
    }

    /// Rehydrate the in-memory ring from an existing JSONL file.
    ///
    /// Unparseable lines are skipped with a warning; an audit file is
    /// read for review, never rewritten.
    pub fn load_from_file(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut records = VecDeque::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransitionRecord>(line) {
                Ok(record) => {
                    if records.len() >= capacity {
                        records.pop_front();
                    }
                    records.push_back(record);
                }
                Err(e) => warn!("Skipping malformed audit line {}: {}", idx + 1, e),
            }
        }
        debug!(
            "Loaded {} audit records from {}",
            records.len(),
            path.display()
        );
        Ok(Self {
            records: RwLock::new(records),
            capacity,
            persistence_path: Some(path.to_path_buf()),
            pending: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Append a transition record.
    ///
    /// The in-memory append is immediate; persistence is spawned and the
    /// returned handle is only interesting to tests that need to await
    /// the file write.
    pub fn append(&self, record: TransitionRecord) -> Option<tokio::task::JoinHandle<()>> {
        debug!(
            "Audit: {} {} -> {} ({})",
            record.flag, record.from, record.to, record.cause
        );

        // Pick up anything a previous failed append left behind, oldest
        // first, so the file stays in commit order.
        let mut batch: Vec<TransitionRecord> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        batch.push(record.clone());

        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            if records.len() >= self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }

        let Some(path) = self.persistence_path.clone() else {
            return None;
        };
        let pending = self.pending.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = append_jsonl(&path, &batch).await {
                warn!(
                    "Failed to persist {} audit record(s) to {}: {}",
                    batch.len(),
                    path.display(),
                    e
                );
                let mut parked = pending.lock().unwrap_or_else(|e| e.into_inner());
                // Park at the front so order is preserved on the next retry.
                batch.append(&mut *parked);
                *parked = batch;
            }
        }))
    }

    /// Ordered records for a flag within an optional time range.
    pub fn query(
        &self,
        flag: &FlagId,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<TransitionRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| &r.flag == flag)
            .filter(|r| since.is_none_or(|s| r.timestamp >= s))
            .filter(|r| until.is_none_or(|u| r.timestamp <= u))
            .cloned()
            .collect()
    }

    /// Number of records currently retained in memory.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Records awaiting a persistence retry.
    #[allow(dead_code)] // Exposed for persistence tests
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

async fn append_jsonl(path: &Path, batch: &[TransitionRecord]) -> std::io::Result<()> {
    let mut payload = String::new();
    for record in batch {
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        payload.push_str(&line);
        payload.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(payload.as_bytes()).await?;
    file.flush().await
}
