//! Audit Logger
//!
//! Every request that reaches authentication produces exactly one audit
//! entry, whatever its outcome. Writing happens on a background task fed by
//! a bounded channel: a slow or full disk can drop entries (counted), but
//! it can never stall a response.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::metrics;
use crate::sandbox::ExecutionResult;

/// One audit record, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Request id, shared with the response and log lines
    pub id: Uuid,

    /// When the gateway finished handling the request
    pub timestamp: DateTime<Utc>,

    /// Authenticated identity, or "anonymous" when auth failed
    pub identity: String,

    /// Requested program
    pub program: String,

    /// Requested arguments, as received
    pub args: Vec<String>,

    /// Outcome label: "completed" or an error kind
    pub outcome: String,

    /// Execution summary, present only when a child actually ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSummary>,
}

/// The part of an execution result worth keeping forever. Output bodies
/// stay out of the audit trail; they can be large and can hold secrets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl From<&ExecutionResult> for ExecutionSummary {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            timed_out: result.timed_out,
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
        }
    }
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, entry: &AuditEntry) -> anyhow::Result<()>;
}

/// Appends JSON lines to a file.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl AuditSink for FileSink {
    async fn write(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

/// Collects entries in memory; for tests.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Hands entries to the background writer without blocking.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditLogger {
    /// Start the writer task over the given sink.
    pub fn start(sink: Arc<dyn AuditSink>, queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(queue_capacity);

        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = sink.write(&entry).await {
                    error!(entry_id = %entry.id, "audit write failed: {:#}", e);
                }
            }
        });

        Self { tx }
    }

    /// Start a logger backed by an in-memory sink, returning both (for tests).
    pub fn in_memory(queue_capacity: usize) -> (Self, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Self::start(sink.clone(), queue_capacity);
        (logger, sink)
    }

    /// Queue an entry. Never blocks; a full queue drops the entry and
    /// bumps the drop counter.
    pub fn record(&self, entry: AuditEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {
                metrics::AUDIT_ENTRIES_TOTAL.inc();
            }
            Err(mpsc::error::TrySendError::Full(entry)) => {
                metrics::AUDIT_ENTRIES_DROPPED_TOTAL.inc();
                warn!(entry_id = %entry.id, "audit queue full, entry dropped");
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                metrics::AUDIT_ENTRIES_DROPPED_TOTAL.inc();
                error!(entry_id = %entry.id, "audit writer gone, entry dropped");
            }
        }
    }
}

impl AuditEntry {
    /// Build an entry for a finished request.
    pub fn new(
        id: Uuid,
        identity: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
        outcome: impl Into<String>,
        result: Option<&ExecutionResult>,
    ) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            identity: identity.into(),
            program: program.into(),
            args,
            outcome: outcome.into(),
            execution: result.map(ExecutionSummary::from),
        }
    }
}
