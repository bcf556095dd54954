//! Progress Store: one JSON record per worker, written only by that worker and
//! polled by the coordinator.
//!
//! Records are replaced atomically, so every read is a whole snapshot. Each
//! snapshot carries a SHA-256 fingerprint of the bytes read, letting the
//! poller skip records that have not changed since the last tick.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::paths::atomic_write;
use crate::phase::{Phase, WorkerStatus};

/// A phase the worker entered and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Milestone {
    pub phase: Phase,
    pub at: DateTime<Utc>,
}

/// What kind of failure a worker reported.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[default]
    Worker,
    Test,
}

/// The worker-owned progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressRecord {
    pub worker_id: String,
    pub task_id: String,
    pub status: WorkerStatus,
    pub phase: Phase,
    pub branch: String,
    #[serde(default, alias = "changeRequestRef")]
    pub change_request_ref: Option<String>,
    #[serde(default, alias = "retryCount")]
    pub retry_count: u32,
    #[serde(alias = "lastUpdate")]
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "errorKind")]
    pub error_kind: Option<FailureKind>,
}

impl ProgressRecord {
    /// The record a freshly spawned worker starts from.
    pub fn started(worker_id: &str, task_id: &str, branch: &str, retry_count: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            status: WorkerStatus::InProgress,
            phase: Phase::Started,
            branch: branch.to_string(),
            change_request_ref: None,
            retry_count,
            last_update: now,
            milestones: vec![Milestone {
                phase: Phase::Started,
                at: now,
            }],
            error: None,
            error_kind: None,
        }
    }
}

/// A change a worker wants to make to its own record.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub phase: Option<Phase>,
    pub status: Option<WorkerStatus>,
    pub change_request_ref: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("progress record {} is unreadable: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("progress record {} is corrupt: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("no progress record for worker {0}")]
    Missing(String),

    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("writing progress record: {0:#}")]
    Write(anyhow::Error),
}

/// A whole-record read plus its content fingerprint.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub record: ProgressRecord,
    pub digest: String,
}

/// Directory-backed progress records.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{worker_id}.json"))
    }

    /// Read one worker's record. `Ok(None)` means the record does not exist yet.
    pub fn read(&self, worker_id: &str) -> Result<Option<Snapshot>, ProgressError> {
        let path = self.path(worker_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ProgressError::Unreadable { path, source }),
        };

        let record: ProgressRecord =
            serde_json::from_slice(&bytes).map_err(|e| ProgressError::Corrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;

        if record.worker_id != worker_id {
            return Err(ProgressError::Corrupt {
                path,
                detail: format!(
                    "record belongs to worker {} (expected {worker_id})",
                    record.worker_id
                ),
            });
        }

        Ok(Some(Snapshot {
            record,
            digest: fingerprint(&bytes),
        }))
    }

    /// Replace a record atomically.
    pub fn write(&self, record: &ProgressRecord) -> Result<(), ProgressError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| ProgressError::Write(anyhow::Error::new(e)))?;
        atomic_write(&self.path(&record.worker_id), &json).map_err(ProgressError::Write)
    }

    /// Apply a worker's own update to its record, enforcing the transition table.
    ///
    /// A phase change appends exactly one milestone; re-reporting the current
    /// phase only refreshes the other fields.
    pub fn apply(
        &self,
        worker_id: &str,
        update: ProgressUpdate,
    ) -> Result<ProgressRecord, ProgressError> {
        let mut record = self
            .read(worker_id)?
            .map(|s| s.record)
            .ok_or_else(|| ProgressError::Missing(worker_id.to_string()))?;
        let now = Utc::now();

        if let Some(phase) = update.phase
            && phase != record.phase
        {
            if !record.phase.worker_may_report(phase) {
                return Err(ProgressError::IllegalTransition {
                    from: record.phase,
                    to: phase,
                });
            }
            record.phase = phase;
            record.milestones.push(Milestone { phase, at: now });
            record.status = WorkerStatus::for_phase(phase);
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        if update.change_request_ref.is_some() {
            record.change_request_ref = update.change_request_ref;
        }
        if update.error.is_some() {
            record.error = update.error;
            record.error_kind = Some(update.error_kind.unwrap_or_default());
        }
        record.last_update = now;

        self.write(&record)?;
        Ok(record)
    }
}

/// Hex SHA-256 of a record's raw bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
