//! Coordinator state and its durable store.
//!
//! Everything the coordinator knows lives in one [`CoordinatorState`] value
//! that is written to `.trunkline/state.json` after every mutation, so a
//! restarted coordinator can pick up where the last one stopped.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::{Mode, RetryConfig};
use crate::escalation::{Escalation, SessionProgress};
use crate::paths::{SessionPaths, atomic_write};
use crate::phase::{Phase, WorkerStatus};
use crate::progress::Milestone;
use crate::queue::MergeQueue;
use crate::task::{Task, TaskStatus};

pub const SCHEMA_VERSION: u32 = 1;

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Spawning,
    Monitoring,
    Merging,
    Draining,
    Done,
    Aborted,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Spawning => "spawning",
            Lifecycle::Monitoring => "monitoring",
            Lifecycle::Merging => "merging",
            Lifecycle::Draining => "draining",
            Lifecycle::Done => "done",
            Lifecycle::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::Done | Lifecycle::Aborted)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coordinator's view of one worker, live or retired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub task_id: String,
    pub status: WorkerStatus,
    pub phase: Phase,
    pub branch_name: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub change_request_ref: Option<String>,
    /// Workers the task had before this one.
    pub retry_count: u32,
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub error: Option<String>,
    pub spawned_at: DateTime<Utc>,
    /// Fingerprint of the last progress record read.
    #[serde(default)]
    pub last_digest: Option<String>,
    /// Since when the progress record has been unreadable.
    #[serde(default)]
    pub unreadable_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ci_failures: u32,
    /// The current CI run has already been counted as a failure.
    #[serde(default)]
    pub ci_failure_counted: bool,
    /// No longer active; kept for the record.
    #[serde(default)]
    pub archived: bool,
}

impl WorkerHandle {
    /// Time the worker entered `phase`, if it did.
    pub fn reached(&self, phase: Phase) -> Option<DateTime<Utc>> {
        self.milestones
            .iter()
            .rev()
            .find(|m| m.phase == phase)
            .map(|m| m.at)
    }
}

/// What finally happened to a branch created this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BranchFate {
    /// A worker may still be using it.
    Active,
    Merged,
    /// Left in place, recorded for the operator.
    Abandoned,
    /// Deleted.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BranchRecord {
    pub branch: String,
    pub task_id: String,
    pub worker_id: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    pub fate: BranchFate,
}

/// One successful merge into trunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MergeRecord {
    pub task_id: String,
    pub worker_id: String,
    pub branch: String,
    /// Trunk head the merge was built on.
    #[serde(default)]
    pub base: String,
    /// Trunk head after the merge.
    pub commit: String,
    pub merged_at: DateTime<Utc>,
    #[serde(default)]
    pub reverted_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    SessionResumed,
    Spawned,
    Milestone,
    AnomalousTransition,
    Respawn,
    CiFailed,
    Enqueued,
    ConflictDetected,
    AutoResolved,
    Merged,
    /// A merge taken back off local trunk because it could not be pushed.
    Unwound,
    Verified,
    Reverted,
    Escalated,
    Decided,
    TaskFinished,
    Aborted,
    Done,
}

/// One line of the session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SessionEvent {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoordinatorState {
    pub schema_version: u32,
    pub revision: u64,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub mode: Mode,
    pub max_concurrency: u32,
    pub lifecycle: Lifecycle,
    pub retry_limits: RetryConfig,
    pub tasks: Vec<Task>,
    /// Every worker ever spawned this session, keyed by worker id.
    pub workers: BTreeMap<String, WorkerHandle>,
    /// Worker ids currently counted against `max_concurrency`, in spawn order.
    pub active_workers: Vec<String>,
    pub merge_queue: MergeQueue,
    /// Escalation id holding the merge queue, if any.
    #[serde(default)]
    pub queue_paused_by: Option<String>,
    /// Workers spawned per task.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    /// Failed workers per task.
    #[serde(default)]
    pub failures: BTreeMap<String, u32>,
    pub branches: BTreeMap<String, BranchRecord>,
    pub merges: Vec<MergeRecord>,
    pub escalations: Vec<Escalation>,
    #[serde(default)]
    pub next_escalation: u64,
    pub session_log: Vec<SessionEvent>,
}

impl CoordinatorState {
    pub fn new(
        session_id: String,
        mode: Mode,
        max_concurrency: u32,
        retry_limits: RetryConfig,
        tasks: Vec<Task>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            revision: 0,
            session_id,
            started_at: now,
            updated_at: now,
            mode,
            max_concurrency,
            lifecycle: Lifecycle::Idle,
            retry_limits,
            tasks,
            workers: BTreeMap::new(),
            active_workers: Vec::new(),
            merge_queue: MergeQueue::new(),
            queue_paused_by: None,
            attempts: BTreeMap::new(),
            failures: BTreeMap::new(),
            branches: BTreeMap::new(),
            merges: Vec::new(),
            escalations: Vec::new(),
            next_escalation: 0,
            session_log: Vec::new(),
        }
    }

    /// Append to the session log and emit the matching tracing event.
    pub fn log(
        &mut self,
        kind: EventKind,
        task_id: Option<&str>,
        worker_id: Option<&str>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        tracing::info!(
            event = ?kind,
            task = task_id.unwrap_or_default(),
            worker = worker_id.unwrap_or_default(),
            "{message}"
        );
        self.session_log.push(SessionEvent {
            at: Utc::now(),
            kind,
            task_id: task_id.map(str::to_string),
            worker_id: worker_id.map(str::to_string),
            message,
        });
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.task(task_id).map(|t| t.status)
    }

    pub fn set_task_status(&mut self, task_id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == task_id) {
            task.status = status;
        }
    }

    pub fn worker(&self, worker_id: &str) -> Option<&WorkerHandle> {
        self.workers.get(worker_id)
    }

    pub fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(worker_id)
    }

    /// The live worker assigned to `task_id`, if any.
    pub fn active_worker_for(&self, task_id: &str) -> Option<&WorkerHandle> {
        self.active_workers
            .iter()
            .filter_map(|id| self.workers.get(id))
            .find(|h| h.task_id == task_id)
    }

    /// Stop counting a worker against the concurrency limit.
    pub fn retire(&mut self, worker_id: &str) {
        self.active_workers.retain(|w| w != worker_id);
        if let Some(handle) = self.workers.get_mut(worker_id) {
            handle.archived = true;
        }
    }

    pub fn escalation(&self, id: &str) -> Option<&Escalation> {
        self.escalations.iter().find(|e| e.id == id)
    }

    pub fn escalation_for_task(&self, task_id: &str) -> Option<&Escalation> {
        self.escalations.iter().find(|e| e.task_id == task_id)
    }

    pub fn next_escalation_id(&mut self) -> String {
        self.next_escalation += 1;
        format!("e{}", self.next_escalation)
    }

    pub fn set_branch_fate(&mut self, branch: &str, fate: BranchFate) {
        if let Some(record) = self.branches.get_mut(branch) {
            record.fate = fate;
        }
    }

    pub fn progress(&self) -> SessionProgress {
        let count = |s: TaskStatus| self.tasks.iter().filter(|t| t.status == s).count();
        SessionProgress {
            total: self.tasks.len(),
            completed: count(TaskStatus::Completed),
            in_progress: count(TaskStatus::InProgress),
            ready: count(TaskStatus::Ready),
            blocked: count(TaskStatus::Blocked),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
            active_workers: self.active_workers.len(),
            queued_merges: self.merge_queue.len(),
            pending_escalations: self.escalations.len(),
        }
    }
}

/// Why a persisted state record could not be used.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is not a valid state record: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{} has schema version {found} (expected {SCHEMA_VERSION})", path.display())]
    SchemaVersion { path: PathBuf, found: u32 },
}

/// Reads and writes `state.json`, and archives finished sessions.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: SessionPaths,
}

impl StateStore {
    pub fn new(paths: SessionPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn load(&self) -> Result<Option<CoordinatorState>, StateError> {
        let path = self.paths.state_file();
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateError::Unreadable { path, source }),
        };
        let state: CoordinatorState = match serde_json::from_str(&contents) {
            Ok(state) => state,
            Err(source) => return Err(StateError::Corrupt { path, source }),
        };
        if state.schema_version != SCHEMA_VERSION {
            return Err(StateError::SchemaVersion {
                path,
                found: state.schema_version,
            });
        }
        Ok(Some(state))
    }

    /// Bump the revision and write the state atomically.
    pub fn save(&self, state: &mut CoordinatorState) -> anyhow::Result<()> {
        state.revision += 1;
        state.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(state).context("serializing coordinator state")?;
        atomic_write(&self.paths.state_file(), &json)
    }

    /// Move a finished session's state into the archive.
    pub fn archive(&self, state: &CoordinatorState) -> anyhow::Result<PathBuf> {
        let dest = self
            .paths
            .archive_dir()
            .join(format!("{}.json", state.session_id));
        let json = serde_json::to_vec_pretty(state).context("serializing coordinator state")?;
        atomic_write(&dest, &json)?;
        let live = self.paths.state_file();
        if live.exists() {
            fs::remove_file(&live).with_context(|| format!("removing {}", live.display()))?;
        }
        Ok(dest)
    }

    /// The most recently archived session, if any.
    pub fn latest_archived(&self) -> anyhow::Result<Option<CoordinatorState>> {
        let dir = self.paths.archive_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };
        let mut latest: Option<CoordinatorState> = None;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let Ok(state) = serde_json::from_str::<CoordinatorState>(&contents) else {
                tracing::warn!(path = %path.display(), "skipping unreadable archived session");
                continue;
            };
            if latest
                .as_ref()
                .is_none_or(|l| state.updated_at > l.updated_at)
            {
                latest = Some(state);
            }
        }
        Ok(latest)
    }
}
