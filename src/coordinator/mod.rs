//! The coordinator: spawns workers for ready tasks, watches their progress
//! records, and lands finished branches on trunk one at a time.
//!
//! Every call to [`Coordinator::tick`] runs the same steps in order: apply
//! operator decisions, refresh task readiness, spawn into free slots, poll
//! workers, enqueue finished work, and drain at most one merge queue entry.
//! State is persisted after each mutation, so a crash loses at most the step
//! in flight.

mod failures;
mod merge;
mod monitor;
mod spawn;

#[cfg(test)]
mod fakes;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;

use crate::ci::CiProvider;
use crate::config::{AbortConfig, Config, DEFAULT_MAX_CONCURRENCY, MergeStrategy, Mode, RetryConfig};
use crate::error::{CoordinatorError, session_exit};
use crate::escalation::Operator;
use crate::executor::Executor;
use crate::failure::Backoff;
use crate::paths::SessionPaths;
use crate::phase::WorkerStatus;
use crate::progress::ProgressStore;
use crate::queue::MergeQueue;
use crate::state::{BranchFate, CoordinatorState, EventKind, Lifecycle, StateStore};
use crate::task::{self, Backlog, TaskStatus};
use crate::vcs::Vcs;
use crate::verify::Verifier;

/// Above this many workers the coordinator warns but carries on.
pub const CONCURRENCY_WARN_THRESHOLD: u32 = 8;

/// Session settings that do not change once a session starts.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_root: PathBuf,
    pub poll_interval: Duration,
    pub progress_grace: Duration,
    pub retry: RetryConfig,
    pub strategy: MergeStrategy,
    pub auto_resolve: bool,
    pub push: bool,
    pub delete_branches: bool,
    pub branch_prefix: String,
    /// Where worker worktrees go; `None` runs workers in the project root.
    pub worktree_root: Option<PathBuf>,
    pub abort: AbortConfig,
}

/// Command-line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub auto_resolve: Option<bool>,
    pub poll_interval_secs: Option<u64>,
}

impl Settings {
    pub fn from_config(
        config: &Config,
        project_root: &Path,
        overrides: &Overrides,
    ) -> Result<Self, CoordinatorError> {
        let auto_resolve = overrides
            .auto_resolve
            .or(config.merge.auto_resolve)
            .ok_or_else(|| {
                CoordinatorError::invalid_config(
                    "merge.auto_resolve is not set; choose true or false in the config \
                     or pass --auto-resolve / --no-auto-resolve",
                )
            })?;
        let worktree_root = config.worker.worktrees.then(|| {
            config
                .worker
                .worktree_root
                .as_ref()
                .map_or_else(|| crate::paths::worktree_root(project_root), |p| project_root.join(p))
        });

        Ok(Self {
            project_root: project_root.to_path_buf(),
            poll_interval: Duration::from_secs(
                overrides
                    .poll_interval_secs
                    .unwrap_or(config.coordinator.poll_interval_secs),
            ),
            progress_grace: Duration::from_secs(config.coordinator.progress_grace_secs),
            retry: config.retry,
            strategy: config.merge.strategy,
            auto_resolve,
            push: config.merge.push,
            delete_branches: config.merge.delete_branches,
            branch_prefix: config.worker.branch_prefix.clone(),
            worktree_root,
            abort: config.abort,
        })
    }
}

/// Check the requested worker count against the mode.
///
/// Sequential mode runs exactly one worker; parallel mode defaults to
/// [`DEFAULT_MAX_CONCURRENCY`].
pub fn resolve_concurrency(mode: Mode, requested: Option<u32>) -> Result<u32, CoordinatorError> {
    if requested == Some(0) {
        return Err(CoordinatorError::invalid_config(
            "max_concurrency must be at least 1",
        ));
    }
    match mode {
        Mode::Sequential => match requested {
            Some(n) if n > 1 => Err(CoordinatorError::invalid_config(format!(
                "sequential mode runs one worker at a time, but max_concurrency is {n}"
            ))),
            _ => Ok(1),
        },
        Mode::Parallel => {
            let n = requested.unwrap_or(DEFAULT_MAX_CONCURRENCY);
            if n > CONCURRENCY_WARN_THRESHOLD {
                tracing::warn!(
                    max_concurrency = n,
                    "running more than {CONCURRENCY_WARN_THRESHOLD} workers; expect more merge conflicts"
                );
            }
            Ok(n)
        }
    }
}

/// The coordinator's external collaborators.
pub struct Collaborators {
    pub vcs: Box<dyn Vcs>,
    pub ci: Box<dyn CiProvider>,
    pub verifier: Box<dyn Verifier>,
    pub executor: Box<dyn Executor>,
    pub backlog: Box<dyn Backlog>,
    pub operator: Box<dyn Operator>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    /// Finished, but these tasks ended `failed`.
    UnresolvedFailures(Vec<String>),
    Aborted,
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Clean => session_exit::CLEAN,
            Outcome::UnresolvedFailures(_) => session_exit::UNRESOLVED_FAILURES,
            Outcome::Aborted => session_exit::ABORTED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Finished(Outcome),
}

pub struct Coordinator {
    settings: Settings,
    parts: Collaborators,
    paths: SessionPaths,
    store: StateStore,
    progress: ProgressStore,
    state: CoordinatorState,
    backoff: Backoff,
    abort_flag: Arc<AtomicBool>,
}

fn new_session_id() -> String {
    format!(
        "{}-{:04x}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        rand::rng().random::<u16>()
    )
}

impl Coordinator {
    /// Begin a new session over the backlog.
    ///
    /// Fails with `InvalidConfiguration` for a bad worker count and with
    /// `SessionExists` when an unfinished session is on disk.
    pub fn start(
        settings: Settings,
        mut parts: Collaborators,
        mode: Mode,
        max_concurrency: Option<u32>,
    ) -> anyhow::Result<Self> {
        let max_concurrency = resolve_concurrency(mode, max_concurrency)?;
        let paths = SessionPaths::new(&settings.project_root);
        let store = StateStore::new(paths.clone());
        if let Some(existing) = store.load()?
            && !existing.lifecycle.is_terminal()
        {
            return Err(CoordinatorError::SessionExists {
                started_at: existing.started_at.to_rfc3339(),
            }
            .into());
        }

        let tasks = parts.backlog.load()?;
        let abort_signal = paths.abort_signal();
        if abort_signal.exists() {
            tracing::info!(path = %abort_signal.display(), "removing stale abort signal");
            std::fs::remove_file(&abort_signal)?;
        }

        let mut state = CoordinatorState::new(
            new_session_id(),
            mode,
            max_concurrency,
            settings.retry,
            tasks,
        );
        state.lifecycle = Lifecycle::Spawning;
        let message = format!(
            "session {} started: {} tasks, {} mode, up to {max_concurrency} worker(s)",
            state.session_id,
            state.tasks.len(),
            mode.as_str()
        );
        state.log(EventKind::SessionStarted, None, None, message);

        let mut coordinator = Self::assemble(settings, parts, paths, store, state);
        coordinator.persist()?;
        Ok(coordinator)
    }

    /// Pick up the unfinished session on disk.
    pub fn resume(settings: Settings, parts: Collaborators) -> anyhow::Result<Self> {
        let paths = SessionPaths::new(&settings.project_root);
        let store = StateStore::new(paths.clone());
        let state = match store.load()? {
            Some(state) if !state.lifecycle.is_terminal() => state,
            _ => {
                return Err(
                    CoordinatorError::NoSession(paths.state_file().display().to_string()).into(),
                );
            }
        };

        let mut coordinator = Self::assemble(settings, parts, paths, store, state);
        let message = format!(
            "resumed session {} at revision {} with {} active worker(s)",
            coordinator.state.session_id,
            coordinator.state.revision,
            coordinator.state.active_workers.len()
        );
        coordinator
            .state
            .log(EventKind::SessionResumed, None, None, message);
        coordinator.persist()?;
        Ok(coordinator)
    }

    fn assemble(
        settings: Settings,
        parts: Collaborators,
        paths: SessionPaths,
        store: StateStore,
        state: CoordinatorState,
    ) -> Self {
        let backoff = Backoff::from_config(&state.retry_limits);
        Self {
            progress: ProgressStore::new(paths.progress_dir()),
            settings,
            parts,
            paths,
            store,
            state,
            backoff,
            abort_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    /// Flag checked at the top of every tick; set from a Ctrl-C handler.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort_flag)
    }

    /// Run ticks until the session finishes.
    pub fn run(&mut self) -> anyhow::Result<Outcome> {
        loop {
            let tick = {
                let _span =
                    tracing::debug_span!("tick", revision = self.state.revision).entered();
                self.tick()?
            };
            if let Tick::Finished(outcome) = tick {
                return Ok(outcome);
            }
            self.pause();
        }
    }

    /// Sleep for the poll interval, waking early on abort.
    fn pause(&self) {
        let deadline = Instant::now() + self.settings.poll_interval;
        while Instant::now() < deadline {
            if self.abort_flag.load(Ordering::SeqCst) || self.paths.abort_signal().exists() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100).min(self.settings.poll_interval));
        }
    }

    /// One pass over the coordinator loop.
    pub fn tick(&mut self) -> anyhow::Result<Tick> {
        if self.state.lifecycle.is_terminal() {
            return Ok(Tick::Finished(self.outcome()));
        }
        if self.abort_flag.load(Ordering::SeqCst) || self.paths.abort_signal().exists() {
            self.abort("abort requested")?;
            return Ok(Tick::Finished(Outcome::Aborted));
        }

        self.consult_operator()?;
        if self.state.lifecycle == Lifecycle::Aborted {
            return Ok(Tick::Finished(Outcome::Aborted));
        }

        self.refresh_tasks();
        self.spawn_ready()?;
        self.poll_workers()?;
        self.enqueue_ready()?;
        self.drain_queue()?;
        if self.state.lifecycle == Lifecycle::Aborted {
            return Ok(Tick::Finished(Outcome::Aborted));
        }

        if self.is_finished() {
            return Ok(Tick::Finished(self.finish()?));
        }
        let resting = if self
            .state
            .tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::Blocked))
        {
            Lifecycle::Monitoring
        } else {
            Lifecycle::Draining
        };
        self.enter(resting)?;
        Ok(Tick::Continue)
    }

    fn enter(&mut self, lifecycle: Lifecycle) -> anyhow::Result<()> {
        if self.state.lifecycle != lifecycle {
            tracing::debug!(from = %self.state.lifecycle, to = %lifecycle, "lifecycle");
            self.state.lifecycle = lifecycle;
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&mut self) -> anyhow::Result<()> {
        self.store.save(&mut self.state)
    }

    /// Update a task in the state and mirror it to the backlog.
    ///
    /// The state file is authoritative; a backlog that cannot be written is
    /// logged and left behind.
    fn set_task_status(&mut self, task_id: &str, status: TaskStatus) {
        if self.state.task_status(task_id) == Some(status) {
            return;
        }
        self.state.set_task_status(task_id, status);
        self.mirror_status(task_id, status);
    }

    fn mirror_status(&mut self, task_id: &str, status: TaskStatus) {
        let backoff = self.backoff;
        let backlog = &mut self.parts.backlog;
        if let Err(e) = backoff.run("update backlog", || backlog.update_status(task_id, status)) {
            tracing::error!(task = task_id, %status, error = %e, "backlog not updated");
        }
    }

    /// Promote and demote on dependency changes; skip tasks whose
    /// dependencies can no longer complete.
    fn refresh_tasks(&mut self) {
        for (task_id, status) in task::refresh_readiness(&mut self.state.tasks) {
            self.mirror_status(&task_id, status);
        }

        loop {
            let doomed = self.state.tasks.iter().find_map(|t| {
                if t.status != TaskStatus::Blocked {
                    return None;
                }
                t.depends_on.iter().find_map(|dep| {
                    matches!(
                        self.state.task_status(dep),
                        Some(TaskStatus::Failed | TaskStatus::Skipped)
                    )
                    .then(|| (t.id.clone(), dep.clone()))
                })
            });
            let Some((task_id, dep)) = doomed else { break };
            self.set_task_status(&task_id, TaskStatus::Skipped);
            self.state.log(
                EventKind::TaskFinished,
                Some(&task_id),
                None,
                format!("skipped: dependency {dep} will not complete"),
            );
        }
    }

    fn is_finished(&self) -> bool {
        self.state.active_workers.is_empty()
            && self.state.merge_queue.is_empty()
            && self.state.escalations.is_empty()
            && self.state.tasks.iter().all(|t| t.status.is_terminal())
    }

    fn outcome(&self) -> Outcome {
        if self.state.lifecycle == Lifecycle::Aborted {
            return Outcome::Aborted;
        }
        let failed: Vec<String> = self
            .state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect();
        if failed.is_empty() {
            Outcome::Clean
        } else {
            Outcome::UnresolvedFailures(failed)
        }
    }

    fn finish(&mut self) -> anyhow::Result<Outcome> {
        let progress = self.state.progress();
        let message = format!(
            "session done: {} completed, {} failed, {} skipped, {} merge(s)",
            progress.completed,
            progress.failed,
            progress.skipped,
            self.state.merges.len()
        );
        self.state.log(EventKind::Done, None, None, message);
        self.state.lifecycle = Lifecycle::Done;
        self.persist()?;
        self.store.archive(&self.state)?;
        Ok(self.outcome())
    }

    /// Stop the session cooperatively.
    ///
    /// No new workers or merges start. Active workers are recorded as failed
    /// and their tasks go back to `ready`; every unmerged branch is either
    /// deleted or recorded as abandoned, per `abort.delete_branches`.
    pub fn abort(&mut self, reason: &str) -> anyhow::Result<()> {
        if self.state.lifecycle.is_terminal() {
            return Ok(());
        }
        self.state
            .log(EventKind::Aborted, None, None, format!("aborting: {reason}"));

        for worker_id in self.state.active_workers.clone() {
            if self.settings.abort.terminate_workers
                && let Err(e) = self.parts.executor.terminate(&worker_id)
            {
                tracing::warn!(worker = %worker_id, error = %format!("{e:#}"), "could not terminate worker");
            }
            let Some(handle) = self.state.worker_mut(&worker_id) else {
                continue;
            };
            handle.status = WorkerStatus::Failed;
            handle.error = Some("session aborted".to_string());
            let task_id = handle.task_id.clone();
            self.state.retire(&worker_id);
            self.set_task_status(&task_id, TaskStatus::Ready);
        }
        let stranded: Vec<String> = self
            .state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect();
        for task_id in stranded {
            self.set_task_status(&task_id, TaskStatus::Ready);
        }
        self.state.merge_queue = MergeQueue::new();
        self.state.queue_paused_by = None;
        for escalation in std::mem::take(&mut self.state.escalations) {
            self.state.log(
                EventKind::Decided,
                Some(&escalation.task_id),
                escalation.worker_id.as_deref(),
                format!("escalation {} dropped by abort", escalation.id),
            );
        }

        let open: Vec<_> = self
            .state
            .branches
            .values()
            .filter(|b| b.fate == BranchFate::Active)
            .cloned()
            .collect();
        for record in open {
            let fate = if self.settings.abort.delete_branches {
                self.remove_branch(&record.branch, record.workdir.as_deref())
            } else {
                BranchFate::Abandoned
            };
            self.state.set_branch_fate(&record.branch, fate);
        }

        let signal = self.paths.abort_signal();
        if signal.exists() {
            std::fs::remove_file(&signal)?;
        }
        self.state.lifecycle = Lifecycle::Aborted;
        self.persist()?;
        self.store.archive(&self.state)?;
        Ok(())
    }

    /// Delete a branch and its worktree. Falls back to `Abandoned` when git
    /// refuses, so the branch is still accounted for.
    fn remove_branch(&mut self, branch: &str, workdir: Option<&Path>) -> BranchFate {
        if let Some(dir) = workdir
            && let Err(e) = self.parts.vcs.remove_worktree(dir)
        {
            tracing::warn!(%branch, error = %format!("{e:#}"), "could not remove worktree");
        }
        match self.parts.vcs.delete_branch(branch) {
            Ok(()) => BranchFate::Removed,
            Err(e) => {
                tracing::warn!(%branch, error = %format!("{e:#}"), "could not delete branch; leaving it");
                BranchFate::Abandoned
            }
        }
    }
}
