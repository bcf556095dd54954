//! Filling free worker slots with ready tasks.

use chrono::Utc;

use super::Coordinator;
use crate::error::CoordinatorError;
use crate::escalation::{Choice, Origin};
use crate::executor::SpawnRequest;
use crate::failure::{FailureCategory, attempt_cap};
use crate::phase::{Phase, WorkerStatus};
use crate::progress::{Milestone, ProgressRecord};
use crate::state::{BranchFate, BranchRecord, EventKind, Lifecycle, WorkerHandle};
use crate::task::{self, Task, TaskStatus};

use super::failures::Raise;

impl Coordinator {
    /// A task may get a new worker when it is ready (or was handed back by a
    /// revert), has no live worker, and no escalation is waiting on it.
    fn spawnable(&self, task: &Task) -> bool {
        matches!(task.status, TaskStatus::Ready | TaskStatus::InProgress)
            && self.state.active_worker_for(&task.id).is_none()
            && self.state.escalation_for_task(&task.id).is_none()
    }

    pub(super) fn spawn_ready(&mut self) -> anyhow::Result<()> {
        loop {
            let active = u32::try_from(self.state.active_workers.len()).unwrap_or(u32::MAX);
            if active >= self.state.max_concurrency {
                return Ok(());
            }
            let candidates: Vec<usize> = self
                .state
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| self.spawnable(t))
                .map(|(i, _)| i)
                .collect();
            let Some(&next) = task::spawn_order(&self.state.tasks, &candidates).first() else {
                return Ok(());
            };
            let task = self.state.tasks[next].clone();

            let spawned = self.state.attempts.get(&task.id).copied().unwrap_or(0);
            let cap = attempt_cap(self.state.retry_limits.worker_limit);
            if spawned >= cap {
                self.escalate(Raise {
                    category: FailureCategory::WorkerFailure,
                    origin: Origin::Worker,
                    task_id: task.id.clone(),
                    worker_id: None,
                    phase: None,
                    detail: format!(
                        "task {} needs another worker but has used all {cap} attempts",
                        task.id
                    ),
                    options: vec![Choice::Skip, Choice::Abort],
                    files: Vec::new(),
                })?;
                continue;
            }

            self.enter(Lifecycle::Spawning)?;
            self.spawn_worker(&task, spawned + 1)?;
        }
    }

    fn spawn_worker(&mut self, task: &Task, attempt: u32) -> anyhow::Result<()> {
        let worker_id = format!("{}-w{attempt}", task.id);
        let _span = tracing::info_span!("spawn", task = %task.id, worker = %worker_id).entered();
        let session_tag = self
            .state
            .session_id
            .rsplit('-')
            .next()
            .unwrap_or_default()
            .to_string();
        let branch = format!(
            "{}/{}-{session_tag}-{attempt}",
            self.settings.branch_prefix, task.id
        );
        let workdir = self
            .settings
            .worktree_root
            .as_ref()
            .map(|root| root.join(&worker_id));
        let backoff = self.backoff;

        let vcs = &mut self.parts.vcs;
        if let Err(e) = backoff.run("create branch", || vcs.create_branch(&branch)) {
            return self.spawn_failed(task, &worker_id, e);
        }
        self.state.branches.insert(
            branch.clone(),
            BranchRecord {
                branch: branch.clone(),
                task_id: task.id.clone(),
                worker_id: worker_id.clone(),
                workdir: workdir.clone(),
                fate: BranchFate::Active,
            },
        );
        self.persist()?;

        if let Some(dir) = &workdir {
            let vcs = &mut self.parts.vcs;
            if let Err(e) = backoff.run("create worktree", || vcs.add_worktree(&branch, dir)) {
                let fate = self.remove_branch(&branch, None);
                self.state.set_branch_fate(&branch, fate);
                return self.spawn_failed(task, &worker_id, e);
            }
        }
        let workdir_path = workdir
            .clone()
            .unwrap_or_else(|| self.settings.project_root.clone());

        // The coordinator writes the first record; from here on only the
        // worker does.
        let mut record = ProgressRecord::started(&worker_id, &task.id, &branch, attempt - 1);
        let now = Utc::now();
        record.phase = Phase::Implementing;
        record.status = WorkerStatus::InProgress;
        record.milestones.push(Milestone {
            phase: Phase::Implementing,
            at: now,
        });
        let progress = &self.progress;
        if let Err(e) = backoff.run("seed progress record", || {
            progress.write(&record).map_err(anyhow::Error::from)
        }) {
            let fate = self.remove_branch(&branch, workdir.as_deref());
            self.state.set_branch_fate(&branch, fate);
            return self.spawn_failed(task, &worker_id, e);
        }

        let progress_path = self.progress.path(&worker_id);
        let request = SpawnRequest {
            task_id: &task.id,
            task_title: &task.title,
            worker_id: &worker_id,
            branch: &branch,
            workdir: &workdir_path,
            progress_path: &progress_path,
            attempt,
        };
        if let Err(e) = self.parts.executor.spawn(&request) {
            let fate = self.remove_branch(&branch, workdir.as_deref());
            self.state.set_branch_fate(&branch, fate);
            let e = CoordinatorError::infrastructure("start worker", format!("{e:#}"));
            return self.spawn_failed(task, &worker_id, e);
        }

        self.state.workers.insert(
            worker_id.clone(),
            WorkerHandle {
                worker_id: worker_id.clone(),
                task_id: task.id.clone(),
                status: WorkerStatus::InProgress,
                phase: Phase::Implementing,
                branch_name: branch.clone(),
                workdir,
                change_request_ref: None,
                retry_count: attempt - 1,
                milestones: record.milestones.clone(),
                error: None,
                spawned_at: now,
                last_digest: None,
                unreadable_since: None,
                ci_failures: 0,
                ci_failure_counted: false,
                archived: false,
            },
        );
        self.state.active_workers.push(worker_id.clone());
        self.state.attempts.insert(task.id.clone(), attempt);
        self.set_task_status(&task.id, TaskStatus::InProgress);
        self.state.log(
            EventKind::Spawned,
            Some(&task.id),
            Some(&worker_id),
            format!("spawned on {branch} (attempt {attempt})"),
        );
        self.persist()
    }

    /// Hand a task whose worker could not be started to the operator.
    fn spawn_failed(
        &mut self,
        task: &Task,
        worker_id: &str,
        error: CoordinatorError,
    ) -> anyhow::Result<()> {
        tracing::error!(task = %task.id, worker = worker_id, error = %error, "could not start worker");
        self.escalate(Raise {
            category: FailureCategory::InfrastructureFailure,
            origin: Origin::Spawn,
            task_id: task.id.clone(),
            worker_id: None,
            phase: None,
            detail: format!("could not start a worker for {}: {error}", task.id),
            options: vec![Choice::Retry, Choice::Skip, Choice::Abort],
            files: Vec::new(),
        })?;
        Ok(())
    }
}
