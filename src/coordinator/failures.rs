//! Worker failures, escalations, and applying the operator's decisions.

use chrono::Utc;

use super::Coordinator;
use crate::escalation::{Choice, Escalation, Origin};
use crate::failure::{FailureCategory, WorkerReaction, react_to_worker_failure};
use crate::phase::{Phase, WorkerStatus};
use crate::state::{BranchFate, EventKind};
use crate::task::TaskStatus;

/// Everything needed to raise an escalation.
pub(super) struct Raise {
    pub category: FailureCategory,
    pub origin: Origin,
    pub task_id: String,
    pub worker_id: Option<String>,
    pub phase: Option<Phase>,
    pub detail: String,
    pub options: Vec<Choice>,
    pub files: Vec<String>,
}

impl Coordinator {
    /// Record a new escalation. Merge and verification escalations also pause
    /// the merge queue until they are decided.
    pub(super) fn escalate(&mut self, raise: Raise) -> anyhow::Result<String> {
        let id = self.state.next_escalation_id();
        tracing::warn!(
            escalation = %id,
            category = %raise.category,
            task = %raise.task_id,
            detail = %raise.detail,
            "escalating to operator"
        );
        if matches!(raise.origin, Origin::MergeDrain | Origin::PostMerge) {
            self.state.queue_paused_by = Some(id.clone());
        }
        self.state.log(
            EventKind::Escalated,
            Some(&raise.task_id),
            raise.worker_id.as_deref(),
            format!("{} {}: {}", raise.category.title(), id, raise.detail),
        );
        self.state.escalations.push(Escalation {
            id: id.clone(),
            category: raise.category,
            origin: raise.origin,
            task_id: raise.task_id,
            worker_id: raise.worker_id,
            phase: raise.phase,
            detail: raise.detail,
            options: raise.options,
            conflicting_files: raise.files,
            raised_at: Utc::now(),
        });
        self.persist()?;
        Ok(id)
    }

    /// Ask the operator about every pending escalation and apply the answers.
    pub(super) fn consult_operator(&mut self) -> anyhow::Result<()> {
        for escalation in self.state.escalations.clone() {
            let progress = self.state.progress();
            let choice = match self.parts.operator.decide(&escalation, &progress) {
                Ok(Some(choice)) => choice,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(escalation = %escalation.id, error = %format!("{e:#}"), "operator unavailable");
                    continue;
                }
            };
            if !escalation.offers(choice) {
                tracing::warn!(escalation = %escalation.id, %choice, "choice was not offered; ignoring");
                continue;
            }

            self.state.escalations.retain(|e| e.id != escalation.id);
            if self.state.queue_paused_by.as_deref() == Some(escalation.id.as_str()) {
                self.state.queue_paused_by = None;
            }
            self.state.log(
                EventKind::Decided,
                Some(&escalation.task_id),
                escalation.worker_id.as_deref(),
                format!("operator chose {choice} for {}", escalation.id),
            );
            self.apply_choice(&escalation, choice)?;
            self.persist()?;
            if self.state.lifecycle.is_terminal() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn apply_choice(&mut self, escalation: &Escalation, choice: Choice) -> anyhow::Result<()> {
        let task_id = escalation.task_id.as_str();
        match (escalation.origin, choice) {
            (_, Choice::Abort) => {
                return self.abort(&format!("operator chose abort on {}", escalation.id));
            }
            (Origin::Worker | Origin::Spawn, Choice::Retry) => {
                self.set_task_status(task_id, TaskStatus::Ready);
            }
            (Origin::Worker | Origin::Spawn, Choice::Skip) => {
                self.finish_task(task_id, TaskStatus::Skipped, "skipped by operator");
            }
            (Origin::Progress | Origin::Ci, Choice::Retry) => {
                if let Some(handle) = escalation
                    .worker_id
                    .as_deref()
                    .and_then(|w| self.state.worker_mut(w))
                {
                    handle.unreadable_since = None;
                    handle.ci_failures = 0;
                    handle.ci_failure_counted = false;
                    // Re-read the record on the next poll even if it is unchanged.
                    handle.last_digest = None;
                }
            }
            (Origin::Progress | Origin::Ci, Choice::Skip) => {
                if let Some(worker_id) = escalation.worker_id.as_deref() {
                    self.drop_worker(worker_id, "task skipped by operator");
                }
                self.finish_task(task_id, TaskStatus::Skipped, "skipped by operator");
            }
            (Origin::MergeDrain, Choice::Retry | Choice::Resolve) => {
                // The queue is unpaused; the head is integrated again next drain.
            }
            (Origin::MergeDrain, Choice::Skip) => {
                self.state.merge_queue.remove_task(task_id);
                if let Some(worker_id) = escalation.worker_id.as_deref() {
                    self.drop_worker(worker_id, "merge skipped by operator");
                }
                self.finish_task(task_id, TaskStatus::Failed, "merge skipped by operator");
            }
            (Origin::PostMerge, Choice::RevertLast) => self.revert_merges(false)?,
            (Origin::PostMerge, Choice::RevertAll) => self.revert_merges(true)?,
            (Origin::PostMerge, Choice::Manual) => {
                self.state.log(
                    EventKind::Decided,
                    Some(task_id),
                    None,
                    "trunk left as is for manual repair",
                );
            }
            (origin, choice) => {
                tracing::warn!(?origin, %choice, "no action for this choice");
            }
        }
        Ok(())
    }

    fn finish_task(&mut self, task_id: &str, status: TaskStatus, why: &str) {
        self.set_task_status(task_id, status);
        self.state
            .log(EventKind::TaskFinished, Some(task_id), None, format!("{status}: {why}"));
    }

    /// Retire a worker that is being given up on, leaving its branch in place.
    fn drop_worker(&mut self, worker_id: &str, why: &str) {
        let Some(handle) = self.state.worker_mut(worker_id) else {
            return;
        };
        if handle.archived {
            return;
        }
        handle.status = WorkerStatus::Failed;
        handle.error = Some(why.to_string());
        let branch = handle.branch_name.clone();
        if self.settings.abort.terminate_workers
            && let Err(e) = self.parts.executor.terminate(worker_id)
        {
            tracing::warn!(worker = worker_id, error = %format!("{e:#}"), "could not terminate worker");
        }
        self.state.retire(worker_id);
        self.state.set_branch_fate(&branch, BranchFate::Abandoned);
    }

    /// A worker reported (or was found in) a failure.
    ///
    /// The worker is retired with its branch recorded as abandoned. The task
    /// gets a fresh worker while it is under the retry limit; after that the
    /// operator decides.
    pub(super) fn fail_worker(
        &mut self,
        worker_id: &str,
        category: FailureCategory,
        detail: &str,
    ) -> anyhow::Result<()> {
        let Some(handle) = self.state.worker_mut(worker_id) else {
            return Ok(());
        };
        // The phase the worker failed in, not `failed` itself.
        let from = handle
            .milestones
            .iter()
            .rev()
            .map(|m| m.phase)
            .find(|p| *p != Phase::Failed)
            .unwrap_or(handle.phase);
        if handle.phase != Phase::Failed {
            handle.phase = Phase::Failed;
            handle.milestones.push(crate::progress::Milestone {
                phase: Phase::Failed,
                at: Utc::now(),
            });
        }
        handle.status = WorkerStatus::Failed;
        handle.error = Some(detail.to_string());
        let task_id = handle.task_id.clone();
        let branch = handle.branch_name.clone();

        self.state.retire(worker_id);
        self.state.merge_queue.remove_task(&task_id);
        self.state.set_branch_fate(&branch, BranchFate::Abandoned);

        let failures = {
            let n = self.state.failures.entry(task_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let spawned = self.state.attempts.get(&task_id).copied().unwrap_or(0);
        let limit = self.state.retry_limits.worker_limit;

        match react_to_worker_failure(failures, spawned, limit) {
            WorkerReaction::Respawn => {
                self.set_task_status(&task_id, TaskStatus::Ready);
                self.state.log(
                    EventKind::Respawn,
                    Some(&task_id),
                    Some(worker_id),
                    format!("{category} ({failures}/{limit}): {detail}; a new worker will be spawned"),
                );
                self.persist()
            }
            WorkerReaction::Escalate { can_retry } => {
                let mut options = Vec::with_capacity(3);
                if can_retry {
                    options.push(Choice::Retry);
                }
                options.extend([Choice::Skip, Choice::Abort]);
                self.escalate(Raise {
                    category,
                    origin: Origin::Worker,
                    task_id: task_id.clone(),
                    worker_id: Some(worker_id.to_string()),
                    phase: Some(from),
                    detail: format!(
                        "{detail} ({failures} failed worker(s), limit {limit})"
                    ),
                    options,
                    files: Vec::new(),
                })?;
                Ok(())
            }
        }
    }

    /// Undo the latest merge, or every merge of the session newest first.
    /// Each reverted task goes back to `in_progress` for a new worker.
    pub(super) fn revert_merges(&mut self, all: bool) -> anyhow::Result<()> {
        let mut targets: Vec<usize> = (0..self.state.merges.len())
            .rev()
            .filter(|&i| self.state.merges[i].reverted_by.is_none())
            .collect();
        if !all {
            targets.truncate(1);
        }
        if targets.is_empty() {
            tracing::warn!("nothing left to revert");
            return Ok(());
        }

        for index in targets {
            let record = &self.state.merges[index];
            let commit = record.commit.clone();
            let task_id = record.task_id.clone();
            // Sessions saved before the base was recorded only know the head.
            let base = if record.base.is_empty() {
                format!("{commit}^")
            } else {
                record.base.clone()
            };
            let revert = match self.parts.vcs.revert(&base, &commit) {
                Ok(revert) => revert,
                Err(e) => {
                    self.escalate(Raise {
                        category: FailureCategory::InfrastructureFailure,
                        origin: Origin::PostMerge,
                        task_id,
                        worker_id: None,
                        phase: None,
                        detail: format!("reverting {commit} failed: {e:#}"),
                        options: vec![Choice::RevertLast, Choice::RevertAll, Choice::Manual, Choice::Abort],
                        files: Vec::new(),
                    })?;
                    return Ok(());
                }
            };
            self.state.merges[index].reverted_by = Some(revert.clone());
            self.set_task_status(&task_id, TaskStatus::InProgress);
            self.state.log(
                EventKind::Reverted,
                Some(&task_id),
                None,
                format!("reverted {base}..{commit} with {revert}; task needs a new worker"),
            );
            self.persist()?;
        }

        if self.settings.push {
            let backoff = self.backoff;
            let vcs = &mut self.parts.vcs;
            if let Err(e) = backoff.run("push trunk", || vcs.push_trunk()) {
                tracing::error!(error = %e, "revert is on the local trunk only; it goes out with the next push");
            }
        }
        Ok(())
    }
}
