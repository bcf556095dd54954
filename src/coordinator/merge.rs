//! Draining the merge queue: one entry at a time onto fresh trunk.

use chrono::Utc;

use super::Coordinator;
use super::failures::Raise;
use crate::config::MergeStrategy;
use crate::error::CoordinatorError;
use crate::escalation::{Choice, Origin};
use crate::failure::FailureCategory;
use crate::phase::{Phase, WorkerStatus};
use crate::progress::Milestone;
use crate::queue::MergeQueueEntry;
use crate::state::{BranchFate, EventKind, Lifecycle, MergeRecord};
use crate::task::TaskStatus;
use crate::vcs::Integration;
use crate::verify::Verification;

fn short(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}

impl Coordinator {
    /// Work on the queue head unless the queue is paused. The head is only
    /// popped once its merge is settled.
    pub(super) fn drain_queue(&mut self) -> anyhow::Result<()> {
        if self.state.queue_paused_by.is_some() {
            return Ok(());
        }
        let Some(entry) = self.state.merge_queue.head().cloned() else {
            return Ok(());
        };
        self.enter(Lifecycle::Merging)?;
        let _span = tracing::info_span!("drain", task = %entry.task_id, branch = %entry.branch_name)
            .entered();

        let base = match self.refresh_trunk() {
            Ok(base) => base,
            Err(e) => return self.pause_for_infra(&entry, &e),
        };
        match self.integrate(&entry.branch_name, false) {
            Ok(Integration::Clean(commit)) => self.complete_merge(&entry, &base, &commit),
            Ok(Integration::Conflict(files)) => {
                self.state.log(
                    EventKind::ConflictDetected,
                    Some(&entry.task_id),
                    Some(&entry.worker_id),
                    format!("{} conflicts with trunk in {}", entry.branch_name, files.join(", ")),
                );
                self.back_out();
                if self.settings.auto_resolve {
                    self.reconcile(&entry)
                } else {
                    self.pause_for_conflict(&entry, files, "automatic resolution is off")
                }
            }
            Err(e) => {
                self.back_out();
                let e = CoordinatorError::infrastructure("integrate branch", format!("{e:#}"));
                self.pause_for_infra(&entry, &e)
            }
        }
    }

    /// Sync trunk and return its head, the base the next merge builds on.
    fn refresh_trunk(&mut self) -> Result<String, CoordinatorError> {
        let backoff = self.backoff;
        let vcs = &mut self.parts.vcs;
        backoff.run("refresh trunk", || {
            vcs.sync_trunk()?;
            vcs.trunk_head()
        })
    }

    fn integrate(&mut self, branch: &str, reconcile: bool) -> anyhow::Result<Integration> {
        match (self.settings.strategy, reconcile) {
            (MergeStrategy::Merge, false) => self.parts.vcs.merge_commit(branch),
            (MergeStrategy::Rebase, _) | (MergeStrategy::Merge, true) => {
                self.parts.vcs.rebase_and_merge(branch, reconcile)
            }
        }
    }

    fn back_out(&mut self) {
        if let Err(e) = self.parts.vcs.abort_integration() {
            tracing::warn!(error = %format!("{e:#}"), "could not back out of the failed integration");
        }
    }

    /// One automatic retry: refetch trunk and replay the branch onto it.
    fn reconcile(&mut self, entry: &MergeQueueEntry) -> anyhow::Result<()> {
        let base = match self.refresh_trunk() {
            Ok(base) => base,
            Err(e) => return self.pause_for_infra(entry, &e),
        };
        match self.integrate(&entry.branch_name, true) {
            Ok(Integration::Clean(commit)) => {
                self.state.log(
                    EventKind::AutoResolved,
                    Some(&entry.task_id),
                    Some(&entry.worker_id),
                    "conflict reconciled by rebasing onto fresh trunk",
                );
                self.complete_merge(entry, &base, &commit)
            }
            Ok(Integration::Conflict(files)) => {
                self.back_out();
                self.pause_for_conflict(entry, files, "the automatic rebase conflicted too")
            }
            Err(e) => {
                self.back_out();
                let e = CoordinatorError::infrastructure("rebase branch", format!("{e:#}"));
                self.pause_for_infra(entry, &e)
            }
        }
    }

    fn pause_for_conflict(
        &mut self,
        entry: &MergeQueueEntry,
        files: Vec<String>,
        why: &str,
    ) -> anyhow::Result<()> {
        let conflict = CoordinatorError::MergeConflict {
            task_id: entry.task_id.clone(),
            files: files.clone(),
        };
        self.escalate(Raise {
            category: FailureCategory::MergeConflict,
            origin: Origin::MergeDrain,
            task_id: entry.task_id.clone(),
            worker_id: Some(entry.worker_id.clone()),
            phase: Some(Phase::ReadyToMerge),
            detail: format!("{conflict} ({why}); the merge queue is paused"),
            options: vec![Choice::Resolve, Choice::Skip, Choice::Abort],
            files,
        })?;
        Ok(())
    }

    fn pause_for_infra(
        &mut self,
        entry: &MergeQueueEntry,
        error: &CoordinatorError,
    ) -> anyhow::Result<()> {
        self.escalate(Raise {
            category: FailureCategory::InfrastructureFailure,
            origin: Origin::MergeDrain,
            task_id: entry.task_id.clone(),
            worker_id: Some(entry.worker_id.clone()),
            phase: Some(Phase::ReadyToMerge),
            detail: format!("{error}; the merge queue is paused"),
            options: vec![Choice::Retry, Choice::Skip, Choice::Abort],
            files: Vec::new(),
        })?;
        Ok(())
    }

    /// Trunk now holds the branch on top of `base`: publish it, clean up,
    /// and settle the entry.
    ///
    /// A merge that cannot be pushed is taken off local trunk again, so
    /// whatever the operator chooses next starts from `base`.
    fn complete_merge(
        &mut self,
        entry: &MergeQueueEntry,
        base: &str,
        commit: &str,
    ) -> anyhow::Result<()> {
        if self.settings.push {
            let backoff = self.backoff;
            let vcs = &mut self.parts.vcs;
            if let Err(e) = backoff.run("push trunk", || vcs.push_trunk()) {
                self.unwind_merge(entry, base);
                return self.pause_for_infra(entry, &e);
            }
        }

        let workdir = self
            .state
            .branches
            .get(&entry.branch_name)
            .and_then(|b| b.workdir.clone());
        if let Some(dir) = &workdir
            && let Err(e) = self.parts.vcs.remove_worktree(dir)
        {
            tracing::warn!(worker = %entry.worker_id, error = %format!("{e:#}"), "could not remove worktree");
        }
        if self.settings.delete_branches
            && let Err(e) = self.parts.vcs.delete_branch(&entry.branch_name)
        {
            tracing::warn!(branch = %entry.branch_name, error = %format!("{e:#}"), "could not delete merged branch");
        }
        self.state
            .set_branch_fate(&entry.branch_name, BranchFate::Merged);

        let now = Utc::now();
        self.state.merges.push(MergeRecord {
            task_id: entry.task_id.clone(),
            worker_id: entry.worker_id.clone(),
            branch: entry.branch_name.clone(),
            base: base.to_string(),
            commit: commit.to_string(),
            merged_at: now,
            reverted_by: None,
        });
        if let Some(handle) = self.state.worker_mut(&entry.worker_id) {
            handle.phase = Phase::Merged;
            handle.status = WorkerStatus::Completed;
            handle.milestones.push(Milestone {
                phase: Phase::Merged,
                at: now,
            });
        }
        self.state.retire(&entry.worker_id);
        if self
            .state
            .merge_queue
            .head()
            .is_some_and(|h| h.task_id == entry.task_id)
        {
            self.state.merge_queue.pop_head();
        }
        self.set_task_status(&entry.task_id, TaskStatus::Completed);
        self.state.log(
            EventKind::Merged,
            Some(&entry.task_id),
            Some(&entry.worker_id),
            format!("merged {} as {}", entry.branch_name, short(commit)),
        );
        self.persist()?;

        self.verify_trunk(entry)
    }

    fn unwind_merge(&mut self, entry: &MergeQueueEntry, base: &str) {
        match self.parts.vcs.reset_trunk(base) {
            Ok(()) => {
                self.state.log(
                    EventKind::Unwound,
                    Some(&entry.task_id),
                    Some(&entry.worker_id),
                    format!("{} not pushed; local trunk reset to {}", entry.branch_name, short(base)),
                );
            }
            Err(e) => {
                tracing::error!(
                    branch = %entry.branch_name,
                    error = %format!("{e:#}"),
                    "could not reset local trunk after a failed push; it still holds the unpublished merge"
                );
            }
        }
    }

    /// Build and test trunk after a merge; a failure pauses the queue.
    fn verify_trunk(&mut self, entry: &MergeQueueEntry) -> anyhow::Result<()> {
        let detail = match self.parts.verifier.verify() {
            Ok(Verification::Skipped) => return Ok(()),
            Ok(Verification::Passed) => {
                self.state.log(
                    EventKind::Verified,
                    Some(&entry.task_id),
                    None,
                    "trunk verified",
                );
                return self.persist();
            }
            Ok(Verification::Failed(detail)) => detail,
            Err(e) => format!("verification could not run: {e:#}"),
        };
        let failure = CoordinatorError::VerificationFailure {
            task_id: entry.task_id.clone(),
            detail,
        };
        self.escalate(Raise {
            category: FailureCategory::VerificationFailure,
            origin: Origin::PostMerge,
            task_id: entry.task_id.clone(),
            worker_id: Some(entry.worker_id.clone()),
            phase: Some(Phase::Merged),
            detail: format!("{failure}; the merge queue is paused"),
            options: vec![Choice::RevertLast, Choice::RevertAll, Choice::Manual],
            files: Vec::new(),
        })?;
        Ok(())
    }
}
