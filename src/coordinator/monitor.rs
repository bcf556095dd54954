//! Polling worker progress records, CI, and worker processes.

use chrono::{DateTime, Utc};

use super::Coordinator;
use super::failures::Raise;
use crate::ci::{CiQuery, CiStatus};
use crate::error::CoordinatorError;
use crate::escalation::{Choice, Origin};
use crate::executor::WorkerExit;
use crate::failure::FailureCategory;
use crate::phase::{Phase, WorkerStatus};
use crate::progress::{FailureKind, Milestone, ProgressRecord, Snapshot};
use crate::queue::MergeQueueEntry;
use crate::state::{EventKind, Lifecycle};

/// Phase steps a record implies beyond what the handle already knows.
///
/// When the record's milestones extend the handle's, each new milestone is
/// one step. Otherwise the record's current phase is the only step.
fn new_steps(known: &[Milestone], record: &ProgressRecord) -> Vec<(Phase, DateTime<Utc>)> {
    let extends = record.milestones.len() > known.len()
        && record
            .milestones
            .iter()
            .zip(known)
            .all(|(a, b)| a.phase == b.phase);
    let mut steps: Vec<(Phase, DateTime<Utc>)> = if extends {
        record.milestones[known.len()..]
            .iter()
            .map(|m| (m.phase, m.at))
            .collect()
    } else {
        Vec::new()
    };

    let reported = if record.status == WorkerStatus::Failed {
        Phase::Failed
    } else {
        record.phase
    };
    let last = steps
        .last()
        .map(|(p, _)| *p)
        .or_else(|| known.last().map(|m| m.phase));
    if last != Some(reported) {
        steps.push((reported, record.last_update));
    }
    steps
}

fn describe_exit(code: Option<i32>) -> String {
    code.map_or_else(|| "killed by a signal".to_string(), |c| format!("exit code {c}"))
}

impl Coordinator {
    fn is_held(&self, worker_id: &str) -> bool {
        self.state
            .escalations
            .iter()
            .any(|e| e.worker_id.as_deref() == Some(worker_id))
    }

    pub(super) fn poll_workers(&mut self) -> anyhow::Result<()> {
        if self.state.active_workers.is_empty() {
            return Ok(());
        }
        self.enter(Lifecycle::Monitoring)?;
        for worker_id in self.state.active_workers.clone() {
            if self.is_held(&worker_id) {
                continue;
            }
            self.poll_worker(&worker_id)?;
        }
        Ok(())
    }

    fn poll_worker(&mut self, worker_id: &str) -> anyhow::Result<()> {
        // Check the process before the record: anything it wrote before
        // exiting is then visible to the read below.
        let exit = self.parts.executor.poll(worker_id).unwrap_or_else(|e| {
            tracing::warn!(worker = worker_id, error = %format!("{e:#}"), "could not check worker process");
            WorkerExit::Unknown
        });

        match self.progress.read(worker_id) {
            Ok(Some(snapshot)) => self.observe(worker_id, snapshot)?,
            Ok(None) => self.record_unreadable(worker_id, "progress record is missing")?,
            Err(e) => self.record_unreadable(worker_id, &e.to_string())?,
        }

        let Some(handle) = self.state.worker(worker_id) else {
            return Ok(());
        };
        if handle.archived || self.is_held(worker_id) {
            return Ok(());
        }
        let phase = handle.phase;

        if let WorkerExit::Exited { success, code } = exit
            && phase < Phase::ReadyToMerge
        {
            let detail = format!(
                "worker process ended ({}, {}) while {phase}, without reporting ready_to_merge",
                describe_exit(code),
                if success { "success" } else { "failure" }
            );
            return self.fail_worker(worker_id, FailureCategory::WorkerFailure, &detail);
        }

        if phase == Phase::AwaitingVerification {
            self.observe_ci(worker_id)?;
        }
        Ok(())
    }

    /// Apply a freshly read record to the worker's handle.
    fn observe(&mut self, worker_id: &str, snapshot: Snapshot) -> anyhow::Result<()> {
        let Some(handle) = self.state.worker_mut(worker_id) else {
            return Ok(());
        };
        handle.unreadable_since = None;
        if handle.last_digest.as_deref() == Some(snapshot.digest.as_str()) {
            return Ok(());
        }
        handle.last_digest = Some(snapshot.digest);
        let record = snapshot.record;
        let task_id = handle.task_id.clone();

        if record.task_id != task_id {
            let detail = format!(
                "progress record names task {} but worker {worker_id} works on {task_id}",
                record.task_id
            );
            self.state.log(
                EventKind::AnomalousTransition,
                Some(&task_id),
                Some(worker_id),
                detail,
            );
            return self.persist();
        }
        if record.change_request_ref.is_some() {
            handle.change_request_ref.clone_from(&record.change_request_ref);
        }
        if record.error.is_some() {
            handle.error.clone_from(&record.error);
        }

        let mut events = Vec::new();
        for (phase, at) in new_steps(&handle.milestones, &record) {
            let current = handle.phase;
            if phase == current {
                continue;
            }
            if !current.worker_may_report(phase) {
                let anomaly = CoordinatorError::AnomalousTransition {
                    worker_id: worker_id.to_string(),
                    from: current.to_string(),
                    to: phase.to_string(),
                };
                events.push((
                    EventKind::AnomalousTransition,
                    format!("{anomaly}; keeping {current}"),
                ));
                break;
            }
            if current == Phase::AwaitingVerification {
                handle.ci_failure_counted = false;
            }
            handle.phase = phase;
            handle.status = WorkerStatus::for_phase(phase);
            handle.milestones.push(Milestone { phase, at });
            events.push((EventKind::Milestone, format!("{current} -> {phase}")));
        }
        let failed = handle.phase == Phase::Failed;

        for (kind, message) in events {
            if kind == EventKind::AnomalousTransition {
                tracing::warn!(worker = worker_id, "{message}");
            }
            self.state.log(kind, Some(&task_id), Some(worker_id), message);
        }
        self.persist()?;

        if failed {
            let category = match record.error_kind {
                Some(FailureKind::Test) => FailureCategory::TestFailure,
                _ => FailureCategory::WorkerFailure,
            };
            let detail = record
                .error
                .unwrap_or_else(|| "worker reported failure".to_string());
            self.fail_worker(worker_id, category, &detail)?;
        }
        Ok(())
    }

    /// A record that cannot be read is tolerated for the grace period, then
    /// escalated.
    fn record_unreadable(&mut self, worker_id: &str, detail: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let grace = self.settings.progress_grace;
        let Some(handle) = self.state.worker_mut(worker_id) else {
            return Ok(());
        };
        let first = handle.unreadable_since.is_none();
        let since = *handle.unreadable_since.get_or_insert(now);
        let task_id = handle.task_id.clone();
        let phase = handle.phase;

        if first {
            tracing::warn!(worker = worker_id, %detail, "progress record unreadable");
            self.persist()?;
        }
        let waited = (now - since).to_std().unwrap_or_default();
        if waited < grace {
            return Ok(());
        }
        self.escalate(Raise {
            category: FailureCategory::InfrastructureFailure,
            origin: Origin::Progress,
            task_id,
            worker_id: Some(worker_id.to_string()),
            phase: Some(phase),
            detail: format!(
                "progress record unreadable for {}s: {detail}",
                waited.as_secs()
            ),
            options: vec![Choice::Retry, Choice::Skip, Choice::Abort],
            files: Vec::new(),
        })?;
        Ok(())
    }

    /// Ask CI about a worker's change request and count failures.
    ///
    /// One failing run counts once, however many ticks observe it. A CI
    /// lookup that errors is treated as pending.
    fn observe_ci(&mut self, worker_id: &str) -> anyhow::Result<CiStatus> {
        let Some(handle) = self.state.worker(worker_id) else {
            return Ok(CiStatus::None);
        };
        let Some(change_request) = handle.change_request_ref.clone() else {
            return Ok(CiStatus::None);
        };
        let branch = handle.branch_name.clone();
        let task_id = handle.task_id.clone();
        let phase = handle.phase;

        let status = match self.parts.ci.status(&CiQuery {
            change_request: &change_request,
            branch: &branch,
            task_id: &task_id,
        }) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(worker = worker_id, error = %format!("{e:#}"), "CI lookup failed");
                return Ok(CiStatus::Pending);
            }
        };

        let limit = self.state.retry_limits.ci_limit;
        let Some(handle) = self.state.worker_mut(worker_id) else {
            return Ok(status);
        };
        if status == CiStatus::Pending && handle.ci_failure_counted {
            // A new run started.
            handle.ci_failure_counted = false;
            self.persist()?;
            return Ok(status);
        }
        if !status.is_failure() || handle.ci_failure_counted {
            return Ok(status);
        }

        handle.ci_failure_counted = true;
        handle.ci_failures += 1;
        let failures = handle.ci_failures;
        self.state.log(
            EventKind::CiFailed,
            Some(&task_id),
            Some(worker_id),
            format!("CI {status} on {change_request} ({failures}/{limit})"),
        );
        if failures >= limit {
            self.escalate(Raise {
                category: FailureCategory::CiFailure,
                origin: Origin::Ci,
                task_id,
                worker_id: Some(worker_id.to_string()),
                phase: Some(phase),
                detail: format!(
                    "CI reported {status} for {change_request} {failures} time(s) (limit {limit})"
                ),
                options: vec![Choice::Retry, Choice::Skip, Choice::Abort],
                files: Vec::new(),
            })?;
        } else {
            self.persist()?;
        }
        Ok(status)
    }

    /// Queue every worker that reached `ready_to_merge`, earliest first, once
    /// CI allows it.
    pub(super) fn enqueue_ready(&mut self) -> anyhow::Result<()> {
        let mut ready: Vec<(DateTime<Utc>, usize, String)> = self
            .state
            .active_workers
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| {
                let handle = self.state.worker(id)?;
                (handle.phase == Phase::ReadyToMerge
                    && !self.state.merge_queue.contains_task(&handle.task_id))
                .then(|| {
                    let at = handle.reached(Phase::ReadyToMerge).unwrap_or_else(Utc::now);
                    (at, pos, id.clone())
                })
            })
            .collect();
        ready.sort();

        for (_, _, worker_id) in ready {
            if self.is_held(&worker_id) {
                continue;
            }
            let status = self.observe_ci(&worker_id)?;
            if !status.allows_merge() {
                continue;
            }
            let Some(handle) = self.state.worker(&worker_id) else {
                continue;
            };
            let entry = MergeQueueEntry {
                change_request_ref: handle.change_request_ref.clone(),
                task_id: handle.task_id.clone(),
                worker_id: worker_id.clone(),
                branch_name: handle.branch_name.clone(),
                enqueued_at: Utc::now(),
            };
            let task_id = entry.task_id.clone();
            if self.state.merge_queue.enqueue(entry) {
                let position = self.state.merge_queue.len();
                self.state.log(
                    EventKind::Enqueued,
                    Some(&task_id),
                    Some(&worker_id),
                    format!("queued for merge at position {position}"),
                );
                self.persist()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn milestone(phase: Phase) -> Milestone {
        Milestone {
            phase,
            at: Utc::now(),
        }
    }

    fn record(phase: Phase, milestones: &[Phase]) -> ProgressRecord {
        let mut r = ProgressRecord::started("w", "t", "b", 0);
        r.phase = phase;
        r.status = WorkerStatus::for_phase(phase);
        r.milestones = milestones.iter().copied().map(milestone).collect();
        r
    }

    #[test]
    fn steps_follow_new_milestones() {
        let known = vec![milestone(Phase::Started), milestone(Phase::Implementing)];
        let r = record(
            Phase::ChangeRequestCreated,
            &[
                Phase::Started,
                Phase::Implementing,
                Phase::Reviewing,
                Phase::ChangeRequestCreated,
            ],
        );
        let phases: Vec<Phase> = new_steps(&known, &r).into_iter().map(|(p, _)| p).collect();
        assert_eq!(phases, vec![Phase::Reviewing, Phase::ChangeRequestCreated]);
    }

    #[test]
    fn unrelated_history_reduces_to_current_phase() {
        let known = vec![milestone(Phase::Started), milestone(Phase::Implementing)];
        let r = record(Phase::ReadyToMerge, &[]);
        let phases: Vec<Phase> = new_steps(&known, &r).into_iter().map(|(p, _)| p).collect();
        assert_eq!(phases, vec![Phase::ReadyToMerge]);
    }

    #[test]
    fn failed_status_implies_failed_phase() {
        let known = vec![milestone(Phase::Implementing)];
        let mut r = record(Phase::Implementing, &[Phase::Implementing]);
        r.status = WorkerStatus::Failed;
        let phases: Vec<Phase> = new_steps(&known, &r).into_iter().map(|(p, _)| p).collect();
        assert_eq!(phases, vec![Phase::Failed]);
    }

    #[test]
    fn unchanged_phase_has_no_steps() {
        let known = vec![milestone(Phase::Started), milestone(Phase::Implementing)];
        let r = record(Phase::Implementing, &[Phase::Started, Phase::Implementing]);
        assert!(new_steps(&known, &r).is_empty());
    }
}
