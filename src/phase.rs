//! Worker lifecycle phases and the transition table that governs them.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where a worker is in its implementation pipeline.
///
/// `Failed` is not a pipeline step; it is reachable from every phase and is
/// carried here so a worker can report it through the same field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    Implementing,
    Reviewing,
    ChangeRequestCreated,
    AwaitingVerification,
    ReadyToMerge,
    Merged,
    Failed,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Started,
        Phase::Implementing,
        Phase::Reviewing,
        Phase::ChangeRequestCreated,
        Phase::AwaitingVerification,
        Phase::ReadyToMerge,
        Phase::Merged,
        Phase::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Started => "started",
            Phase::Implementing => "implementing",
            Phase::Reviewing => "reviewing",
            Phase::ChangeRequestCreated => "change_request_created",
            Phase::AwaitingVerification => "awaiting_verification",
            Phase::ReadyToMerge => "ready_to_merge",
            Phase::Merged => "merged",
            Phase::Failed => "failed",
        }
    }

    /// The next step of the forward pipeline, if any.
    pub fn successor(self) -> Option<Phase> {
        match self {
            Phase::Started => Some(Phase::Implementing),
            Phase::Implementing => Some(Phase::Reviewing),
            Phase::Reviewing => Some(Phase::ChangeRequestCreated),
            Phase::ChangeRequestCreated => Some(Phase::AwaitingVerification),
            Phase::AwaitingVerification => Some(Phase::ReadyToMerge),
            Phase::ReadyToMerge => Some(Phase::Merged),
            Phase::Merged | Phase::Failed => None,
        }
    }

    /// Whether `self -> next` is in the transition table.
    ///
    /// Forward edges are single steps. The two rework edges send a worker back
    /// to `implementing` after a rejected review or a failed CI run. Any
    /// non-terminal phase may drop to `failed`.
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Phase::Failed {
            return true;
        }
        if self.successor() == Some(next) {
            return true;
        }
        matches!(
            (self, next),
            (Phase::Reviewing, Phase::Implementing)
                | (Phase::AwaitingVerification, Phase::Implementing)
        )
    }

    /// Whether a worker may move itself from `self` to `next`.
    ///
    /// `merged` is only ever recorded by the coordinator once the branch is on
    /// trunk, so workers stop at `ready_to_merge`.
    pub fn worker_may_report(self, next: Phase) -> bool {
        next != Phase::Merged && self.can_transition_to(next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Merged | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase {s:?}"))
    }
}

/// Coarse worker status as reported in the progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    InProgress,
    ReadyToMerge,
    Completed,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::InProgress => "in_progress",
            WorkerStatus::ReadyToMerge => "ready_to_merge",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
        }
    }

    /// The status implied by a phase when the worker does not state one.
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::ReadyToMerge => WorkerStatus::ReadyToMerge,
            Phase::Merged => WorkerStatus::Completed,
            Phase::Failed => WorkerStatus::Failed,
            _ => WorkerStatus::InProgress,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(WorkerStatus::InProgress),
            "ready_to_merge" => Ok(WorkerStatus::ReadyToMerge),
            "completed" => Ok(WorkerStatus::Completed),
            "failed" => Ok(WorkerStatus::Failed),
            other => Err(format!("unknown worker status {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_pipeline_is_accepted() {
        let mut phase = Phase::Started;
        while let Some(next) = phase.successor() {
            assert!(phase.can_transition_to(next), "{phase} -> {next}");
            phase = next;
        }
        assert_eq!(phase, Phase::Merged);
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        assert!(!Phase::Started.can_transition_to(Phase::Reviewing));
        assert!(!Phase::Implementing.can_transition_to(Phase::ReadyToMerge));
        assert!(!Phase::Started.can_transition_to(Phase::Merged));
    }

    #[test]
    fn backwards_jumps_outside_rework_edges_are_rejected() {
        assert!(!Phase::ReadyToMerge.can_transition_to(Phase::Implementing));
        assert!(!Phase::ChangeRequestCreated.can_transition_to(Phase::Reviewing));
        assert!(!Phase::Implementing.can_transition_to(Phase::Started));
    }

    #[test]
    fn rework_edges_are_accepted() {
        assert!(Phase::AwaitingVerification.can_transition_to(Phase::Implementing));
        assert!(Phase::Reviewing.can_transition_to(Phase::Implementing));
    }

    #[test]
    fn any_live_phase_may_fail() {
        for phase in Phase::ALL.into_iter().filter(|p| !p.is_terminal()) {
            assert!(phase.can_transition_to(Phase::Failed), "{phase} -> failed");
        }
    }

    #[test]
    fn only_the_coordinator_records_merged() {
        assert!(Phase::ReadyToMerge.can_transition_to(Phase::Merged));
        assert!(!Phase::ReadyToMerge.worker_may_report(Phase::Merged));
        assert!(Phase::AwaitingVerification.worker_may_report(Phase::ReadyToMerge));
        assert!(Phase::ReadyToMerge.worker_may_report(Phase::Failed));
    }

    #[test]
    fn terminal_phases_are_final() {
        for next in Phase::ALL {
            assert!(!Phase::Merged.can_transition_to(next));
            assert!(!Phase::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn phase_string_roundtrip_matches_serde() {
        for phase in Phase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase.as_str()));
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("done".parse::<Phase>().is_err());
    }

    #[test]
    fn status_for_phase() {
        assert_eq!(WorkerStatus::for_phase(Phase::Reviewing), WorkerStatus::InProgress);
        assert_eq!(WorkerStatus::for_phase(Phase::ReadyToMerge), WorkerStatus::ReadyToMerge);
        assert_eq!(WorkerStatus::for_phase(Phase::Failed), WorkerStatus::Failed);
    }
}
