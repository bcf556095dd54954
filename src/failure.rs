//! Failure categories and the bounded retry helper for infrastructure calls.

use std::fmt;
use std::thread;
use std::time::Duration;

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::CoordinatorError;

/// What went wrong, as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    WorkerFailure,
    TestFailure,
    CiFailure,
    MergeConflict,
    VerificationFailure,
    InfrastructureFailure,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::WorkerFailure => "worker_failure",
            FailureCategory::TestFailure => "test_failure",
            FailureCategory::CiFailure => "ci_failure",
            FailureCategory::MergeConflict => "merge_conflict",
            FailureCategory::VerificationFailure => "verification_failure",
            FailureCategory::InfrastructureFailure => "infrastructure_failure",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            FailureCategory::WorkerFailure => "Worker failure",
            FailureCategory::TestFailure => "Test failure",
            FailureCategory::CiFailure => "CI failure",
            FailureCategory::MergeConflict => "Merge conflict",
            FailureCategory::VerificationFailure => "Post-merge verification failure",
            FailureCategory::InfrastructureFailure => "Infrastructure failure",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerReaction {
    /// Spawn a fresh worker on the next tick.
    Respawn,
    /// Hand the task to the operator. `can_retry` is false once the task has
    /// used every attempt it may ever get.
    Escalate { can_retry: bool },
}

/// Decide the follow-up for a task after its latest worker failed.
///
/// `failures` counts failed workers including this one, `spawned` counts every
/// worker the task has had. A task never gets more than `limit + 1` workers.
pub fn react_to_worker_failure(failures: u32, spawned: u32, limit: u32) -> WorkerReaction {
    if failures < limit {
        WorkerReaction::Respawn
    } else {
        WorkerReaction::Escalate {
            can_retry: spawned < attempt_cap(limit),
        }
    }
}

/// Most workers a single task can ever be given.
pub fn attempt_cap(limit: u32) -> u32 {
    limit.saturating_add(1)
}

/// Exponential backoff for filesystem, network and git calls.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    attempts: u32,
    base: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
        }
    }

    pub fn from_config(retry: &RetryConfig) -> Self {
        Self::new(retry.infra_attempts, retry.infra_base_delay())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base...
    /// plus up to 10% jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(factor);
        let jitter_ms = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Run `op` until it succeeds or the attempts run out.
    ///
    /// Exhaustion surfaces as an `InfrastructureFailure` carrying the last error.
    pub fn run<T>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> anyhow::Result<T>,
    ) -> Result<T, CoordinatorError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => {
                    tracing::warn!(operation, attempt, error = %format!("{e:#}"), "giving up");
                    return Err(CoordinatorError::infrastructure(
                        operation,
                        format!("{e:#} (after {attempt} attempts)"),
                    ));
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    tracing::info!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %format!("{e:#}"),
                        "retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
