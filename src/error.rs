use std::process::ExitCode;

/// Errors that cause trunkline to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("{message}")]
    WithCode { code: u8, message: String },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn new(code: u8, message: String) -> Self {
        ExitError::WithCode { code, message }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(6),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::WithCode { code, .. } => ExitCode::from(*code),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

/// Session outcome codes reported by `trunkline start`.
pub mod session_exit {
    /// Every task merged or was intentionally skipped.
    pub const CLEAN: u8 = 0;
    /// The session finished but at least one task ended `failed`.
    pub const UNRESOLVED_FAILURES: u8 = 1;
    /// The session was aborted.
    pub const ABORTED: u8 = 2;
}

/// Coordinator failure taxonomy.
///
/// Transient categories are retried inside their configured limits; the rest
/// are handed to the operator as an escalation.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("worker {worker_id} failed on task {task_id}: {detail}")]
    WorkerFailure {
        task_id: String,
        worker_id: String,
        detail: String,
    },

    #[error("tests failed for task {task_id} (worker {worker_id}): {detail}")]
    TestFailure {
        task_id: String,
        worker_id: String,
        detail: String,
    },

    #[error("CI failed for task {task_id}: {detail}")]
    CiFailure { task_id: String, detail: String },

    #[error("merge conflict for task {task_id} in {} file(s)", files.len())]
    MergeConflict { task_id: String, files: Vec<String> },

    #[error("post-merge verification failed after task {task_id}: {detail}")]
    VerificationFailure { task_id: String, detail: String },

    #[error("infrastructure failure during {operation}: {detail}")]
    InfrastructureFailure { operation: String, detail: String },

    #[error("worker {worker_id} jumped from {from} to {to}")]
    AnomalousTransition {
        worker_id: String,
        from: String,
        to: String,
    },

    #[error("a session is already in progress (started {started_at}); use --resume or `trunkline abort`")]
    SessionExists { started_at: String },

    #[error("no session found at {0}")]
    NoSession(String),
}

impl CoordinatorError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    pub fn infrastructure(operation: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::InfrastructureFailure {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }
}

impl From<CoordinatorError> for ExitError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::InvalidConfiguration(msg) => ExitError::Config(msg),
            other => ExitError::Other(other.to_string()),
        }
    }
}
