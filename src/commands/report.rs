use std::path::{Path, PathBuf};

use clap::Args;

use crate::error::ExitError;
use crate::paths::SessionPaths;
use crate::phase::{Phase, WorkerStatus};
use crate::progress::{FailureKind, ProgressStore, ProgressUpdate};

/// Set by the coordinator in every worker's environment.
const WORKER_ENV: &str = "TRUNKLINE_WORKER_ID";
const PROGRESS_ENV: &str = "TRUNKLINE_PROGRESS";

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Worker id (defaults to $TRUNKLINE_WORKER_ID)
    #[arg(long)]
    pub worker: Option<String>,
    /// Progress record to update (defaults to $TRUNKLINE_PROGRESS, then the
    /// session's progress directory)
    #[arg(long)]
    pub progress: Option<PathBuf>,
    /// New phase, e.g. reviewing or ready_to_merge
    #[arg(long)]
    pub phase: Option<Phase>,
    #[arg(long)]
    pub status: Option<WorkerStatus>,
    /// Change request reference (pull request number, URL, ...)
    #[arg(long)]
    pub change_request: Option<String>,
    /// Failure description; usually together with `--phase failed`
    #[arg(long)]
    pub error: Option<String>,
    #[arg(long, value_enum)]
    pub error_kind: Option<FailureKind>,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl ReportArgs {
    /// The store and worker id this report is about.
    fn target(&self) -> anyhow::Result<(ProgressStore, String)> {
        let record = self
            .progress
            .clone()
            .or_else(|| std::env::var_os(PROGRESS_ENV).map(PathBuf::from));
        let worker = self
            .worker
            .clone()
            .or_else(|| std::env::var(WORKER_ENV).ok())
            .or_else(|| {
                record
                    .as_deref()
                    .and_then(Path::file_stem)
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                ExitError::Config(format!("no worker id: pass --worker or set {WORKER_ENV}"))
            })?;

        let dir = match record.as_deref().and_then(Path::parent) {
            Some(dir) => dir.to_path_buf(),
            None => {
                let root = super::project_root(self.project_root.as_deref())?;
                SessionPaths::new(&root).progress_dir()
            }
        };
        Ok((ProgressStore::new(dir), worker))
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        if self.phase.is_none()
            && self.status.is_none()
            && self.change_request.is_none()
            && self.error.is_none()
        {
            return Err(ExitError::Config("nothing to report".to_string()).into());
        }
        let (store, worker) = self.target()?;
        let update = ProgressUpdate {
            phase: self.phase,
            status: self.status,
            change_request_ref: self.change_request.clone(),
            error: self.error.clone(),
            error_kind: self.error_kind,
        };
        let record = store.apply(&worker, update)?;
        tracing::debug!(worker = %worker, phase = %record.phase, "progress reported");
        println!("{worker} {} ({})", record.phase, record.status);
        Ok(())
    }
}
