use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::Args;

use crate::ci;
use crate::config::{self, Config, Mode};
use crate::coordinator::{Collaborators, Coordinator, Outcome, Overrides, Settings};
use crate::error::ExitError;
use crate::escalation::operator_for_terminal;
use crate::executor::CommandExecutor;
use crate::paths::SessionPaths;
use crate::task::FileBacklog;
use crate::vcs::GitVcs;
use crate::verify;

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Run one worker at a time, or several
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,
    /// Worker slots in parallel mode
    #[arg(long)]
    pub max_concurrency: Option<u32>,
    /// Seconds between polls
    #[arg(long)]
    pub poll_interval: Option<u64>,
    /// Give a conflicting merge one automatic rebase before pausing
    #[arg(long, conflicts_with = "no_auto_resolve")]
    pub auto_resolve: bool,
    /// Pause the merge queue on the first conflict
    #[arg(long)]
    pub no_auto_resolve: bool,
    /// Continue the unfinished session instead of starting a new one
    #[arg(long)]
    pub resume: bool,
    /// Never prompt; answer escalations with `trunkline resolve`
    #[arg(long)]
    pub no_prompt: bool,
}

impl StartArgs {
    fn overrides(&self) -> Overrides {
        let auto_resolve = match (self.auto_resolve, self.no_auto_resolve) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };
        Overrides {
            auto_resolve,
            poll_interval_secs: self.poll_interval,
        }
    }

    pub fn execute(&self) -> anyhow::Result<()> {
        let root = super::project_root(self.project_root.as_deref())?;
        let config = config::load_project_config(&root)?;
        let settings = Settings::from_config(&config, &root, &self.overrides())?;
        let parts = collaborators(&config, &root, !self.no_prompt)?;

        let mut coordinator = if self.resume {
            Coordinator::resume(settings, parts)?
        } else {
            let mode = self.mode.unwrap_or(config.coordinator.mode);
            let max = self.max_concurrency.or(config.coordinator.max_concurrency);
            Coordinator::start(settings, parts, mode, max)?
        };

        let flag = coordinator.abort_flag();
        ctrlc::set_handler(move || {
            eprintln!("abort requested; finishing the current step");
            flag.store(true, Ordering::SeqCst);
        })
        .context("installing Ctrl-C handler")?;

        let state = coordinator.state();
        eprintln!(
            "session {}: {} task(s), {} mode, up to {} worker(s)",
            state.session_id,
            state.tasks.len(),
            state.mode.as_str(),
            state.max_concurrency
        );

        let outcome = coordinator.run()?;
        let progress = coordinator.state().progress();
        eprintln!(
            "session {} {}: {} completed, {} failed, {} skipped",
            coordinator.state().session_id,
            if outcome == Outcome::Aborted { "aborted" } else { "finished" },
            progress.completed,
            progress.failed,
            progress.skipped,
        );

        match outcome {
            Outcome::Clean => Ok(()),
            Outcome::UnresolvedFailures(ref ids) => Err(ExitError::new(
                outcome.exit_code(),
                format!("unresolved failed task(s): {}", ids.join(", ")),
            )
            .into()),
            Outcome::Aborted => {
                Err(ExitError::new(outcome.exit_code(), "session aborted".to_string()).into())
            }
        }
    }
}

/// The production collaborators for a project.
pub(super) fn collaborators(
    config: &Config,
    root: &Path,
    allow_prompt: bool,
) -> anyhow::Result<Collaborators> {
    let command = config.worker.command.as_deref().ok_or_else(|| {
        ExitError::Config("worker.command is not set; nothing can be spawned".to_string())
    })?;
    let paths = SessionPaths::new(root);
    Ok(Collaborators {
        vcs: Box::new(GitVcs::new(
            root,
            &config.project.trunk,
            &config.project.remote,
        )),
        ci: ci::from_config(&config.ci),
        verifier: verify::from_config(&config.verify, root),
        executor: Box::new(CommandExecutor::new(command, &paths.logs_dir())),
        backlog: Box::new(FileBacklog::new(config.backlog_path(root))),
        operator: operator_for_terminal(paths, allow_prompt),
    })
}
