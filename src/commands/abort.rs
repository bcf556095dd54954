use std::path::PathBuf;

use clap::Args;

use crate::config;
use crate::coordinator::{Coordinator, Overrides, Settings};
use crate::error::CoordinatorError;
use crate::paths::{SessionPaths, atomic_write};
use crate::state::StateStore;

#[derive(Debug, Args)]
pub struct AbortArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Abort in this process instead of signalling a running coordinator.
    /// Use when the coordinator is no longer running.
    #[arg(long)]
    pub now: bool,
}

impl AbortArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let root = super::project_root(self.project_root.as_deref())?;
        let paths = SessionPaths::new(&root);
        let live = StateStore::new(paths.clone())
            .load()?
            .filter(|s| !s.lifecycle.is_terminal())
            .ok_or_else(|| CoordinatorError::NoSession(paths.state_file().display().to_string()))?;

        if self.now {
            let config = config::load_project_config(&root)?;
            // The session already chose its merge settings; only the abort
            // section matters here.
            let overrides = Overrides {
                auto_resolve: Some(config.merge.auto_resolve.unwrap_or(false)),
                poll_interval_secs: None,
            };
            let settings = Settings::from_config(&config, &root, &overrides)?;
            let parts = super::start::collaborators(&config, &root, false)?;
            let mut coordinator = Coordinator::resume(settings, parts)?;
            coordinator.abort("aborted from the command line")?;
            eprintln!("session {} aborted", live.session_id);
            return Ok(());
        }

        let stamp = chrono::Utc::now().to_rfc3339();
        atomic_write(&paths.abort_signal(), stamp.as_bytes())?;
        eprintln!(
            "abort requested for session {}; the coordinator stops at its next tick",
            live.session_id
        );
        Ok(())
    }
}
