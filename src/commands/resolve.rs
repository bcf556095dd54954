use std::path::PathBuf;

use clap::Args;

use crate::error::{CoordinatorError, ExitError};
use crate::escalation::{Choice, Disposition};
use crate::paths::SessionPaths;
use crate::state::StateStore;

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Escalation id, as shown by `trunkline status`
    pub escalation: String,
    /// retry, skip, abort, resolve, revert-last, revert-all or manual
    pub choice: Choice,
    /// Free-text note kept with the decision
    #[arg(long)]
    pub note: Option<String>,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl ResolveArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let root = super::project_root(self.project_root.as_deref())?;
        let paths = SessionPaths::new(&root);
        let state = StateStore::new(paths.clone())
            .load()?
            .ok_or_else(|| CoordinatorError::NoSession(paths.state_file().display().to_string()))?;

        let escalation = state.escalation(&self.escalation).ok_or_else(|| {
            ExitError::Other(format!(
                "no pending escalation {} in session {}",
                self.escalation, state.session_id
            ))
        })?;
        if !escalation.offers(self.choice) {
            let offered: Vec<&str> = escalation.options.iter().map(|c| c.as_str()).collect();
            return Err(ExitError::Other(format!(
                "{} is not an option for {} (choose {})",
                self.choice,
                escalation.id,
                offered.join(", ")
            ))
            .into());
        }

        Disposition::new(&escalation.id, self.choice, self.note.clone()).deliver(&paths)?;
        eprintln!(
            "{} for {} recorded; the coordinator applies it at its next tick",
            self.choice, escalation.id
        );
        Ok(())
    }
}
