use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{self, Config};
use crate::paths::{SESSION_DIR, atomic_write};

const SAMPLE_BACKLOG: &str = r#"# One [[task]] table per unit of work.
#
#   id          letters, digits, '.', '_' or '-'; used in branch names
#   priority    higher runs first (default 0)
#   size        rough estimate; smaller runs first on equal priority (default 1)
#   depends_on  ids that must be completed first

[[task]]
id = "example"
title = "Replace this with a real task"
priority = 0
size = 1
depends_on = []
"#;

/// Derive a project name from the directory name.
fn infer_project_name(dir: &std::path::Path) -> Option<String> {
    let name = dir.file_name()?.to_str()?;
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-').to_string();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Project name (defaults to the directory name)
    #[arg(long)]
    pub name: Option<String>,
    /// Worker command template
    #[arg(long)]
    pub worker_command: Option<String>,
    /// Trunk branch
    #[arg(long)]
    pub trunk: Option<String>,
    /// Set merge.auto_resolve = true
    #[arg(long, conflicts_with = "no_auto_resolve")]
    pub auto_resolve: bool,
    /// Set merge.auto_resolve = false
    #[arg(long)]
    pub no_auto_resolve: bool,
    /// Never prompt
    #[arg(long)]
    pub no_interactive: bool,
    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl InitArgs {
    fn build_config(&self, name: &str, interactive: bool) -> Result<Config> {
        let mut config = Config::new(name);
        if let Some(trunk) = &self.trunk {
            config.project.trunk.clone_from(trunk);
        }
        config.worker.command.clone_from(&self.worker_command);
        config.merge.auto_resolve = match (self.auto_resolve, self.no_auto_resolve) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ if interactive => Some(
                dialoguer::Confirm::new()
                    .with_prompt("Rebase a conflicting branch automatically once before pausing?")
                    .default(false)
                    .interact()
                    .context("reading auto_resolve answer")?,
            ),
            _ => None,
        };
        Ok(config)
    }

    pub fn execute(&self) -> Result<()> {
        let root = super::project_root(self.project_root.as_deref())?;
        let root = root.canonicalize().unwrap_or(root);
        let interactive = !self.no_interactive && std::io::stdin().is_terminal();

        let config_path = root.join(config::CONFIG_TOML);
        if config::find_config(&root).is_some() && !self.force {
            anyhow::bail!(
                "{} already has a trunkline config; use --force to overwrite",
                root.display()
            );
        }

        let name = match (&self.name, infer_project_name(&root)) {
            (Some(name), _) => name.clone(),
            (None, Some(inferred)) if interactive => dialoguer::Input::<String>::new()
                .with_prompt("Project name")
                .default(inferred)
                .interact_text()
                .context("reading project name")?,
            (None, Some(inferred)) => inferred,
            (None, None) => anyhow::bail!("could not infer a project name; pass --name"),
        };

        let config = self.build_config(&name, interactive)?;
        fs::write(&config_path, config.to_toml()?)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("Generated {}", config::CONFIG_TOML);

        let backlog = config.backlog_path(&root);
        if backlog.exists() {
            println!("Kept existing backlog {}", backlog.display());
        } else {
            atomic_write(&backlog, SAMPLE_BACKLOG.as_bytes())?;
            println!("Created sample backlog {}", backlog.display());
        }

        if config.worker.command.is_none() {
            tracing::warn!("worker.command is empty; set it before `trunkline start`");
        }
        if config.merge.auto_resolve.is_none() {
            tracing::warn!("merge.auto_resolve is unset; choose true or false before `trunkline start`");
        }
        println!("Session files go to {SESSION_DIR}/; consider adding it to .gitignore");
        Ok(())
    }
}
