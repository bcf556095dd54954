pub mod abort;
pub mod doctor;
pub mod init;
pub mod report;
pub mod resolve;
pub mod schema;
pub mod start;
pub mod status;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Pretty on a terminal, plain text when piped.
    pub fn resolve(requested: Option<Self>) -> Self {
        requested.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

/// `--project-root`, or the current directory.
pub fn project_root(requested: Option<&Path>) -> anyhow::Result<PathBuf> {
    match requested {
        Some(p) => Ok(p.to_path_buf()),
        None => std::env::current_dir().context("could not determine current directory"),
    }
}
