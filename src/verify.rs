//! Post-merge verification of trunk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::VerifyConfig;
use crate::subprocess::Tool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Passed,
    Failed(String),
    /// Nothing is configured to run.
    Skipped,
}

pub trait Verifier {
    fn verify(&mut self) -> anyhow::Result<Verification>;
}

#[derive(Debug, Default)]
pub struct NoVerify;

impl Verifier for NoVerify {
    fn verify(&mut self) -> anyhow::Result<Verification> {
        Ok(Verification::Skipped)
    }
}

/// Runs a build/test command in the trunk checkout.
#[derive(Debug)]
pub struct CommandVerifier {
    command: String,
    root: PathBuf,
    timeout: Option<Duration>,
}

impl CommandVerifier {
    pub fn new(command: &str, root: &Path, timeout: Option<Duration>) -> Self {
        Self {
            command: command.to_string(),
            root: root.to_path_buf(),
            timeout,
        }
    }
}

/// Last `n` lines of `text`.
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

impl Verifier for CommandVerifier {
    fn verify(&mut self) -> anyhow::Result<Verification> {
        let mut tool = Tool::shell(&self.command).current_dir(&self.root);
        if let Some(timeout) = self.timeout {
            tool = tool.timeout(timeout);
        }
        let out = tool.run()?;
        if out.success() {
            Ok(Verification::Passed)
        } else {
            Ok(Verification::Failed(format!(
                "`{}` exited with {}:\n{}",
                self.command,
                out.exit_code,
                tail(&out.combined(), 20)
            )))
        }
    }
}

pub fn from_config(config: &VerifyConfig, root: &Path) -> Box<dyn Verifier> {
    match &config.command {
        Some(command) => Box::new(CommandVerifier::new(
            command,
            root,
            config.timeout_secs.map(Duration::from_secs),
        )),
        None => Box::new(NoVerify),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_and_failing_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut ok = CommandVerifier::new("true", dir.path(), None);
        assert_eq!(ok.verify().unwrap(), Verification::Passed);

        let mut bad = CommandVerifier::new(
            "echo compiling; echo 'test x failed' >&2; exit 3",
            dir.path(),
            Some(Duration::from_secs(10)),
        );
        let Verification::Failed(detail) = bad.verify().unwrap() else {
            panic!("expected failure");
        };
        assert!(detail.contains("exited with 3"));
        assert!(detail.contains("test x failed"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}
