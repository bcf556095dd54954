//! Version control operations the coordinator needs, and their git implementation.
//!
//! The coordinator works in the project's main checkout, which stays on trunk.
//! Worker branches are never rewritten in place: integration happens on a
//! scratch branch, so a worker's worktree keeps the commits it made.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;

use crate::subprocess::{RunOutput, Tool};

/// Outcome of trying to put a branch on top of trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integration {
    /// Trunk now contains the branch; carries the new trunk head.
    Clean(String),
    /// Git stopped on conflicts in these files. Nothing was committed.
    Conflict(Vec<String>),
}

pub trait Vcs {
    /// Bring the local trunk up to date with the remote.
    fn sync_trunk(&mut self) -> anyhow::Result<()>;

    /// Create `branch` at the current trunk head.
    fn create_branch(&mut self, branch: &str) -> anyhow::Result<()>;

    /// Check `branch` out into a new worktree at `path`.
    fn add_worktree(&mut self, branch: &str, path: &Path) -> anyhow::Result<()>;

    fn remove_worktree(&mut self, path: &Path) -> anyhow::Result<()>;

    /// Replay `branch` onto trunk and fast-forward trunk to the result.
    ///
    /// `reconcile` asks for the more forgiving replay used when a first
    /// attempt conflicted.
    fn rebase_and_merge(&mut self, branch: &str, reconcile: bool)
    -> anyhow::Result<Integration>;

    /// Merge `branch` into trunk with a merge commit.
    fn merge_commit(&mut self, branch: &str) -> anyhow::Result<Integration>;

    /// Back out of a half-finished rebase or merge and return to trunk.
    fn abort_integration(&mut self) -> anyhow::Result<()>;

    fn push_trunk(&mut self) -> anyhow::Result<()>;

    fn delete_branch(&mut self, branch: &str) -> anyhow::Result<()>;

    /// Add one commit to trunk undoing everything between `base` and `head`,
    /// the trunk heads before and after a merge. Returns the new trunk head.
    fn revert(&mut self, base: &str, head: &str) -> anyhow::Result<String>;

    /// Move local trunk back to `commit`, dropping anything never pushed.
    fn reset_trunk(&mut self, commit: &str) -> anyhow::Result<()>;

    fn trunk_head(&mut self) -> anyhow::Result<String>;
}

/// Scratch branch used while integrating.
const INTEGRATION_BRANCH: &str = "trunkline/integrate";

fn re_conflict() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^CONFLICT \([^)]*\): .*?(?:Merge conflict in )(.+)$").unwrap())
}

/// Files named in git's `CONFLICT (...)` lines.
pub fn parse_conflicts(output: &str) -> Vec<String> {
    let mut files: Vec<String> = re_conflict()
        .captures_iter(output)
        .map(|c| c[1].trim().to_string())
        .collect();
    files.sort();
    files.dedup();
    files
}

fn short(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}

/// Git in the project's main checkout.
#[derive(Debug, Clone)]
pub struct GitVcs {
    root: PathBuf,
    trunk: String,
    remote: Option<String>,
    timeout: Duration,
}

impl GitVcs {
    pub fn new(root: &Path, trunk: &str, remote: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            trunk: trunk.to_string(),
            remote: (!remote.is_empty()).then(|| remote.to_string()),
            timeout: Duration::from_secs(300),
        }
    }

    fn git(&self, args: &[&str]) -> Tool {
        Tool::new("git")
            .args(args)
            .current_dir(&self.root)
            .timeout(self.timeout)
    }

    fn conflicted_files(&self, output: &RunOutput) -> anyhow::Result<Vec<String>> {
        let unmerged = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .run_ok()?;
        let mut files: Vec<String> = unmerged
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if files.is_empty() {
            files = parse_conflicts(&output.combined());
        }
        Ok(files)
    }

    fn checkout_trunk(&self) -> anyhow::Result<()> {
        self.git(&["checkout", "--quiet", &self.trunk]).run_ok()?;
        Ok(())
    }

    fn head(&self, rev: &str) -> anyhow::Result<String> {
        let out = self.git(&["rev-parse", rev]).run_ok()?;
        Ok(out.stdout.trim().to_string())
    }

    fn parents(&self, commit: &str) -> anyhow::Result<Vec<String>> {
        let out = self
            .git(&["rev-list", "--parents", "-n", "1", commit])
            .run_ok()?;
        Ok(out
            .stdout
            .split_whitespace()
            .skip(1)
            .map(str::to_string)
            .collect())
    }
}

impl Vcs for GitVcs {
    fn sync_trunk(&mut self) -> anyhow::Result<()> {
        self.checkout_trunk()?;
        if let Some(remote) = &self.remote {
            self.git(&["fetch", "--quiet", remote, &self.trunk])
                .run_ok()
                .context("fetching trunk")?;
            self.git(&["merge", "--ff-only", "--quiet", &format!("{remote}/{}", self.trunk)])
                .run_ok()
                .context("fast-forwarding local trunk")?;
        }
        Ok(())
    }

    fn create_branch(&mut self, branch: &str) -> anyhow::Result<()> {
        self.git(&["branch", branch, &self.trunk]).run_ok()?;
        Ok(())
    }

    fn add_worktree(&mut self, branch: &str, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let path = path.to_string_lossy();
        self.git(&["worktree", "add", "--quiet", &path, branch])
            .run_ok()?;
        Ok(())
    }

    fn remove_worktree(&mut self, path: &Path) -> anyhow::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let path = path.to_string_lossy();
        self.git(&["worktree", "remove", "--force", &path]).run_ok()?;
        Ok(())
    }

    fn rebase_and_merge(
        &mut self,
        branch: &str,
        reconcile: bool,
    ) -> anyhow::Result<Integration> {
        self.git(&["checkout", "--quiet", "-B", INTEGRATION_BRANCH, branch])
            .run_ok()?;

        let mut rebase = Tool::new("git").current_dir(&self.root).timeout(self.timeout);
        if reconcile {
            rebase = rebase.args(&["-c", "rerere.enabled=true", "-c", "rerere.autoupdate=true"]);
        }
        rebase = rebase.args(&["rebase", &self.trunk]);
        if reconcile {
            rebase = rebase.args(&["--strategy-option=patience", "--empty=drop"]);
        }
        let out = rebase.run()?;
        if !out.success() {
            let files = self.conflicted_files(&out)?;
            if files.is_empty() {
                anyhow::bail!("git rebase failed: {}", out.stderr.trim());
            }
            return Ok(Integration::Conflict(files));
        }

        self.checkout_trunk()?;
        self.git(&["merge", "--ff-only", "--quiet", INTEGRATION_BRANCH])
            .run_ok()
            .context("fast-forwarding trunk")?;
        let _ = self.git(&["branch", "-D", INTEGRATION_BRANCH]).run();
        Ok(Integration::Clean(self.head("HEAD")?))
    }

    fn merge_commit(&mut self, branch: &str) -> anyhow::Result<Integration> {
        self.checkout_trunk()?;
        let message = format!("Merge branch '{branch}'");
        let out = self
            .git(&["merge", "--no-ff", "--no-edit", "-m", &message, branch])
            .run()?;
        if !out.success() {
            let files = self.conflicted_files(&out)?;
            if files.is_empty() {
                anyhow::bail!("git merge failed: {}", out.stderr.trim());
            }
            return Ok(Integration::Conflict(files));
        }
        Ok(Integration::Clean(self.head("HEAD")?))
    }

    fn abort_integration(&mut self) -> anyhow::Result<()> {
        // Only one of these is ever in progress; the other fails harmlessly.
        let _ = self.git(&["rebase", "--abort"]).run();
        let _ = self.git(&["merge", "--abort"]).run();
        self.checkout_trunk()?;
        let _ = self.git(&["branch", "-D", INTEGRATION_BRANCH]).run();
        Ok(())
    }

    fn push_trunk(&mut self) -> anyhow::Result<()> {
        if let Some(remote) = &self.remote {
            self.git(&["push", "--quiet", remote, &self.trunk])
                .run_ok()
                .context("pushing trunk")?;
        }
        Ok(())
    }

    fn delete_branch(&mut self, branch: &str) -> anyhow::Result<()> {
        self.git(&["branch", "-D", branch]).run_ok()?;
        if let Some(remote) = &self.remote {
            // The worker may never have pushed it.
            let _ = self
                .git(&["push", "--quiet", remote, "--delete", branch])
                .run();
        }
        Ok(())
    }

    fn revert(&mut self, base: &str, head: &str) -> anyhow::Result<String> {
        self.checkout_trunk()?;
        let base = self.head(base)?;
        let head = self.head(head)?;
        if base == head {
            return Ok(head);
        }

        // A merge commit on top of the old trunk undoes as a whole.
        let parents = self.parents(&head)?;
        if parents.len() > 1 && parents[0] == base {
            self.git(&["revert", "--no-edit", "-m", "1", &head]).run_ok()?;
            return self.head("HEAD");
        }

        let range = format!("{base}..{head}");
        let out = self.git(&["revert", "--no-commit", &range]).run()?;
        if !out.success() {
            let _ = self.git(&["revert", "--abort"]).run();
            anyhow::bail!("git revert {range} failed: {}", out.stderr.trim());
        }
        let message = format!("Revert {}..{}", short(&base), short(&head));
        self.git(&["commit", "--quiet", "--allow-empty", "-m", &message])
            .run_ok()
            .context("committing revert")?;
        self.head("HEAD")
    }

    fn reset_trunk(&mut self, commit: &str) -> anyhow::Result<()> {
        self.checkout_trunk()?;
        self.git(&["reset", "--quiet", "--keep", commit])
            .run_ok()
            .with_context(|| format!("resetting {} to {commit}", self.trunk))?;
        Ok(())
    }

    fn trunk_head(&mut self) -> anyhow::Result<String> {
        self.head(&self.trunk)
    }
}
