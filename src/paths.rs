//! On-disk layout of a trunkline session and the atomic write primitive
//! every durable record goes through.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Directory (relative to the project root) holding all session artifacts.
pub const SESSION_DIR: &str = ".trunkline";

/// Resolved locations of every session artifact for one project.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    root: PathBuf,
}

impl SessionPaths {
    pub fn new(project_root: &Path) -> Self {
        Self {
            root: project_root.join(SESSION_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.root.join("progress")
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.root.join("signals")
    }

    pub fn abort_signal(&self) -> PathBuf {
        self.signals_dir().join("abort")
    }

    pub fn disposition_file(&self, escalation_id: &str) -> PathBuf {
        self.signals_dir()
            .join(format!("disposition-{escalation_id}.json"))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn worker_log(&self, worker_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{worker_id}.log"))
    }
}

/// Write `contents` to `path` so readers only ever see the old or the new file.
///
/// Writes a sibling temp file, fsyncs it, then renames over the target.
pub fn atomic_write(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let tmp = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));

    {
        let mut file =
            fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(contents)
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", tmp.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Per-project cache directory for worktrees that should live outside the repo.
///
/// `<cache>/trunkline/worktrees/<slug>` where slug is the canonical project path
/// with separators replaced.
pub fn worktree_root(project_root: &Path) -> PathBuf {
    let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);

    let canonical = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let slug = canonical
        .to_string_lossy()
        .replace(['/', '\\'], "-")
        .trim_start_matches('-')
        .to_string();

    base.join("trunkline").join("worktrees").join(slug)
}
