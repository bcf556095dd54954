//! Tasks, readiness, spawn ordering, and the backlog they come from.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::paths::atomic_write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Blocked,
    Ready,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// No further automatic work will happen for this task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work from the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: String,
    pub title: String,
    /// Higher numbers are spawned first.
    #[serde(default)]
    pub priority: u32,
    /// Size estimate; smaller tasks win priority ties.
    #[serde(default = "default_size")]
    pub size: u32,
    #[serde(default, alias = "dependsOn", alias = "dependencies")]
    pub depends_on: BTreeSet<String>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
}

fn default_size() -> u32 {
    1
}

fn default_status() -> TaskStatus {
    TaskStatus::Ready
}

impl Task {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            priority: 0,
            size: default_size(),
            depends_on: BTreeSet::new(),
            status: TaskStatus::Ready,
        }
    }
}

/// Promote `blocked` tasks whose dependencies are all completed, and demote
/// `ready` tasks that still wait on something. Returns the ids whose status
/// changed, in backlog order.
pub fn refresh_readiness(tasks: &mut [Task]) -> Vec<(String, TaskStatus)> {
    let completed: BTreeSet<String> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.clone())
        .collect();

    let mut changed = Vec::new();
    for task in tasks.iter_mut() {
        let unmet = task.depends_on.iter().any(|d| !completed.contains(d));
        let next = match task.status {
            TaskStatus::Blocked if !unmet => TaskStatus::Ready,
            TaskStatus::Ready if unmet => TaskStatus::Blocked,
            other => other,
        };
        if next != task.status {
            task.status = next;
            changed.push((task.id.clone(), next));
        }
    }
    changed
}

/// Spawn order over `candidates` (indices into the backlog): highest priority,
/// then smallest size estimate, then earliest backlog position.
pub fn spawn_order(tasks: &[Task], candidates: &[usize]) -> Vec<usize> {
    let mut order = candidates.to_vec();
    order.sort_by(|&a, &b| {
        let (ta, tb) = (&tasks[a], &tasks[b]);
        tb.priority
            .cmp(&ta.priority)
            .then(ta.size.cmp(&tb.size))
            .then(a.cmp(&b))
    });
    order
}

fn re_task_id() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap())
}

/// Task ids end up in branch names and file names.
pub fn is_valid_id(id: &str) -> bool {
    re_task_id().is_match(id) && !id.contains("..")
}

/// Check ids, that dependency ids exist, and that the dependency graph is acyclic.
pub fn validate(tasks: &[Task]) -> anyhow::Result<()> {
    if let Some(bad) = tasks.iter().find(|t| !is_valid_id(&t.id)) {
        anyhow::bail!(
            "invalid task id {:?}: use letters, digits, '.', '_' or '-' (max 64 chars)",
            bad.id
        );
    }
    let ids: BTreeSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    if ids.len() != tasks.len() {
        anyhow::bail!("backlog contains duplicate task ids");
    }
    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                anyhow::bail!("task {} depends on unknown task {dep}", task.id);
            }
        }
    }

    // Kahn's algorithm; anything left over sits on a cycle.
    let mut indegree: BTreeMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.len()))
        .collect();
    let mut queue: Vec<&str> = indegree
        .iter()
        .filter(|&(_, &n)| n == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut seen = 0usize;
    while let Some(id) = queue.pop() {
        seen += 1;
        for t in tasks.iter().filter(|t| t.depends_on.contains(id)) {
            if let Some(n) = indegree.get_mut(t.id.as_str()) {
                *n -= 1;
                if *n == 0 {
                    queue.push(t.id.as_str());
                }
            }
        }
    }
    if seen != tasks.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|&(_, &n)| n > 0)
            .map(|(&id, _)| id)
            .collect();
        anyhow::bail!("dependency cycle among tasks: {}", stuck.join(", "));
    }
    Ok(())
}

/// Source of the initial task list and sink for status updates.
pub trait Backlog {
    fn load(&mut self) -> anyhow::Result<Vec<Task>>;
    fn update_status(&mut self, task_id: &str, status: TaskStatus) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BacklogFile {
    #[serde(default, rename = "task")]
    tasks: Vec<Task>,
}

/// A TOML file of `[[task]]` tables, rewritten atomically on every update.
#[derive(Debug, Clone)]
pub struct FileBacklog {
    path: PathBuf,
}

impl FileBacklog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> anyhow::Result<BacklogFile> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading backlog {}", self.path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing backlog {}", self.path.display()))
    }

    fn write(&self, file: &BacklogFile) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(file).context("serializing backlog")?;
        atomic_write(&self.path, contents.as_bytes())
    }
}

impl Backlog for FileBacklog {
    fn load(&mut self) -> anyhow::Result<Vec<Task>> {
        let mut tasks = self.read()?.tasks;
        validate(&tasks)?;
        refresh_readiness(&mut tasks);
        Ok(tasks)
    }

    fn update_status(&mut self, task_id: &str, status: TaskStatus) -> anyhow::Result<()> {
        let mut file = self.read()?;
        let task = file
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .with_context(|| format!("task {task_id} not in backlog"))?;
        task.status = status;
        self.write(&file)
    }
}
