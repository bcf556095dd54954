//! In-memory collaborators for coordinator tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::ci::{CiProvider, CiQuery, CiStatus};
use crate::config::{AbortConfig, MergeStrategy, Mode, RetryConfig};
use crate::escalation::{Choice, Escalation, Operator, SessionProgress};
use crate::executor::{Executor, SpawnRequest, WorkerExit};
use crate::paths::SessionPaths;
use crate::phase::Phase;
use crate::progress::{FailureKind, ProgressStore, ProgressUpdate};
use crate::task::{self, Backlog, Task, TaskStatus};
use crate::vcs::{Integration, Vcs};
use crate::verify::{Verification, Verifier};

use super::{Collaborators, Coordinator, Settings};

/// Trunk modelled as the list of changes it currently contains.
///
/// Every trunk commit gets a fresh id `c<n>` and a snapshot of the contents
/// at that point, so reverts and resets can be checked against what trunk
/// actually holds afterwards.
#[derive(Debug, Default)]
pub struct Repo {
    /// Changes on trunk, oldest first. A branch with one commit contributes
    /// its own name; longer branches contribute `<branch>#<n>`.
    pub trunk: Vec<String>,
    head: u32,
    commits: u32,
    snapshots: BTreeMap<u32, Vec<String>>,
    /// Commits per task id for branches with more than one.
    pub branch_commits: BTreeMap<String, u32>,
    pub branches: BTreeSet<String>,
    pub worktrees: BTreeSet<PathBuf>,
    pub deleted: Vec<String>,
    /// (branch, trunk length it was replayed onto)
    pub replays: Vec<(String, usize)>,
    /// Remaining conflicting integrations per task id.
    pub conflicts: BTreeMap<String, u32>,
    pub conflict_files: Vec<String>,
    pub sync_failures: u32,
    pub push_failures: u32,
    pub pushes: u32,
    /// Trunk contents as of the last successful push.
    pub published: Vec<String>,
    /// Reverted ranges as `base..head`.
    pub reverted: Vec<String>,
    /// Commits local trunk was reset to.
    pub resets: Vec<String>,
    pub integrating: bool,
}

fn task_of(branch: &str) -> Option<&str> {
    let name = branch.split_once('/')?.1;
    Some(name.split_once('-').map_or(name, |(task, _)| task))
}

fn commit_id(commit: &str) -> anyhow::Result<u32> {
    commit
        .strip_prefix('c')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("unknown commit {commit}"))
}

impl Repo {
    pub fn head(&self) -> String {
        format!("c{}", self.head)
    }

    fn snapshot(&self, commit: &str) -> anyhow::Result<Vec<String>> {
        let id = commit_id(commit)?;
        if id == 0 {
            return Ok(Vec::new());
        }
        self.snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown commit {commit}"))
    }

    fn commit(&mut self) {
        self.commits += 1;
        self.head = self.commits;
        self.snapshots.insert(self.head, self.trunk.clone());
    }

    fn conflicts_for(&mut self, branch: &str) -> bool {
        let hit = self
            .conflicts
            .iter_mut()
            .find(|(task, left)| **left > 0 && branch.contains(&format!("/{task}-")));
        match hit {
            Some((_, left)) => {
                *left -= 1;
                true
            }
            None => false,
        }
    }

    fn changes(&self, branch: &str) -> Vec<String> {
        let count = task_of(branch)
            .and_then(|task| self.branch_commits.get(task))
            .copied()
            .unwrap_or(1);
        if count <= 1 {
            return vec![branch.to_string()];
        }
        (1..=count).map(|n| format!("{branch}#{n}")).collect()
    }

    /// Replays put one trunk commit per branch commit; merge commits put one.
    fn land(&mut self, branch: &str, one_commit: bool) -> anyhow::Result<Integration> {
        if !self.branches.contains(branch) {
            anyhow::bail!("no branch {branch}");
        }
        if self.conflicts_for(branch) {
            self.integrating = true;
            return Ok(Integration::Conflict(self.conflict_files.clone()));
        }
        self.replays.push((branch.to_string(), self.trunk.len()));
        for change in self.changes(branch) {
            self.trunk.push(change);
            if !one_commit {
                self.commit();
            }
        }
        if one_commit {
            self.commit();
        }
        Ok(Integration::Clean(self.head()))
    }

    /// Position on trunk of the first change from `task`.
    pub fn position_of(&self, task: &str) -> Option<usize> {
        self.trunk
            .iter()
            .position(|c| c.contains(&format!("/{task}-")))
    }

    /// How many changes from `task` trunk holds.
    pub fn count_of(&self, task: &str) -> usize {
        self.trunk
            .iter()
            .filter(|c| c.contains(&format!("/{task}-")))
            .count()
    }
}

pub struct FakeVcs(pub Rc<RefCell<Repo>>);

impl Vcs for FakeVcs {
    fn sync_trunk(&mut self) -> anyhow::Result<()> {
        let mut repo = self.0.borrow_mut();
        if repo.sync_failures > 0 {
            repo.sync_failures -= 1;
            anyhow::bail!("could not reach remote");
        }
        Ok(())
    }

    fn create_branch(&mut self, branch: &str) -> anyhow::Result<()> {
        if !self.0.borrow_mut().branches.insert(branch.to_string()) {
            anyhow::bail!("branch {branch} already exists");
        }
        Ok(())
    }

    fn add_worktree(&mut self, _branch: &str, path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(path)?;
        self.0.borrow_mut().worktrees.insert(path.to_path_buf());
        Ok(())
    }

    fn remove_worktree(&mut self, path: &Path) -> anyhow::Result<()> {
        self.0.borrow_mut().worktrees.remove(path);
        Ok(())
    }

    fn rebase_and_merge(&mut self, branch: &str, _reconcile: bool) -> anyhow::Result<Integration> {
        self.0.borrow_mut().land(branch, false)
    }

    fn merge_commit(&mut self, branch: &str) -> anyhow::Result<Integration> {
        self.0.borrow_mut().land(branch, true)
    }

    fn abort_integration(&mut self) -> anyhow::Result<()> {
        self.0.borrow_mut().integrating = false;
        Ok(())
    }

    fn push_trunk(&mut self) -> anyhow::Result<()> {
        let mut repo = self.0.borrow_mut();
        if repo.push_failures > 0 {
            repo.push_failures -= 1;
            anyhow::bail!("remote rejected push");
        }
        repo.pushes += 1;
        repo.published = repo.trunk.clone();
        Ok(())
    }

    fn delete_branch(&mut self, branch: &str) -> anyhow::Result<()> {
        let mut repo = self.0.borrow_mut();
        if !repo.branches.remove(branch) {
            anyhow::bail!("no branch {branch}");
        }
        repo.deleted.push(branch.to_string());
        Ok(())
    }

    fn revert(&mut self, base: &str, head: &str) -> anyhow::Result<String> {
        let mut repo = self.0.borrow_mut();
        let before = repo.snapshot(base)?;
        let after = repo.snapshot(head)?;
        let undone: Vec<String> = after.into_iter().filter(|c| !before.contains(c)).collect();
        repo.trunk.retain(|c| !undone.contains(c));
        repo.reverted.push(format!("{base}..{head}"));
        repo.commit();
        Ok(repo.head())
    }

    fn reset_trunk(&mut self, commit: &str) -> anyhow::Result<()> {
        let mut repo = self.0.borrow_mut();
        repo.trunk = repo.snapshot(commit)?;
        repo.head = commit_id(commit)?;
        repo.resets.push(commit.to_string());
        Ok(())
    }

    fn trunk_head(&mut self) -> anyhow::Result<String> {
        Ok(self.0.borrow().head())
    }
}

#[derive(Debug, Default)]
pub struct Processes {
    pub spawned: Vec<String>,
    pub exits: BTreeMap<String, WorkerExit>,
    pub terminated: Vec<String>,
}

pub struct FakeExecutor(pub Rc<RefCell<Processes>>);

impl Executor for FakeExecutor {
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> anyhow::Result<()> {
        self.0
            .borrow_mut()
            .spawned
            .push(request.worker_id.to_string());
        Ok(())
    }

    fn poll(&mut self, worker_id: &str) -> anyhow::Result<WorkerExit> {
        Ok(self
            .0
            .borrow()
            .exits
            .get(worker_id)
            .copied()
            .unwrap_or(WorkerExit::Running))
    }

    fn terminate(&mut self, worker_id: &str) -> anyhow::Result<()> {
        self.0.borrow_mut().terminated.push(worker_id.to_string());
        Ok(())
    }
}

pub struct FakeCi(pub Rc<RefCell<BTreeMap<String, CiStatus>>>);

impl CiProvider for FakeCi {
    fn status(&mut self, query: &CiQuery<'_>) -> anyhow::Result<CiStatus> {
        Ok(self
            .0
            .borrow()
            .get(query.change_request)
            .copied()
            .unwrap_or(CiStatus::None))
    }
}

/// Passes unless a result was queued.
pub struct FakeVerifier(pub Rc<RefCell<VecDeque<Verification>>>);

impl Verifier for FakeVerifier {
    fn verify(&mut self) -> anyhow::Result<Verification> {
        Ok(self
            .0
            .borrow_mut()
            .pop_front()
            .unwrap_or(Verification::Passed))
    }
}

pub struct MemoryBacklog(pub Rc<RefCell<Vec<Task>>>);

impl Backlog for MemoryBacklog {
    fn load(&mut self) -> anyhow::Result<Vec<Task>> {
        let mut tasks = self.0.borrow().clone();
        task::validate(&tasks)?;
        task::refresh_readiness(&mut tasks);
        Ok(tasks)
    }

    fn update_status(&mut self, task_id: &str, status: TaskStatus) -> anyhow::Result<()> {
        let mut tasks = self.0.borrow_mut();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| anyhow::anyhow!("no task {task_id}"))?;
        task.status = status;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Desk {
    pub answers: VecDeque<Choice>,
    pub seen: Vec<Escalation>,
}

/// Answers escalations from a queue; with nothing queued it stays undecided.
pub struct ScriptedOperator(pub Rc<RefCell<Desk>>);

impl Operator for ScriptedOperator {
    fn decide(
        &mut self,
        escalation: &Escalation,
        _progress: &SessionProgress,
    ) -> anyhow::Result<Option<Choice>> {
        let mut desk = self.0.borrow_mut();
        if !desk.seen.iter().any(|e| e.id == escalation.id) {
            desk.seen.push(escalation.clone());
        }
        Ok(desk.answers.pop_front())
    }
}

/// A temp project with shared handles on every fake.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub repo: Rc<RefCell<Repo>>,
    pub processes: Rc<RefCell<Processes>>,
    pub ci: Rc<RefCell<BTreeMap<String, CiStatus>>>,
    pub verdicts: Rc<RefCell<VecDeque<Verification>>>,
    pub backlog: Rc<RefCell<Vec<Task>>>,
    pub desk: Rc<RefCell<Desk>>,
}

impl Harness {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            repo: Rc::new(RefCell::new(Repo {
                conflict_files: vec!["src/lib.rs".to_string()],
                ..Repo::default()
            })),
            processes: Rc::default(),
            ci: Rc::default(),
            verdicts: Rc::default(),
            backlog: Rc::new(RefCell::new(tasks)),
            desk: Rc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> Settings {
        Settings {
            project_root: self.root().to_path_buf(),
            poll_interval: Duration::ZERO,
            progress_grace: Duration::from_secs(60),
            retry: RetryConfig {
                worker_limit: 2,
                ci_limit: 2,
                infra_attempts: 3,
                infra_base_delay_ms: 0,
            },
            strategy: MergeStrategy::Rebase,
            auto_resolve: false,
            push: true,
            delete_branches: true,
            branch_prefix: "task".to_string(),
            worktree_root: Some(self.root().join("worktrees")),
            abort: AbortConfig::default(),
        }
    }

    pub fn parts(&self) -> Collaborators {
        Collaborators {
            vcs: Box::new(FakeVcs(Rc::clone(&self.repo))),
            ci: Box::new(FakeCi(Rc::clone(&self.ci))),
            verifier: Box::new(FakeVerifier(Rc::clone(&self.verdicts))),
            executor: Box::new(FakeExecutor(Rc::clone(&self.processes))),
            backlog: Box::new(MemoryBacklog(Rc::clone(&self.backlog))),
            operator: Box::new(ScriptedOperator(Rc::clone(&self.desk))),
        }
    }

    pub fn start(&self, settings: Settings, mode: Mode, max: Option<u32>) -> Coordinator {
        Coordinator::start(settings, self.parts(), mode, max).unwrap()
    }

    pub fn paths(&self) -> SessionPaths {
        SessionPaths::new(self.root())
    }

    pub fn progress(&self) -> ProgressStore {
        ProgressStore::new(self.paths().progress_dir())
    }

    pub fn answer(&self, choice: Choice) {
        self.desk.borrow_mut().answers.push_back(choice);
    }

    pub fn seen(&self) -> Vec<Escalation> {
        self.desk.borrow().seen.clone()
    }

    /// Report a single phase change for `worker`, as the worker would.
    pub fn report(&self, worker: &str, phase: Phase) {
        self.progress()
            .apply(
                worker,
                ProgressUpdate {
                    phase: Some(phase),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    /// Walk `worker` forward one legal step at a time until it reaches `target`.
    pub fn advance(&self, worker: &str, target: Phase) {
        let store = self.progress();
        loop {
            let current = store.read(worker).unwrap().unwrap().record.phase;
            if current == target {
                return;
            }
            let next = current.successor().unwrap();
            self.report(worker, next);
        }
    }

    pub fn set_change_request(&self, worker: &str, change_request: &str) {
        self.progress()
            .apply(
                worker,
                ProgressUpdate {
                    change_request_ref: Some(change_request.to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    pub fn fail(&self, worker: &str, kind: FailureKind, error: &str) {
        self.progress()
            .apply(
                worker,
                ProgressUpdate {
                    phase: Some(Phase::Failed),
                    error: Some(error.to_string()),
                    error_kind: Some(kind),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    pub fn backlog_status(&self, task_id: &str) -> TaskStatus {
        self.backlog
            .borrow()
            .iter()
            .find(|t| t.id == task_id)
            .unwrap()
            .status
    }
}
