use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

use trunkline::config::{Mode, RetryConfig};
use trunkline::escalation::{Choice, Escalation, Origin};
use trunkline::failure::FailureCategory;
use trunkline::paths::SessionPaths;
use trunkline::phase::Phase;
use trunkline::progress::{Milestone, ProgressRecord, ProgressStore};
use trunkline::state::{CoordinatorState, StateStore};
use trunkline::task::Task;

fn trunkline(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("trunkline").unwrap();
    cmd.env_remove("TRUNKLINE_WORKER_ID")
        .env_remove("TRUNKLINE_PROGRESS")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT")
        .current_dir(root);
    cmd
}

fn init(root: &Path, extra: &[&str]) {
    trunkline(root)
        .args(["init", "--no-interactive", "--name", "demo", "--worker-command", "true"])
        .args(extra)
        .assert()
        .success();
}

/// A live session on disk with one merge conflict waiting for the operator.
fn seed_session(root: &Path) -> CoordinatorState {
    let retry = RetryConfig {
        worker_limit: 2,
        ci_limit: 2,
        infra_attempts: 3,
        infra_base_delay_ms: 0,
    };
    let mut state = CoordinatorState::new(
        "20260101-120000-abcd".to_string(),
        Mode::Parallel,
        2,
        retry,
        vec![Task::new("t1", "First"), Task::new("t2", "Second")],
    );
    state.escalations.push(Escalation {
        id: "e1".to_string(),
        category: FailureCategory::MergeConflict,
        origin: Origin::MergeDrain,
        task_id: "t1".to_string(),
        worker_id: Some("t1-w1".to_string()),
        phase: Some(Phase::ReadyToMerge),
        detail: "conflicts in src/lib.rs".to_string(),
        options: vec![Choice::Resolve, Choice::Skip, Choice::Abort],
        conflicting_files: vec!["src/lib.rs".to_string()],
        raised_at: chrono::Utc::now(),
    });
    StateStore::new(SessionPaths::new(root))
        .save(&mut state)
        .unwrap();
    state
}

#[test]
fn schema_prints_config_schema() {
    let dir = tempfile::tempdir().unwrap();
    trunkline(dir.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\": \"Config\""));
    trunkline(dir.path())
        .args(["schema", "state"])
        .assert()
        .success()
        .stdout(predicate::str::contains("CoordinatorState"));
}

#[test]
fn init_writes_config_and_backlog_once() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path(), &["--auto-resolve"]);
    let config = std::fs::read_to_string(dir.path().join(".trunkline.toml")).unwrap();
    assert!(config.contains("auto_resolve = true"));
    assert!(dir.path().join(".trunkline/tasks.toml").exists());

    trunkline(dir.path())
        .args(["init", "--no-interactive"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}

#[test]
fn status_without_session_fails() {
    let dir = tempfile::tempdir().unwrap();
    trunkline(dir.path())
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no session found"));
}

#[test]
fn start_requires_auto_resolve_decision() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path(), &[]);
    trunkline(dir.path())
        .args(["start", "--no-prompt"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("auto_resolve"));
    assert!(!dir.path().join(".trunkline/state.json").exists());
}

#[test]
fn sequential_mode_rejects_extra_workers() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path(), &["--no-auto-resolve"]);
    trunkline(dir.path())
        .args([
            "start",
            "--no-prompt",
            "--mode",
            "sequential",
            "--max-concurrency",
            "3",
        ])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("sequential"));
}

#[test]
fn report_updates_progress_and_rejects_jumps() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProgressStore::new(SessionPaths::new(dir.path()).progress_dir());
    let mut record = ProgressRecord::started("t1-w1", "t1", "task/t1-abcd-1", 0);
    record.phase = Phase::Implementing;
    record.milestones.push(Milestone {
        phase: Phase::Implementing,
        at: chrono::Utc::now(),
    });
    store.write(&record).unwrap();

    trunkline(dir.path())
        .args(["report", "--worker", "t1-w1", "--phase", "reviewing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("t1-w1 reviewing"));

    trunkline(dir.path())
        .args(["report", "--worker", "t1-w1", "--phase", "ready_to_merge"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("illegal phase transition"));

    let path = store.path("t1-w1");
    trunkline(dir.path())
        .args(["report", "--change-request", "PR-4", "--progress"])
        .arg(&path)
        .assert()
        .success();

    let record = store.read("t1-w1").unwrap().unwrap().record;
    assert_eq!(record.phase, Phase::Reviewing);
    assert_eq!(record.change_request_ref.as_deref(), Some("PR-4"));
    assert_eq!(record.milestones.len(), 3);
}

#[test]
fn report_cannot_claim_merged() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProgressStore::new(SessionPaths::new(dir.path()).progress_dir());
    let mut record = ProgressRecord::started("t1-w1", "t1", "task/t1-abcd-1", 0);
    record.phase = Phase::ReadyToMerge;
    store.write(&record).unwrap();

    trunkline(dir.path())
        .args(["report", "--worker", "t1-w1", "--phase", "merged"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("illegal phase transition"));
    assert_eq!(
        store.read("t1-w1").unwrap().unwrap().record.phase,
        Phase::ReadyToMerge
    );
}

#[test]
fn resolve_checks_offered_choices() {
    let dir = tempfile::tempdir().unwrap();
    seed_session(dir.path());

    trunkline(dir.path())
        .args(["resolve", "e1", "revert-last"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not an option"));
    trunkline(dir.path())
        .args(["resolve", "e9", "skip"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no pending escalation e9"));

    trunkline(dir.path())
        .args(["resolve", "e1", "skip", "--note", "rewrite later"])
        .assert()
        .success();
    let disposition = SessionPaths::new(dir.path()).disposition_file("e1");
    let written = std::fs::read_to_string(disposition).unwrap();
    assert!(written.contains("\"skip\""));
    assert!(written.contains("rewrite later"));
}

#[test]
fn status_json_shows_pending_escalations() {
    let dir = tempfile::tempdir().unwrap();
    let state = seed_session(dir.path());
    trunkline(dir.path())
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(state.session_id.as_str()))
        .stdout(predicate::str::contains("\"live\": true"))
        .stdout(predicate::str::contains("\"e1\""));
}

#[test]
fn abort_signals_the_running_session() {
    let dir = tempfile::tempdir().unwrap();
    trunkline(dir.path())
        .arg("abort")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no session found"));

    seed_session(dir.path());
    trunkline(dir.path())
        .arg("abort")
        .assert()
        .success()
        .stderr(predicate::str::contains("abort requested"));
    assert!(SessionPaths::new(dir.path()).abort_signal().exists());
}
