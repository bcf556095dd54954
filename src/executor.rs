//! Starting and supervising worker processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Child;

use anyhow::Context;

use crate::subprocess::Tool;
use crate::template::{CommandTemplate, WorkerContext};

/// Everything a worker needs to know about its assignment.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub task_id: &'a str,
    pub task_title: &'a str,
    pub worker_id: &'a str,
    pub branch: &'a str,
    pub workdir: &'a Path,
    pub progress_path: &'a Path,
    pub attempt: u32,
}

/// What the executor knows about a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Running,
    Exited { success: bool, code: Option<i32> },
    /// Not started by this executor (e.g. before a coordinator restart).
    Unknown,
}

pub trait Executor {
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> anyhow::Result<()>;
    fn poll(&mut self, worker_id: &str) -> anyhow::Result<WorkerExit>;
    fn terminate(&mut self, worker_id: &str) -> anyhow::Result<()>;
}

/// Runs `worker.command` through `sh -c` with output sent to a per-worker log.
pub struct CommandExecutor {
    template: CommandTemplate,
    logs_dir: PathBuf,
    children: HashMap<String, Child>,
}

impl CommandExecutor {
    pub fn new(command: &str, logs_dir: &Path) -> Self {
        Self {
            template: CommandTemplate::new("worker.command", command),
            logs_dir: logs_dir.to_path_buf(),
            children: HashMap::new(),
        }
    }
}

impl Executor for CommandExecutor {
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> anyhow::Result<()> {
        let workdir = request.workdir.to_string_lossy();
        let progress_path = request.progress_path.to_string_lossy();
        let command = self.template.render(&WorkerContext {
            task_id: request.task_id,
            task_title: request.task_title,
            worker_id: request.worker_id,
            branch: request.branch,
            workdir: &workdir,
            progress_path: &progress_path,
            attempt: request.attempt,
        })?;

        let log = self.logs_dir.join(format!("{}.log", request.worker_id));
        let child = Tool::shell(&command)
            .current_dir(request.workdir)
            .env("TRUNKLINE_TASK_ID", request.task_id)
            .env("TRUNKLINE_WORKER_ID", request.worker_id)
            .env("TRUNKLINE_BRANCH", request.branch)
            .env("TRUNKLINE_PROGRESS", &progress_path)
            .spawn_logged(&log)
            .with_context(|| format!("starting worker {}", request.worker_id))?;
        tracing::debug!(worker = request.worker_id, pid = child.id(), %command, "worker process started");
        self.children.insert(request.worker_id.to_string(), child);
        Ok(())
    }

    /// An exit is reported once; the reaped child is forgotten after that.
    fn poll(&mut self, worker_id: &str) -> anyhow::Result<WorkerExit> {
        let Some(child) = self.children.get_mut(worker_id) else {
            return Ok(WorkerExit::Unknown);
        };
        let status = child
            .try_wait()
            .with_context(|| format!("checking worker {worker_id}"))?;
        let Some(status) = status else {
            return Ok(WorkerExit::Running);
        };
        self.children.remove(worker_id);
        Ok(WorkerExit::Exited {
            success: status.success(),
            code: status.code(),
        })
    }

    fn terminate(&mut self, worker_id: &str) -> anyhow::Result<()> {
        if let Some(mut child) = self.children.remove(worker_id) {
            if child.try_wait()?.is_none() {
                child
                    .kill()
                    .with_context(|| format!("terminating worker {worker_id}"))?;
            }
            let _ = child.wait();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for_exit(exec: &mut CommandExecutor, worker: &str) -> WorkerExit {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let state = exec.poll(worker).unwrap();
            if state != WorkerExit::Running || Instant::now() > deadline {
                return state;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn spawns_rendered_command_with_log() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let mut exec = CommandExecutor::new(
            "echo working on {{ task_id }} as $TRUNKLINE_WORKER_ID; exit 3",
            &logs,
        );
        let progress = dir.path().join("p.json");
        exec.spawn(&SpawnRequest {
            task_id: "t-1",
            task_title: "Title",
            worker_id: "t-1-w1",
            branch: "task/t-1-1",
            workdir: dir.path(),
            progress_path: &progress,
            attempt: 1,
        })
        .unwrap();

        assert_eq!(
            wait_for_exit(&mut exec, "t-1-w1"),
            WorkerExit::Exited {
                success: false,
                code: Some(3)
            }
        );
        let log = std::fs::read_to_string(logs.join("t-1-w1.log")).unwrap();
        assert_eq!(log.trim(), "working on t-1 as t-1-w1");

        // The exit was handed out; the child is no longer tracked.
        assert!(exec.children.is_empty());
        assert_eq!(exec.poll("t-1-w1").unwrap(), WorkerExit::Unknown);
    }

    #[test]
    fn unknown_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = CommandExecutor::new("true", dir.path());
        assert_eq!(exec.poll("nope").unwrap(), WorkerExit::Unknown);
        exec.terminate("nope").unwrap();
    }

    #[test]
    fn terminate_kills_running_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = CommandExecutor::new("sleep 30", &dir.path().join("logs"));
        let progress = dir.path().join("p.json");
        exec.spawn(&SpawnRequest {
            task_id: "t-1",
            task_title: "Title",
            worker_id: "t-1-w1",
            branch: "b",
            workdir: dir.path(),
            progress_path: &progress,
            attempt: 1,
        })
        .unwrap();
        assert_eq!(exec.poll("t-1-w1").unwrap(), WorkerExit::Running);
        exec.terminate("t-1-w1").unwrap();
        assert_eq!(exec.poll("t-1-w1").unwrap(), WorkerExit::Unknown);
    }
}
