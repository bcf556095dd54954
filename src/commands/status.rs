use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use super::OutputFormat;
use crate::error::CoordinatorError;
use crate::escalation::{Escalation, SessionProgress};
use crate::paths::SessionPaths;
use crate::phase::Phase;
use crate::state::{BranchFate, CoordinatorState, SessionEvent, StateStore};
use crate::task::TaskStatus;

const RECENT_EVENTS: usize = 8;

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub session_id: String,
    /// False when showing the most recent archived session.
    pub live: bool,
    pub lifecycle: String,
    pub mode: String,
    pub max_concurrency: u32,
    pub revision: u64,
    pub progress: SessionProgress,
    pub tasks: Vec<TaskLine>,
    pub merge_queue: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_paused_by: Option<String>,
    pub escalations: Vec<Escalation>,
    pub branches: BranchCounts,
    pub recent: Vec<SessionEvent>,
}

#[derive(Debug, Serialize)]
pub struct TaskLine {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
}

#[derive(Debug, Default, Serialize)]
pub struct BranchCounts {
    pub active: usize,
    pub merged: usize,
    pub abandoned: usize,
    pub removed: usize,
}

impl StatusReport {
    pub fn from_state(state: &CoordinatorState, live: bool) -> Self {
        let tasks = state
            .tasks
            .iter()
            .map(|t| {
                let worker = state.active_worker_for(&t.id);
                TaskLine {
                    id: t.id.clone(),
                    title: t.title.clone(),
                    status: t.status,
                    worker: worker.map(|w| w.worker_id.clone()),
                    phase: worker.map(|w| w.phase),
                }
            })
            .collect();

        let mut branches = BranchCounts::default();
        for record in state.branches.values() {
            match record.fate {
                BranchFate::Active => branches.active += 1,
                BranchFate::Merged => branches.merged += 1,
                BranchFate::Abandoned => branches.abandoned += 1,
                BranchFate::Removed => branches.removed += 1,
            }
        }

        let skip = state.session_log.len().saturating_sub(RECENT_EVENTS);
        Self {
            session_id: state.session_id.clone(),
            live,
            lifecycle: state.lifecycle.to_string(),
            mode: state.mode.as_str().to_string(),
            max_concurrency: state.max_concurrency,
            revision: state.revision,
            progress: state.progress(),
            tasks,
            merge_queue: state.merge_queue.iter().map(|e| e.task_id.clone()).collect(),
            queue_paused_by: state.queue_paused_by.clone(),
            escalations: state.escalations.clone(),
            branches,
            recent: state.session_log[skip..].to_vec(),
        }
    }

    fn markdown(&self) -> String {
        let mut md = format!(
            "# Session `{}`{}\n\n**{}** · {} mode · {} worker slot(s) · {}/{} tasks completed\n\n",
            self.session_id,
            if self.live { "" } else { " (archived)" },
            self.lifecycle,
            self.mode,
            self.max_concurrency,
            self.progress.completed,
            self.progress.total,
        );

        md.push_str("|task|status|worker|phase|\n|-|-|-|-|\n");
        for t in &self.tasks {
            md.push_str(&format!(
                "|{}|{}|{}|{}|\n",
                t.id,
                t.status,
                t.worker.as_deref().unwrap_or("-"),
                t.phase.map_or("-", Phase::as_str)
            ));
        }

        if !self.merge_queue.is_empty() {
            md.push_str(&format!("\n**Merge queue:** {}", self.merge_queue.join(" → ")));
            if let Some(id) = &self.queue_paused_by {
                md.push_str(&format!(" *(paused by {id})*"));
            }
            md.push('\n');
        }

        if !self.escalations.is_empty() {
            md.push_str("\n## Waiting on the operator\n\n");
            for e in &self.escalations {
                let options: Vec<&str> = e.options.iter().map(|c| c.as_str()).collect();
                md.push_str(&format!(
                    "* `{}` {} on {}: {} (`trunkline resolve {} <{}>`)\n",
                    e.id,
                    e.category.title(),
                    e.task_id,
                    e.detail,
                    e.id,
                    options.join("|")
                ));
            }
        }

        md.push_str(&format!(
            "\n**Branches:** {} active, {} merged, {} abandoned, {} removed\n",
            self.branches.active, self.branches.merged, self.branches.abandoned, self.branches.removed
        ));

        if !self.recent.is_empty() {
            md.push_str("\n## Recent\n\n");
            for event in &self.recent {
                md.push_str(&format!(
                    "* {} {}\n",
                    event.at.format("%H:%M:%S"),
                    event.message
                ));
            }
        }
        md
    }

    fn print_text(&self) {
        println!(
            "session  id={}  live={}  lifecycle={}  mode={}  max_concurrency={}  revision={}",
            self.session_id, self.live, self.lifecycle, self.mode, self.max_concurrency, self.revision
        );
        for t in &self.tasks {
            print!("task  id={}  status={}", t.id, t.status);
            if let Some(worker) = &t.worker {
                print!("  worker={worker}");
            }
            if let Some(phase) = t.phase {
                print!("  phase={phase}");
            }
            println!();
        }
        for (i, task) in self.merge_queue.iter().enumerate() {
            println!("queue  position={}  task={task}", i + 1);
        }
        for e in &self.escalations {
            let options: Vec<&str> = e.options.iter().map(|c| c.as_str()).collect();
            println!(
                "escalation  id={}  category={}  task={}  options={}",
                e.id,
                e.category,
                e.task_id,
                options.join(",")
            );
        }
        println!(
            "branches  active={}  merged={}  abandoned={}  removed={}",
            self.branches.active, self.branches.merged, self.branches.abandoned, self.branches.removed
        );
    }
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let root = super::project_root(self.project_root.as_deref())?;
        let paths = SessionPaths::new(&root);
        let store = StateStore::new(paths.clone());

        let report = if let Some(state) = store.load()? {
            StatusReport::from_state(&state, true)
        } else if let Some(state) = store.latest_archived()? {
            StatusReport::from_state(&state, false)
        } else {
            return Err(CoordinatorError::NoSession(paths.state_file().display().to_string()).into());
        };

        match OutputFormat::resolve(self.format) {
            OutputFormat::Pretty => {
                let skin = termimad::MadSkin::default();
                print!("{}", skin.term_text(&report.markdown()));
            }
            OutputFormat::Text => report.print_text(),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, RetryConfig};
    use crate::state::{BranchRecord, EventKind};
    use crate::task::Task;

    fn state() -> CoordinatorState {
        let retry = RetryConfig {
            worker_limit: 2,
            ci_limit: 2,
            infra_attempts: 3,
            infra_base_delay_ms: 0,
        };
        let mut state = CoordinatorState::new(
            "20260101-000000-beef".to_string(),
            Mode::Parallel,
            2,
            retry,
            vec![Task::new("t1", "First"), Task::new("t2", "Second")],
        );
        state.branches.insert(
            "task/t1-beef-1".to_string(),
            BranchRecord {
                branch: "task/t1-beef-1".to_string(),
                task_id: "t1".to_string(),
                worker_id: "t1-w1".to_string(),
                workdir: None,
                fate: BranchFate::Abandoned,
            },
        );
        for i in 0..12 {
            state.log(EventKind::Milestone, Some("t1"), None, format!("event {i}"));
        }
        state
    }

    #[test]
    fn report_counts_branches_and_keeps_recent_events() {
        let report = StatusReport::from_state(&state(), true);
        assert_eq!(report.branches.abandoned, 1);
        assert_eq!(report.branches.active, 0);
        assert_eq!(report.recent.len(), RECENT_EVENTS);
        assert_eq!(report.recent.last().unwrap().message, "event 11");
        assert_eq!(report.tasks.len(), 2);
        assert!(report.tasks[0].worker.is_none());
    }

    #[test]
    fn markdown_marks_archived_sessions() {
        let report = StatusReport::from_state(&state(), false);
        let md = report.markdown();
        assert!(md.contains("(archived)"));
        assert!(md.contains("|t2|ready|-|-|"));
    }
}
