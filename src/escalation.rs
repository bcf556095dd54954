//! Escalations: failures the coordinator will not resolve on its own.
//!
//! An escalation is raised with the options that make sense for its category
//! and stays pending until an [`Operator`] picks one. Pending escalations never
//! block unrelated work; only the task (or, for merge and verification
//! failures, the queue) they concern waits.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::IsTerminal;
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::failure::FailureCategory;
use crate::paths::{SessionPaths, atomic_write};
use crate::phase::Phase;

/// A choice offered to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Choice {
    Retry,
    Skip,
    Abort,
    Resolve,
    RevertLast,
    RevertAll,
    Manual,
}

impl Choice {
    pub const ALL: [Choice; 7] = [
        Choice::Retry,
        Choice::Skip,
        Choice::Abort,
        Choice::Resolve,
        Choice::RevertLast,
        Choice::RevertAll,
        Choice::Manual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Choice::Retry => "retry",
            Choice::Skip => "skip",
            Choice::Abort => "abort",
            Choice::Resolve => "resolve",
            Choice::RevertLast => "revert-last",
            Choice::RevertAll => "revert-all",
            Choice::Manual => "manual",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Choice::Retry => "try again",
            Choice::Skip => "give up on this task and carry on",
            Choice::Abort => "stop the whole session",
            Choice::Resolve => "conflict fixed by hand; merge the branch again",
            Choice::RevertLast => "revert the most recent merge",
            Choice::RevertAll => "revert every merge made this session",
            Choice::Manual => "leave trunk as it is; I will fix it",
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Choice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Choice::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Choice::ALL.iter().map(|c| c.as_str()).collect();
                format!("unknown choice {s:?} (expected one of {})", known.join(", "))
            })
    }
}

/// Which coordinator step raised the escalation; decides how a choice is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// A worker failed and the task ran out of automatic attempts.
    Worker,
    /// Creating the branch, worktree or process for a new worker failed.
    Spawn,
    /// A worker's progress record stayed unreadable past the grace period.
    Progress,
    /// CI failed too often for one worker.
    Ci,
    /// The merge queue head could not be integrated.
    MergeDrain,
    /// Trunk failed verification after a merge.
    PostMerge,
}

/// A pending question for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Escalation {
    pub id: String,
    pub category: FailureCategory,
    pub origin: Origin,
    pub task_id: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub phase: Option<Phase>,
    pub detail: String,
    pub options: Vec<Choice>,
    #[serde(default)]
    pub conflicting_files: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    pub fn offers(&self, choice: Choice) -> bool {
        self.options.contains(&choice)
    }
}

/// The operator's answer, as written by `trunkline resolve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Disposition {
    pub escalation_id: String,
    pub choice: Choice,
    #[serde(default)]
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl Disposition {
    pub fn new(escalation_id: &str, choice: Choice, note: Option<String>) -> Self {
        Self {
            escalation_id: escalation_id.to_string(),
            choice,
            note,
            decided_at: Utc::now(),
        }
    }

    /// Drop the disposition where a running coordinator will pick it up.
    pub fn deliver(&self, paths: &SessionPaths) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serializing disposition")?;
        atomic_write(&paths.disposition_file(&self.escalation_id), &json)
    }
}

/// Session-wide counts shown next to every escalation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SessionProgress {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub ready: usize,
    pub blocked: usize,
    pub failed: usize,
    pub skipped: usize,
    pub active_workers: usize,
    pub queued_merges: usize,
    pub pending_escalations: usize,
}

/// Whoever answers escalations.
///
/// `Ok(None)` means no decision yet; the coordinator asks again next tick and
/// keeps the rest of the session moving meanwhile.
pub trait Operator {
    fn decide(
        &mut self,
        escalation: &Escalation,
        progress: &SessionProgress,
    ) -> anyhow::Result<Option<Choice>>;
}

/// Markdown panel describing an escalation.
pub fn render_panel(escalation: &Escalation, progress: &SessionProgress) -> String {
    let mut md = format!(
        "## {} `{}`\n\n| | |\n|-|-|\n| task | {} |\n",
        escalation.category.title(),
        escalation.id,
        escalation.task_id
    );
    if let Some(worker) = &escalation.worker_id {
        md.push_str(&format!("| worker | {worker} |\n"));
    }
    if let Some(phase) = escalation.phase {
        md.push_str(&format!("| phase | {phase} |\n"));
    }
    md.push_str(&format!(
        "| session | {}/{} completed, {} in progress, {} failed, {} queued for merge |\n\n",
        progress.completed,
        progress.total,
        progress.in_progress,
        progress.failed,
        progress.queued_merges
    ));
    md.push_str(&format!("{}\n\n", escalation.detail));
    if !escalation.conflicting_files.is_empty() {
        md.push_str("**Conflicting files:**\n\n");
        for file in &escalation.conflicting_files {
            md.push_str(&format!("* `{file}`\n"));
        }
        md.push('\n');
    }
    md.push_str("**Options:**\n\n");
    for choice in &escalation.options {
        md.push_str(&format!("* `{choice}`: {}\n", choice.describe()));
    }
    md
}

fn print_panel(escalation: &Escalation, progress: &SessionProgress) {
    let skin = termimad::MadSkin::default();
    eprint!("{}", skin.term_text(&render_panel(escalation, progress)));
}

/// Reads dispositions dropped into the signals directory by `trunkline resolve`.
///
/// Each escalation's panel is printed once, with the command to answer it.
pub struct SignalOperator {
    paths: SessionPaths,
    announced: HashSet<String>,
    quiet: bool,
}

impl SignalOperator {
    pub fn new(paths: SessionPaths) -> Self {
        Self {
            paths,
            announced: HashSet::new(),
            quiet: false,
        }
    }

    /// Don't print panels (tests, `--quiet`).
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    fn take_disposition(&self, escalation: &Escalation) -> anyhow::Result<Option<Choice>> {
        let path = self.paths.disposition_file(&escalation.id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;

        let disposition: Disposition = match serde_json::from_str(&contents) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(escalation = %escalation.id, error = %e, "ignoring malformed disposition");
                return Ok(None);
            }
        };
        if !escalation.offers(disposition.choice) {
            tracing::warn!(
                escalation = %escalation.id,
                choice = %disposition.choice,
                "ignoring disposition that was not offered"
            );
            return Ok(None);
        }
        Ok(Some(disposition.choice))
    }
}

impl Operator for SignalOperator {
    fn decide(
        &mut self,
        escalation: &Escalation,
        progress: &SessionProgress,
    ) -> anyhow::Result<Option<Choice>> {
        if self.announced.insert(escalation.id.clone()) && !self.quiet {
            print_panel(escalation, progress);
            let options: Vec<&str> = escalation.options.iter().map(|c| c.as_str()).collect();
            eprintln!(
                "Answer with: trunkline resolve {} <{}>\n",
                escalation.id,
                options.join("|")
            );
        }
        self.take_disposition(escalation)
    }
}

/// Prompts on the terminal, blocking until the operator picks an option.
///
/// Dispositions delivered through `trunkline resolve` still win, so a second
/// shell can answer while the prompt is up on the next tick.
pub struct InteractiveOperator {
    signals: SignalOperator,
}

impl InteractiveOperator {
    pub fn new(paths: SessionPaths) -> Self {
        Self {
            signals: SignalOperator::new(paths).quiet(),
        }
    }
}

impl Operator for InteractiveOperator {
    fn decide(
        &mut self,
        escalation: &Escalation,
        progress: &SessionProgress,
    ) -> anyhow::Result<Option<Choice>> {
        if let Some(choice) = self.signals.take_disposition(escalation)? {
            return Ok(Some(choice));
        }
        print_panel(escalation, progress);
        let labels: Vec<String> = escalation
            .options
            .iter()
            .map(|c| format!("{c}  ({})", c.describe()))
            .collect();
        let picked = dialoguer::Select::new()
            .with_prompt(format!("How should {} be handled?", escalation.id))
            .items(&labels)
            .default(0)
            .interact_opt()
            .context("reading operator choice")?;
        Ok(picked.map(|i| escalation.options[i]))
    }
}

/// Interactive when both stdin and stderr are terminals, signal files otherwise.
pub fn operator_for_terminal(paths: SessionPaths, allow_prompt: bool) -> Box<dyn Operator> {
    if allow_prompt && std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Box::new(InteractiveOperator::new(paths))
    } else {
        Box::new(SignalOperator::new(paths))
    }
}
