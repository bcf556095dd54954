use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".trunkline.toml";
pub const CONFIG_JSON: &str = ".trunkline.json";

/// Find the config file path, preferring .trunkline.toml over .trunkline.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Load the project config from `root`, failing with a config error if absent.
pub fn load_project_config(root: &Path) -> anyhow::Result<Config> {
    let path = find_config(root).ok_or_else(|| {
        ExitError::Config(format!(
            "no {CONFIG_TOML} or {CONFIG_JSON} found in {} (run `trunkline init`)",
            root.display()
        ))
    })?;
    Config::load(&path)
}

/// Top-level .trunkline.toml config.
///
/// All structs use snake_case (TOML native) with `alias` attributes so JSON
/// configs written in camelCase load too.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    pub version: String,
    pub project: ProjectConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub ci: CiConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub abort: AbortConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_trunk")]
    pub trunk: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_backlog")]
    pub backlog: PathBuf,
}

/// How many workers run at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Exactly one worker at a time.
    Sequential,
    /// Up to `max_concurrency` workers.
    #[default]
    Parallel,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Sequential => "sequential",
            Mode::Parallel => "parallel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub mode: Mode,
    /// Worker slots in parallel mode (2 when unset). Sequential mode always
    /// runs one worker and rejects an explicit value above 1.
    #[serde(default, alias = "maxConcurrency")]
    pub max_concurrency: Option<u32>,
    #[serde(default = "default_poll_interval", alias = "pollIntervalSecs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_grace", alias = "progressGraceSecs")]
    pub progress_grace_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            max_concurrency: None,
            poll_interval_secs: default_poll_interval(),
            progress_grace_secs: default_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    /// Failed workers per task before the operator decides.
    #[serde(default = "default_retry_limit", alias = "workerLimit")]
    pub worker_limit: u32,
    /// CI failures per worker before the operator decides.
    #[serde(default = "default_retry_limit", alias = "ciLimit")]
    pub ci_limit: u32,
    /// Attempts for filesystem/network operations.
    #[serde(default = "default_infra_attempts", alias = "infraAttempts")]
    pub infra_attempts: u32,
    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_infra_delay", alias = "infraBaseDelayMs")]
    pub infra_base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            worker_limit: default_retry_limit(),
            ci_limit: default_retry_limit(),
            infra_attempts: default_infra_attempts(),
            infra_base_delay_ms: default_infra_delay(),
        }
    }
}

/// How a queued branch lands on trunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Rebase the branch onto trunk, then fast-forward.
    #[default]
    Rebase,
    /// Merge commit on top of trunk.
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MergeConfig {
    #[serde(default)]
    pub strategy: MergeStrategy,
    /// Whether a conflicting entry gets one automatic rebase before the queue
    /// pauses. Deliberately has no default.
    #[serde(default, alias = "autoResolve")]
    pub auto_resolve: Option<bool>,
    #[serde(default = "default_true")]
    pub push: bool,
    #[serde(default = "default_true", alias = "deleteBranches")]
    pub delete_branches: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::default(),
            auto_resolve: None,
            push: true,
            delete_branches: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerConfig {
    /// Template for the worker command line (minijinja).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_branch_prefix", alias = "branchPrefix")]
    pub branch_prefix: String,
    #[serde(default = "default_true")]
    pub worktrees: bool,
    /// Override for where worktrees are created.
    #[serde(default, alias = "worktreeRoot")]
    pub worktree_root: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: None,
            branch_prefix: default_branch_prefix(),
            worktrees: true,
            worktree_root: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CiConfig {
    /// Template for a command whose stdout names the CI state.
    #[serde(default)]
    pub command: Option<String>,
    /// Template for a URL returning JSON with a `state` or `status` field.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_ci_timeout", alias = "timeoutSecs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct VerifyConfig {
    /// Build/test command run on trunk after every merge.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, alias = "timeoutSecs")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
pub struct AbortConfig {
    #[serde(default, alias = "terminateWorkers")]
    pub terminate_workers: bool,
    #[serde(default, alias = "deleteBranches")]
    pub delete_branches: bool,
}

// Default value functions for serde
fn default_trunk() -> String { "main".into() }
fn default_remote() -> String { "origin".into() }
fn default_backlog() -> PathBuf { PathBuf::from(".trunkline/tasks.toml") }
pub const DEFAULT_MAX_CONCURRENCY: u32 = 2;
fn default_poll_interval() -> u64 { 5 }
fn default_grace() -> u64 { 60 }
fn default_retry_limit() -> u32 { 2 }
fn default_infra_attempts() -> u32 { 3 }
fn default_infra_delay() -> u64 { 1000 }
fn default_branch_prefix() -> String { "task".into() }
fn default_ci_timeout() -> u64 { 60 }
fn default_true() -> bool { true }

impl RetryConfig {
    pub fn infra_base_delay(&self) -> Duration {
        Duration::from_millis(self.infra_base_delay_ms)
    }
}

impl Config {
    /// A config with every section at its default.
    pub fn new(name: &str) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            project: ProjectConfig {
                name: name.to_string(),
                trunk: default_trunk(),
                remote: default_remote(),
                backlog: default_backlog(),
            },
            coordinator: CoordinatorConfig::default(),
            retry: RetryConfig::default(),
            merge: MergeConfig::default(),
            worker: WorkerConfig::default(),
            ci: CiConfig::default(),
            verify: VerifyConfig::default(),
            abort: AbortConfig::default(),
        }
    }

    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# trunkline project configuration\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(|item| item.as_table_mut()) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "coordinator", "\n# Worker scheduling and polling\n");
        set_table_comment(&mut doc, "retry", "\n# Retry limits before escalating to the operator\n");
        let merge_comment = if self.merge.auto_resolve.is_none() {
            "\n# Sequential merge queue\n\
             # auto_resolve must be set before `trunkline start`:\n\
             #   auto_resolve = true   # one automatic rebase on conflict, then pause\n\
             #   auto_resolve = false  # pause on the first conflict\n"
        } else {
            "\n# Sequential merge queue\n"
        };
        set_table_comment(&mut doc, "merge", merge_comment);
        set_table_comment(
            &mut doc,
            "worker",
            "\n# Worker spawn command (minijinja: task_id, task_title, worker_id, branch, workdir, progress_path, attempt)\n",
        );
        set_table_comment(&mut doc, "ci", "\n# CI status source (command or url template)\n");
        set_table_comment(&mut doc, "verify", "\n# Post-merge verification on trunk\n");
        set_table_comment(&mut doc, "abort", "\n# What abort does with in-flight work\n");

        Ok(doc.to_string())
    }

    /// Backlog path resolved against the project root.
    pub fn backlog_path(&self, project_root: &Path) -> PathBuf {
        if self.project.backlog.is_absolute() {
            self.project.backlog.clone()
        } else {
            project_root.join(&self.project.backlog)
        }
    }
}
