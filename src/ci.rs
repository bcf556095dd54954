//! CI status lookups for change requests.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::CiConfig;
use crate::subprocess::Tool;
use crate::template::{CiContext, CommandTemplate};

/// Aggregated check state of one change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Success,
    Failure,
    Error,
    /// No checks are configured for the change.
    None,
}

impl CiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CiStatus::Pending => "pending",
            CiStatus::Success => "success",
            CiStatus::Failure => "failure",
            CiStatus::Error => "error",
            CiStatus::None => "none",
        }
    }

    /// A red result that counts against the worker's CI budget.
    pub fn is_failure(self) -> bool {
        matches!(self, CiStatus::Failure | CiStatus::Error)
    }

    /// Whether a change with this status may enter the merge queue.
    pub fn allows_merge(self) -> bool {
        matches!(self, CiStatus::Success | CiStatus::None)
    }

    /// Map the many spellings CI systems use onto the five states.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let status = match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "in_progress" | "running" | "waiting" | "expected" => {
                CiStatus::Pending
            }
            "success" | "succeeded" | "passed" | "pass" | "ok" | "green" => CiStatus::Success,
            "failure" | "failed" | "fail" | "red" => CiStatus::Failure,
            "error" | "errored" | "cancelled" | "canceled" | "timed_out" => CiStatus::Error,
            "" | "none" | "no_checks" | "skipped" | "neutral" => CiStatus::None,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the coordinator knows about a change when it asks CI.
#[derive(Debug, Clone, Copy)]
pub struct CiQuery<'a> {
    pub change_request: &'a str,
    pub branch: &'a str,
    pub task_id: &'a str,
}

impl<'a> CiQuery<'a> {
    fn context(&self) -> CiContext<'a> {
        CiContext {
            change_request: self.change_request,
            branch: self.branch,
            task_id: self.task_id,
        }
    }
}

pub trait CiProvider {
    fn status(&mut self, query: &CiQuery<'_>) -> anyhow::Result<CiStatus>;
}

/// Used when no CI is configured; every change reports `none`.
#[derive(Debug, Default)]
pub struct NoCi;

impl CiProvider for NoCi {
    fn status(&mut self, _query: &CiQuery<'_>) -> anyhow::Result<CiStatus> {
        Ok(CiStatus::None)
    }
}

/// Runs a shell command that prints either a bare status word or a JSON
/// object shaped like the HTTP response.
#[derive(Debug)]
pub struct CommandCi {
    template: CommandTemplate,
    timeout: Duration,
}

impl CommandCi {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            template: CommandTemplate::new("ci.command", command),
            timeout,
        }
    }
}

impl CiProvider for CommandCi {
    fn status(&mut self, query: &CiQuery<'_>) -> anyhow::Result<CiStatus> {
        let command = self.template.render(&query.context())?;
        let out = Tool::shell(&command).timeout(self.timeout).run_ok()?;
        if out.stdout.trim_start().starts_with('{') {
            return out.parse_json::<StatusBody>()?.status();
        }
        let first = out.stdout.lines().next().unwrap_or_default();
        CiStatus::parse_loose(first)
            .with_context(|| format!("CI command printed unknown status {first:?}"))
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// GETs a URL returning JSON with a `state` or `status` field.
pub struct HttpCi {
    template: CommandTemplate,
    agent: ureq::Agent,
}

impl HttpCi {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            template: CommandTemplate::new("ci.url", url),
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl CiProvider for HttpCi {
    fn status(&mut self, query: &CiQuery<'_>) -> anyhow::Result<CiStatus> {
        let url = self.template.render(&query.context())?;
        let body = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("querying CI at {url}"))?
            .into_body()
            .read_to_string()
            .context("reading CI response")?;
        parse_status_body(&body)
    }
}

impl StatusBody {
    fn status(self) -> anyhow::Result<CiStatus> {
        let raw = self
            .state
            .or(self.status)
            .context("CI response has neither `state` nor `status`")?;
        CiStatus::parse_loose(&raw).with_context(|| format!("unknown CI status {raw:?}"))
    }
}

fn parse_status_body(body: &str) -> anyhow::Result<CiStatus> {
    serde_json::from_str::<StatusBody>(body)
        .context("CI response is not JSON")?
        .status()
}

/// Build the provider `ci` config asks for.
pub fn from_config(config: &CiConfig) -> Box<dyn CiProvider> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match (&config.command, &config.url) {
        (Some(command), _) => Box::new(CommandCi::new(command, timeout)),
        (None, Some(url)) => Box::new(HttpCi::new(url, timeout)),
        (None, None) => Box::new(NoCi),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> CiQuery<'static> {
        CiQuery {
            change_request: "PR-12",
            branch: "task/t-1-1",
            task_id: "t-1",
        }
    }

    #[test]
    fn loose_parsing() {
        assert_eq!(CiStatus::parse_loose("SUCCESS"), Some(CiStatus::Success));
        assert_eq!(CiStatus::parse_loose(" in_progress\n"), Some(CiStatus::Pending));
        assert_eq!(CiStatus::parse_loose("cancelled"), Some(CiStatus::Error));
        assert_eq!(CiStatus::parse_loose(""), Some(CiStatus::None));
        assert_eq!(CiStatus::parse_loose("purple"), None);
    }

    #[test]
    fn merge_gate() {
        assert!(CiStatus::Success.allows_merge());
        assert!(CiStatus::None.allows_merge());
        assert!(!CiStatus::Pending.allows_merge());
        assert!(!CiStatus::Error.allows_merge());
        assert!(CiStatus::Error.is_failure());
    }

    #[test]
    fn body_prefers_state_then_status() {
        assert_eq!(
            parse_status_body(r#"{"state": "failure", "status": "success"}"#).unwrap(),
            CiStatus::Failure
        );
        assert_eq!(
            parse_status_body(r#"{"status": "passed"}"#).unwrap(),
            CiStatus::Success
        );
        assert!(parse_status_body(r#"{"conclusion": "x"}"#).is_err());
    }

    #[test]
    fn command_ci_reads_first_line() {
        let mut ci = CommandCi::new(
            "printf '%s\\nextra\\n' success-{{ change_request }}",
            Duration::from_secs(5),
        );
        // "success-PR-12" is not a known status; the template must have rendered.
        let err = ci.status(&query()).unwrap_err();
        assert!(err.to_string().contains("success-PR-12"));

        let mut ci = CommandCi::new("echo failed", Duration::from_secs(5));
        assert_eq!(ci.status(&query()).unwrap(), CiStatus::Failure);
    }

    #[test]
    fn command_ci_accepts_json() {
        let mut ci = CommandCi::new(
            r#"echo '{"state": "pending", "url": "https://ci.example/{{ task_id }}"}'"#,
            Duration::from_secs(5),
        );
        assert_eq!(ci.status(&query()).unwrap(), CiStatus::Pending);
    }

    #[test]
    fn no_ci_reports_none() {
        assert_eq!(NoCi.status(&query()).unwrap(), CiStatus::None);
    }
}
