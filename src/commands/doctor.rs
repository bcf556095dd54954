use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;

use super::OutputFormat;
use crate::config::{self, Config};
use crate::error::ExitError;
use crate::subprocess::{Tool, on_path};
use crate::task::{Backlog, FileBacklog};
use crate::template::{CiContext, CommandTemplate, WorkerContext};

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Default, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
}

impl DoctorReport {
    fn push(&mut self, name: &str, result: Result<String, String>) {
        let (ok, detail) = match result {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };
        self.checks.push(Check {
            name: name.to_string(),
            ok,
            detail,
        });
    }

    pub fn issues(&self) -> usize {
        self.checks.iter().filter(|c| !c.ok).count()
    }
}

/// First word of a shell command that names a program, skipping `VAR=value`.
fn program_of(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|word| !word.contains('='))
}

/// Whether `program` is a path that exists or an executable somewhere on PATH.
fn program_exists(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).exists();
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
    })
}

fn check_command(label: &str, rendered: &str) -> Result<String, String> {
    match program_of(rendered) {
        Some(program) if program_exists(program) => Ok(rendered.to_string()),
        Some(program) => Err(format!("{label}: `{program}` not found")),
        None => Err(format!("{label} renders to an empty command")),
    }
}

fn worker_check(config: &Config) -> Result<String, String> {
    let Some(source) = &config.worker.command else {
        return Err("worker.command is not set".to_string());
    };
    let sample = WorkerContext {
        task_id: "example",
        task_title: "Example task",
        worker_id: "example-w1",
        branch: "task/example-0000-1",
        workdir: "/tmp/example",
        progress_path: "/tmp/example-w1.json",
        attempt: 1,
    };
    let rendered = CommandTemplate::new("worker.command", source)
        .render(&sample)
        .map_err(|e| e.to_string())?;
    check_command("worker.command", &rendered)
}

fn ci_check(config: &Config) -> Option<Result<String, String>> {
    let sample = CiContext {
        change_request: "PR-1",
        branch: "task/example-0000-1",
        task_id: "example",
    };
    if let Some(source) = &config.ci.command {
        let rendered = CommandTemplate::new("ci.command", source).render(&sample);
        return Some(match rendered {
            Ok(cmd) => check_command("ci.command", &cmd),
            Err(e) => Err(e.to_string()),
        });
    }
    config.ci.url.as_ref().map(|source| {
        CommandTemplate::new("ci.url", source)
            .render(&sample)
            .map_err(|e| e.to_string())
    })
}

fn git_check(root: &Path, trunk: &str) -> Result<String, String> {
    if !on_path("git") {
        return Err("git not found on PATH".to_string());
    }
    let head = format!("refs/heads/{trunk}");
    let verify = Tool::new("git")
        .args(&["rev-parse", "--verify", "--quiet", head.as_str()])
        .current_dir(root)
        .run()
        .map_err(|e| format!("{e:#}"))?;
    if verify.success() {
        Ok(format!("trunk {trunk} at {}", verify.stdout.trim()))
    } else {
        Err(format!("no local branch {trunk} in {}", root.display()))
    }
}

impl DoctorArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let root = super::project_root(self.project_root.as_deref())?;
        let config = config::load_project_config(&root)?;

        let mut report = DoctorReport::default();
        report.push("config", Ok(format!("project {}", config.project.name)));
        report.push(
            "merge.auto_resolve",
            config.merge.auto_resolve.map_or_else(
                || Err("unset; `start` needs --auto-resolve or --no-auto-resolve".to_string()),
                |v| Ok(v.to_string()),
            ),
        );
        report.push(
            "backlog",
            FileBacklog::new(config.backlog_path(&root))
                .load()
                .map(|tasks| format!("{} task(s)", tasks.len()))
                .map_err(|e| format!("{e:#}")),
        );
        report.push("git", git_check(&root, &config.project.trunk));
        report.push("worker.command", worker_check(&config));
        if let Some(result) = ci_check(&config) {
            report.push("ci", result);
        }
        if let Some(command) = &config.verify.command {
            report.push("verify.command", check_command("verify.command", command));
        }

        match OutputFormat::resolve(self.format) {
            OutputFormat::Pretty => {
                for c in &report.checks {
                    println!("{} {:<20} {}", if c.ok { "✓" } else { "✗" }, c.name, c.detail);
                }
            }
            OutputFormat::Text => {
                for c in &report.checks {
                    println!("check  name={}  ok={}  detail={}", c.name, c.ok, c.detail);
                }
            }
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }

        let issues = report.issues();
        if issues > 0 {
            return Err(ExitError::Other(format!("{issues} issue(s) found")).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_skips_env_assignments() {
        assert_eq!(program_of("RUST_LOG=debug cargo test"), Some("cargo"));
        assert_eq!(program_of("   "), None);
    }

    #[test]
    fn worker_template_typos_are_reported() {
        let mut config = Config::new("demo");
        config.worker.command = Some("sh -c 'echo {{ task_idd }}'".to_string());
        let err = worker_check(&config).unwrap_err();
        assert!(err.contains("worker.command"));

        config.worker.command = Some("sh -c 'echo {{ task_id }}'".to_string());
        assert!(worker_check(&config).is_ok());
    }

    #[test]
    fn missing_programs_are_reported() {
        assert!(check_command("verify.command", "definitely-not-a-real-program-xyz").is_err());
    }
}
