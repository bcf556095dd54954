//! Command-line templates for workers, CI checks and the like.
//!
//! Templates are minijinja with strict undefined handling, so a typo in a
//! variable name fails loudly instead of rendering an empty string into a
//! shell command. `shell_quote` is available for values that may contain
//! spaces.

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
#[error("template {name}: {source}")]
pub struct TemplateError {
    name: &'static str,
    #[source]
    source: minijinja::Error,
}

/// Variables available to `worker.command`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerContext<'a> {
    pub task_id: &'a str,
    pub task_title: &'a str,
    pub worker_id: &'a str,
    pub branch: &'a str,
    pub workdir: &'a str,
    pub progress_path: &'a str,
    pub attempt: u32,
}

/// Variables available to `ci.command` and `ci.url`.
#[derive(Debug, Clone, Serialize)]
pub struct CiContext<'a> {
    pub change_request: &'a str,
    pub branch: &'a str,
    pub task_id: &'a str,
}

/// A named template source.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    name: &'static str,
    source: String,
}

impl CommandTemplate {
    pub fn new(name: &'static str, source: &str) -> Self {
        Self {
            name,
            source: source.to_string(),
        }
    }

    /// Render against `ctx`.
    pub fn render<S: Serialize>(&self, ctx: &S) -> Result<String, TemplateError> {
        environment()
            .render_str(&self.source, ctx)
            .map(|s| s.trim().to_string())
            .map_err(|source| TemplateError {
                name: self.name,
                source,
            })
    }
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("shell_quote", shell_quote);
    env
}

/// Single-quote `value` for POSIX shells.
pub fn shell_quote(value: String) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@+,".contains(&b))
    {
        return value;
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
