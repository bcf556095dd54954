use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::config::Config;
use crate::escalation::Disposition;
use crate::progress::ProgressRecord;
use crate::state::CoordinatorState;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum SchemaKind {
    /// `.trunkline.toml`
    #[default]
    Config,
    /// A worker's progress record
    Progress,
    /// The persisted coordinator state
    State,
    /// An operator disposition file
    Disposition,
}

#[derive(Debug, Args)]
pub struct SchemaArgs {
    #[arg(value_enum, default_value_t)]
    pub kind: SchemaKind,
}

impl SchemaArgs {
    /// Print the JSON Schema to stdout.
    pub fn execute(&self) -> anyhow::Result<()> {
        let schema = match self.kind {
            SchemaKind::Config => schema_for!(Config),
            SchemaKind::Progress => schema_for!(ProgressRecord),
            SchemaKind::State => schema_for!(CoordinatorState),
            SchemaKind::Disposition => schema_for!(Disposition),
        };
        println!("{}", serde_json::to_string_pretty(&schema)?);
        Ok(())
    }
}
