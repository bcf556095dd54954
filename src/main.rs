use std::process::ExitCode;

use clap::{Parser, Subcommand};

use trunkline::commands::abort::AbortArgs;
use trunkline::commands::doctor::DoctorArgs;
use trunkline::commands::init::InitArgs;
use trunkline::commands::report::ReportArgs;
use trunkline::commands::resolve::ResolveArgs;
use trunkline::commands::schema::SchemaArgs;
use trunkline::commands::start::StartArgs;
use trunkline::commands::status::StatusArgs;
use trunkline::error::{CoordinatorError, ExitError};
use trunkline::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "trunkline",
    version,
    about = "Coordinate parallel coding workers and merge their work into trunk one change at a time"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start (or resume) a session over the backlog
    Start(StartArgs),
    /// Show the current or most recent session
    Status(StatusArgs),
    /// Ask the running coordinator to stop
    Abort(AbortArgs),
    /// Answer a pending escalation
    Resolve(ResolveArgs),
    /// Update a worker's progress record (run by workers)
    Report(ReportArgs),
    /// Write a default .trunkline.toml and sample backlog
    Init(InitArgs),
    /// Validate config, backlog and tools
    Doctor(DoctorArgs),
    /// Print a JSON Schema
    Schema(SchemaArgs),
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Status(_) => "status",
            Self::Abort(_) => "abort",
            Self::Resolve(_) => "resolve",
            Self::Report(_) => "report",
            Self::Init(_) => "init",
            Self::Doctor(_) => "doctor",
            Self::Schema(_) => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Start(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Abort(args) => args.execute(),
        Commands::Resolve(args) => args.execute(),
        Commands::Report(args) => args.execute(),
        Commands::Init(args) => args.execute(),
        Commands::Doctor(args) => args.execute(),
        Commands::Schema(args) => args.execute(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else if let Some(CoordinatorError::InvalidConfiguration(msg)) =
                e.downcast_ref::<CoordinatorError>()
            {
                let exit_err = ExitError::Config(msg.clone());
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
