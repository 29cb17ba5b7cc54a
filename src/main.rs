use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;

use stagehand::errors::{OrchestratorError, StateError};
use stagehand::logging::{self, LogFormat};

mod cmd;

/// Exit code for a state-store fatal error.
const EXIT_STATE_FATAL: u8 = 2;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Crash-safe, resumable orchestrator for multi-phase narration pipelines")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Pipeline config file (defaults to .stagehand/pipeline.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .stagehand/ with a starter pipeline.toml and an empty state document
    Init {
        /// Identifier of the source being narrated (defaults to the directory name)
        #[arg(long)]
        input_id: Option<String>,
    },
    /// Run the pipeline over every input file
    Run(RunArgs),
    /// Show phase and file status from the state document
    Status {
        /// Only show this phase
        #[arg(short, long)]
        phase: Option<String>,

        /// Print the raw state document
        #[arg(long)]
        json: bool,
    },
    /// Validate the config file and the state document
    Validate,
    /// List or restore state backups
    Backups {
        #[command(subcommand)]
        command: BackupsCommands,
    },
    /// Show recent transaction log entries
    Log {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Record results from inside a phase executable
    Report {
        #[command(subcommand)]
        command: ReportCommands,
    },
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Phases to run (comma-separated); defaults to all configured phases
    #[arg(long, value_delimiter = ',')]
    pub phases: Vec<String>,

    /// Reuse up-to-date results (default)
    #[arg(long, overrides_with = "no_resume")]
    pub resume: bool,

    /// Re-run every requested phase regardless of previous results
    #[arg(long)]
    pub no_resume: bool,

    /// Override run.max_retries
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Worker count when not running as a batch child
    #[arg(long)]
    pub worker_override: Option<usize>,

    /// Input files; replaces the configured globs
    #[arg(long = "input")]
    pub inputs: Vec<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Clone)]
pub enum BackupsCommands {
    /// List backups, newest first
    List {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Replace the state document with a backup (`latest` picks the newest valid one)
    Restore { name: String },
}

/// Which record a report targets; filled from the executable's environment.
#[derive(Args, Clone, Debug)]
pub struct ReportTarget {
    #[arg(long, env = "STAGEHAND_STATE_FILE")]
    pub state_file: PathBuf,

    #[arg(long, env = "STAGEHAND_PHASE")]
    pub phase: String,

    #[arg(long, env = "STAGEHAND_FILE_ID")]
    pub file_id: String,
}

#[derive(Subcommand, Clone)]
pub enum ReportCommands {
    /// Record one unit result
    Unit {
        #[command(flatten)]
        target: ReportTarget,

        unit_id: String,

        #[arg(long, value_enum)]
        status: cmd::report::UnitOutcome,

        /// Output artifact, relative to the artifact root
        #[arg(long)]
        output: Option<String>,

        /// Engine configuration that produced the unit
        #[arg(long, env = "STAGEHAND_ENGINE")]
        engine: Option<String>,

        /// Validation failure reason
        #[arg(long)]
        reason: Option<String>,

        /// Validation details as a JSON object
        #[arg(long)]
        details: Option<String>,
    },
    /// Record file-level artifacts, metrics or errors
    File {
        #[command(flatten)]
        target: ReportTarget,

        #[arg(long = "artifact")]
        artifacts: Vec<PathBuf>,

        #[arg(long)]
        expected_units: Option<usize>,

        /// Metric as key=value; the value is parsed as JSON when possible
        #[arg(long = "metric")]
        metrics: Vec<String>,

        #[arg(long)]
        error: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match dispatch(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {:#}", style("error:").red().bold(), err);
            if is_state_fatal(&err) {
                ExitCode::from(EXIT_STATE_FATAL)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<u8> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only the run loop writes to the rolling log file.
    let log_dir = match &cli.command {
        Commands::Run(_) => Some(project_dir.join(stagehand::pipeline_config::STAGEHAND_DIR).join("logs")),
        _ => None,
    };
    let _guard = logging::init(cli.log_format, cli.verbose, log_dir.as_deref());

    match &cli.command {
        Commands::Init { input_id } => cmd::cmd_init(cli, &project_dir, input_id.as_deref())?,
        Commands::Run(args) => return cmd::cmd_run(cli, &project_dir, args).await,
        Commands::Status { phase, json } => {
            cmd::cmd_status(cli, &project_dir, phase.as_deref(), *json)?
        }
        Commands::Validate => return cmd::cmd_validate(cli, &project_dir),
        Commands::Backups { command } => cmd::cmd_backups(cli, &project_dir, command)?,
        Commands::Log { limit } => cmd::cmd_log(cli, &project_dir, *limit)?,
        Commands::Report { command } => cmd::cmd_report(command)?,
    }

    Ok(0)
}

fn is_state_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<StateError>().is_some()
            || cause
                .downcast_ref::<OrchestratorError>()
                .and_then(OrchestratorError::as_state_error)
                .is_some()
    })
}
