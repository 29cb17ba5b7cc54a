//! The pipeline run — `stagehand run`.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;

use stagehand::invoke::ProcessInvoker;
use stagehand::orchestrator::{Orchestrator, RunOptions};
use stagehand::pipeline_config::{CliOverrides, PipelineConfig};
use stagehand::workers::WorkerPolicy;

use crate::{Cli, RunArgs};

/// Returns the process exit code: 0 for success or partial, 1 otherwise.
pub async fn cmd_run(cli: &Cli, project_dir: &Path, args: &RunArgs) -> Result<u8> {
    let config = PipelineConfig::new(project_dir.to_path_buf(), cli.config.clone())?
        .with_cli_overrides(CliOverrides {
            max_retries: args.max_retries,
            worker_override: args.worker_override,
            inputs: args.inputs.clone(),
        });

    for warning in config.validate() {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }

    let plan = config.plan()?;
    if plan.is_empty() {
        bail!(
            "No phases configured in {}",
            config.config_path.display()
        );
    }
    let inputs = config.input_files()?;
    if inputs.is_empty() {
        bail!("No input files found; set run.inputs or pass --input");
    }

    let state_file = config.state_file();
    let invoker = Arc::new(ProcessInvoker::new(
        &config.project_dir,
        &state_file,
        config.log_dir(),
    ));
    let options = RunOptions {
        input_id: config.input_id(),
        phases: args.phases.clone(),
        resume: !args.no_resume,
        max_retries: config.max_retries(),
        crash_retry_same_config: config.toml.run.crash_retry_same_config,
        lock_retries: config.lock_retries(),
        artifact_root: config.artifact_root(),
        fallback_table: config.fallback_table(),
        workers: WorkerPolicy::detect(args.worker_override),
    };

    let orchestrator = Orchestrator::new(config.open_store(), plan, invoker, options);
    let report = orchestrator.run(&inputs).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(report.exit_code() as u8)
}
