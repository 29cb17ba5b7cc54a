//! Configuration and state validation — `stagehand validate`.

use anyhow::Result;
use console::style;
use std::path::Path;

use stagehand::errors::StateError;
use stagehand::pipeline_config::PipelineConfig;

use crate::Cli;

/// Exit code 1 for configuration problems; state corruption is returned as an error.
pub fn cmd_validate(cli: &Cli, project_dir: &Path) -> Result<u8> {
    let config = PipelineConfig::new(project_dir.to_path_buf(), cli.config.clone())?;
    let mut problems = 0;

    println!();
    if config.config_path.exists() {
        println!("Config file: {}", config.config_path.display());
    } else {
        println!(
            "No config file at {}; using defaults",
            config.config_path.display()
        );
    }

    for warning in config.validate() {
        println!("  {} {}", style("warning:").yellow(), warning);
    }

    match config.plan() {
        Ok(plan) => {
            let order: Vec<&str> = plan.phases().iter().map(|p| p.name.as_str()).collect();
            println!("Phases ({}): {}", plan.len(), order.join(" -> "));
        }
        Err(e) => {
            println!("  {} {:#}", style("error:").red(), e);
            problems += 1;
        }
    }

    let store = config.open_store();
    if !store.exists() {
        println!(
            "State document {} not initialized yet",
            store.path().display()
        );
    } else {
        match store.read() {
            Ok(doc) => println!(
                "State document {} is valid ({} phases)",
                store.path().display(),
                doc.phases.len()
            ),
            Err(e) => {
                if let StateError::Corruption {
                    recommended_backup: Some(_),
                    ..
                } = &e
                {
                    println!("Restore with `stagehand backups restore latest`");
                }
                return Err(e.into());
            }
        }
    }
    println!();

    Ok(if problems > 0 { 1 } else { 0 })
}
