//! Backup listing and restore — `stagehand backups`.

use anyhow::{Context, Result};
use std::path::Path;

use stagehand::pipeline_config::PipelineConfig;

use crate::{BackupsCommands, Cli};

pub fn cmd_backups(cli: &Cli, project_dir: &Path, command: &BackupsCommands) -> Result<()> {
    let config = PipelineConfig::new(project_dir.to_path_buf(), cli.config.clone())?;
    let store = config.open_store();

    match command {
        BackupsCommands::List { limit } => {
            let backups = store.list_backups(*limit)?;
            if backups.is_empty() {
                println!("No backups for {}", store.path().display());
                return Ok(());
            }
            for backup in backups {
                println!(
                    "{:<48} {}  {:>9} bytes",
                    backup.name,
                    backup.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    backup.size
                );
            }
        }
        BackupsCommands::Restore { name } => {
            let backup = if name == "latest" {
                store
                    .latest_valid_backup()
                    .context("No valid backup available")?
            } else {
                store.find_backup(name)?
            };
            let doc = store.restore_backup(&backup)?;
            println!(
                "Restored {} from {} ({} phases)",
                store.path().display(),
                backup.name,
                doc.phases.len()
            );
        }
    }
    Ok(())
}
