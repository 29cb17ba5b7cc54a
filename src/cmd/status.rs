//! State inspection — `stagehand status` and `stagehand log`.

use anyhow::Result;
use console::style;
use std::path::Path;

use stagehand::orchestrator::report::status_label;
use stagehand::pipeline_config::PipelineConfig;
use stagehand::state::{FileRecord, Status};

use crate::Cli;

pub fn cmd_status(cli: &Cli, project_dir: &Path, phase: Option<&str>, json: bool) -> Result<()> {
    let config = PipelineConfig::new(project_dir.to_path_buf(), cli.config.clone())?;
    let store = config.open_store();
    let doc = store.read()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!();
    println!("{} {}", style("State:").bold(), store.path().display());
    println!(
        "Input: {}  Last run: {}  Updated: {}",
        doc.metadata.input_id,
        doc.metadata.run_id.as_deref().unwrap_or("-"),
        doc.metadata.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    // Configured order first, then anything only the document knows about.
    let mut names: Vec<String> = config
        .plan()
        .map(|plan| plan.phases().iter().map(|p| p.name.clone()).collect())
        .unwrap_or_default();
    for name in doc.phases.keys() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }

    for name in names.iter().filter(|n| phase.is_none_or(|p| p == n.as_str())) {
        let Some(block) = doc.phase(name) else {
            println!("  {:<16} {}", name, style("not started").dim());
            continue;
        };
        let duration = block
            .timestamps
            .duration_secs
            .map(|d| format!(" ({:.1}s)", d))
            .unwrap_or_default();
        println!("  {:<16} {}{}", name, status_label(block.status), duration);
        for (file_id, record) in &block.files {
            println!("    {:<20} {}", file_id, describe_file(record));
        }
    }
    println!();
    Ok(())
}

fn describe_file(record: &FileRecord) -> String {
    let mut line = status_label(record.status);
    if !record.units.is_empty() || record.expected_units.is_some() {
        let succeeded = record
            .units
            .iter()
            .filter(|u| u.status == Status::Success)
            .count();
        let total = record.expected_units.unwrap_or(record.units.len());
        line.push_str(&format!("  units {}/{}", succeeded, total));
    }
    let failed = record.failed_unit_ids();
    if !failed.is_empty() {
        line.push_str(&format!("  failed: {}", failed.join(",")));
    }
    line
}

pub fn cmd_log(cli: &Cli, project_dir: &Path, limit: usize) -> Result<()> {
    let config = PipelineConfig::new(project_dir.to_path_buf(), cli.config.clone())?;
    let store = config.open_store();
    let log = store.transaction_log();
    let entries = log.entries(Some(limit))?;

    if entries.is_empty() {
        println!("No transactions recorded in {}", log.path().display());
        return Ok(());
    }

    for entry in entries {
        let outcome = if entry.success {
            style("ok").green().to_string()
        } else {
            style("FAILED").red().to_string()
        };
        println!(
            "{}  {:<14} {:<6} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.operation,
            outcome,
            entry.detail
        );
    }
    Ok(())
}
