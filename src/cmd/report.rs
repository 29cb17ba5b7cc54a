//! Result reporting from phase executables — `stagehand report`.
//!
//! Both subcommands run one state-store transaction, so a script reporting
//! its units gets the same locking and validation as the orchestrator.

use anyhow::{Context, Result, bail};
use serde_json::Value;

use stagehand::pipeline_config::store_options_from_env;
use stagehand::state::{ErrorEntry, StateStore, Unit};

use crate::{ReportCommands, ReportTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UnitOutcome {
    Success,
    Failed,
}

pub fn cmd_report(command: &ReportCommands) -> Result<()> {
    match command {
        ReportCommands::Unit {
            target,
            unit_id,
            status,
            output,
            engine,
            reason,
            details,
        } => {
            let details = details
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .context("--details must be valid JSON")?;
            let unit = build_unit(
                unit_id,
                *status,
                output.as_deref(),
                engine.as_deref(),
                reason.as_deref(),
                details,
            )?;
            let store = open(target);
            store.transaction("report_unit", |txn| {
                txn.record_unit(&target.phase, &target.file_id, unit);
                Ok(())
            })?;
            tracing::debug!(
                phase = %target.phase,
                file_id = %target.file_id,
                unit_id = %unit_id,
                status = ?status,
                "unit reported"
            );
        }
        ReportCommands::File {
            target,
            artifacts,
            expected_units,
            metrics,
            error,
        } => {
            let metrics = metrics
                .iter()
                .map(|m| parse_metric(m))
                .collect::<Result<Vec<_>>>()?;
            let store = open(target);
            store.transaction("report_file", |txn| {
                let record = txn.file_mut(&target.phase, &target.file_id);
                for artifact in artifacts {
                    if !record.artifact_paths.contains(artifact) {
                        record.artifact_paths.push(artifact.clone());
                    }
                }
                if expected_units.is_some() {
                    record.expected_units = *expected_units;
                }
                for (key, value) in metrics {
                    record.metrics.insert(key, value);
                }
                if let Some(message) = error {
                    record.errors.push(ErrorEntry {
                        file_id: Some(target.file_id.clone()),
                        ..ErrorEntry::new(message.clone())
                    });
                }
                Ok(())
            })?;
        }
    }
    Ok(())
}

fn open(target: &ReportTarget) -> StateStore {
    StateStore::open(&target.state_file, store_options_from_env())
}

fn build_unit(
    unit_id: &str,
    status: UnitOutcome,
    output: Option<&str>,
    engine: Option<&str>,
    reason: Option<&str>,
    details: Option<Value>,
) -> Result<Unit> {
    let mut unit = match status {
        UnitOutcome::Success => {
            let Some(output) = output else {
                bail!("--output is required when reporting a successful unit");
            };
            Unit::succeeded(unit_id, output)
        }
        UnitOutcome::Failed => {
            let mut unit = Unit::failed(unit_id, reason.unwrap_or("unspecified"));
            unit.output_ref = output.map(String::from);
            unit
        }
    };
    if let Some(engine) = engine.filter(|e| !e.is_empty()) {
        unit = unit.with_engine(engine);
    }
    if let Some(details) = details {
        unit.validation.details = details;
    }
    Ok(unit)
}

/// `key=value`; the value is JSON when it parses, a string otherwise.
fn parse_metric(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("metric '{}' must be key=value", raw);
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}
