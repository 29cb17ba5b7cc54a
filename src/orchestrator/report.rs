//! Run report: what happened to every requested phase for every file.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::Status;

/// Why a unit ended the run failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub unit_id: String,
    /// Validation reason, or `invocation_failed: …`
    pub reason: String,
    /// Engine configurations tried, in order
    pub engines: Vec<String>,
}

/// What the orchestrator did with one phase for one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    /// Previous result reused.
    Skipped { reason: String },
    /// Invoked; `status` is the committed file status.
    Ran {
        status: Status,
        retried_units: Vec<String>,
        failures: Vec<UnitFailure>,
    },
    /// A dependency had not succeeded for this file.
    Blocked { dependency: String, status: Status },
    /// Not attempted because the run was aborted.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseFileOutcome {
    pub phase: String,
    pub file_id: String,
    #[serde(flatten)]
    pub disposition: Disposition,
}

impl PhaseFileOutcome {
    pub fn status(&self) -> Option<Status> {
        match &self.disposition {
            Disposition::Ran { status, .. } => Some(*status),
            Disposition::Skipped { .. } => Some(Status::Success),
            _ => None,
        }
    }

    /// Outcomes that should turn the exit code non-zero.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.disposition,
            Disposition::Ran {
                status: Status::Failed,
                ..
            } | Disposition::Blocked { .. }
        )
    }
}

/// Summary of one `stagehand run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when a required phase failed and the remaining work was stopped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub outcomes: Vec<PhaseFileOutcome>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            started_at: now,
            finished_at: now,
            aborted: None,
            outcomes: Vec::new(),
        }
    }

    /// Overall status across every outcome that produced one.
    pub fn overall_status(&self) -> Status {
        if self.aborted.is_some() || self.outcomes.iter().any(|o| o.is_failure()) {
            return Status::Failed;
        }
        Status::aggregate(self.outcomes.iter().filter_map(|o| o.status())).unwrap_or(Status::Success)
    }

    /// 0 for success or partial, 1 when anything failed or the run aborted.
    ///
    /// State-store fatal errors never produce a report; the CLI maps them to 2.
    pub fn exit_code(&self) -> i32 {
        match self.overall_status() {
            Status::Failed => 1,
            _ => 0,
        }
    }

    pub fn count(&self, pred: impl Fn(&PhaseFileOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }

    /// Every permanently failed unit, with its phase and file.
    pub fn unit_failures(&self) -> Vec<(&str, &str, &UnitFailure)> {
        self.outcomes
            .iter()
            .flat_map(|o| match &o.disposition {
                Disposition::Ran { failures, .. } => failures
                    .iter()
                    .map(|f| (o.phase.as_str(), o.file_id.as_str(), f))
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Human-readable summary.
    pub fn render(&self) -> String {
        use console::style;
        use std::fmt::Write;

        let mut out = String::new();
        let overall = self.overall_status();
        let label = match overall {
            Status::Success => style(overall.to_string()).green().bold(),
            Status::Partial => style(overall.to_string()).yellow().bold(),
            _ => style(overall.to_string()).red().bold(),
        };
        let _ = writeln!(out, "Run {} finished: {}", style(&self.run_id).dim(), label);

        for outcome in &self.outcomes {
            let line = match &outcome.disposition {
                Disposition::Skipped { reason } => {
                    format!("{} ({})", style("skipped").dim(), reason)
                }
                Disposition::Ran {
                    status,
                    retried_units,
                    ..
                } if retried_units.is_empty() => status_label(*status),
                Disposition::Ran {
                    status,
                    retried_units,
                    ..
                } => format!(
                    "{} (retried units: {})",
                    status_label(*status),
                    retried_units.join(", ")
                ),
                Disposition::Blocked { dependency, status } => format!(
                    "{} ({} is {})",
                    style("blocked").red(),
                    dependency,
                    status
                ),
                Disposition::Stopped => style("stopped").dim().to_string(),
            };
            let _ = writeln!(out, "  {:<16} {:<20} {}", outcome.phase, outcome.file_id, line);
        }

        let failures = self.unit_failures();
        if !failures.is_empty() {
            let _ = writeln!(out, "\n{}", style("Failed units:").red().bold());
            for (phase, file_id, failure) in failures {
                let _ = writeln!(
                    out,
                    "  {}/{} unit {}: {} [{}]",
                    phase,
                    file_id,
                    failure.unit_id,
                    failure.reason,
                    failure.engines.join(" -> ")
                );
            }
        }

        if let Some(reason) = &self.aborted {
            let _ = writeln!(out, "\n{} {}", style("Aborted:").red().bold(), reason);
        }
        out
    }
}

/// Status text colored for terminals.
pub fn status_label(status: Status) -> String {
    match status {
        Status::Success => console::style(status.to_string()).green().to_string(),
        Status::Partial => console::style(status.to_string()).yellow().to_string(),
        Status::Failed => console::style(status.to_string()).red().to_string(),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ran(phase: &str, status: Status, failures: Vec<UnitFailure>) -> PhaseFileOutcome {
        PhaseFileOutcome {
            phase: phase.into(),
            file_id: "ch1".into(),
            disposition: Disposition::Ran {
                status,
                retried_units: Vec::new(),
                failures,
            },
        }
    }

    #[test]
    fn partial_exits_zero_and_lists_failures() {
        let mut report = RunReport::new("r1");
        report.outcomes.push(ran("chunk", Status::Success, vec![]));
        report.outcomes.push(ran(
            "synthesize",
            Status::Partial,
            vec![UnitFailure {
                unit_id: "2".into(),
                reason: "duration_mismatch".into(),
                engines: vec!["xtts:cloned:narrator.wav".into(), "kokoro:af_bella".into()],
            }],
        ));

        assert_eq!(report.overall_status(), Status::Partial);
        assert_eq!(report.exit_code(), 0);
        let text = console::strip_ansi_codes(&report.render()).to_string();
        assert!(text.contains("unit 2: duration_mismatch"));
        assert!(text.contains("xtts:cloned:narrator.wav -> kokoro:af_bella"));
    }

    #[test]
    fn failed_or_blocked_or_aborted_exits_one() {
        let mut report = RunReport::new("r1");
        report.outcomes.push(ran("chunk", Status::Failed, vec![]));
        assert_eq!(report.exit_code(), 1);

        let mut report = RunReport::new("r2");
        report.outcomes.push(PhaseFileOutcome {
            phase: "synthesize".into(),
            file_id: "ch1".into(),
            disposition: Disposition::Blocked {
                dependency: "chunk".into(),
                status: Status::Pending,
            },
        });
        assert_eq!(report.exit_code(), 1);

        let mut report = RunReport::new("r3");
        report.aborted = Some("chunk failed for ch1".into());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn skips_count_as_success() {
        let mut report = RunReport::new("r1");
        report.outcomes.push(PhaseFileOutcome {
            phase: "chunk".into(),
            file_id: "ch1".into(),
            disposition: Disposition::Skipped {
                reason: "up to date".into(),
            },
        });
        assert_eq!(report.overall_status(), Status::Success);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn serializes_with_kind_tag() {
        let mut report = RunReport::new("r1");
        report.outcomes.push(ran("chunk", Status::Success, vec![]));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcomes"][0]["kind"], "ran");
        assert_eq!(json["outcomes"][0]["status"], "success");
    }
}
