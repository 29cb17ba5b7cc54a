//! Typed contract for the persisted state document.
//!
//! The document has one block per phase, one record per input file within a
//! phase, and one entry per retryable unit within a file record. Aggregate
//! statuses are never set independently of their children: `recompute` derives
//! them bottom-up and `validate` rejects documents where they disagree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Current schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle status shared by phase blocks, file records and units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Success,
    Partial,
    Failed,
}

impl Status {
    /// Terminal states end a phase for a file.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Partial | Self::Failed)
    }

    /// Derive an aggregate status from child statuses.
    ///
    /// Returns `None` when there are no children, in which case the parent keeps
    /// whatever status was set explicitly.
    pub fn aggregate<I>(children: I) -> Option<Status>
    where
        I: IntoIterator<Item = Status>,
    {
        let mut count = 0usize;
        let (mut running, mut success, mut partial, mut failed, mut pending) = (0, 0, 0, 0, 0);
        for status in children {
            count += 1;
            match status {
                Status::Running => running += 1,
                Status::Success => success += 1,
                Status::Partial => partial += 1,
                Status::Failed => failed += 1,
                Status::Pending => pending += 1,
            }
        }

        if count == 0 {
            return None;
        }
        let aggregate = if running > 0 {
            Status::Running
        } else if success == count {
            Status::Success
        } else if failed == count {
            Status::Failed
        } else if pending == count {
            Status::Pending
        } else if failed > 0 && success == 0 && partial == 0 {
            Status::Failed
        } else {
            Status::Partial
        };
        Some(aggregate)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Running => write!(f, "running"),
            Status::Success => write!(f, "success"),
            Status::Partial => write!(f, "partial"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let canonical = normalize_status(&lowered).unwrap_or(lowered.as_str());
        match canonical {
            "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "partial" => Ok(Status::Partial),
            "failed" => Ok(Status::Failed),
            _ => anyhow::bail!(
                "Invalid status '{}'. Valid values: pending, running, success, partial, failed",
                s
            ),
        }
    }
}

/// Legacy status strings accepted once at load time.
///
/// Older phase executables wrote free-form status strings. These aliases are
/// rewritten to their canonical form before the typed parse; anything else is
/// rejected.
pub const LEGACY_STATUS_ALIASES: &[(&str, &str)] = &[
    ("completed", "success"),
    ("complete", "success"),
    ("done", "success"),
    ("ok", "success"),
    ("in_progress", "running"),
    ("processing", "running"),
    ("started", "running"),
    ("error", "failed"),
    ("errored", "failed"),
    ("failure", "failed"),
    ("partial_success", "partial"),
    ("incomplete", "partial"),
    ("queued", "pending"),
    ("not_started", "pending"),
    ("waiting", "pending"),
];

/// Map a legacy alias to its canonical status string.
pub fn normalize_status(raw: &str) -> Option<&'static str> {
    let lowered = raw.trim().to_ascii_lowercase();
    LEGACY_STATUS_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, canonical)| *canonical)
}

/// Rewrite legacy `status` strings of phases, files and units in a raw
/// document in place. Metrics, validation details and unknown fields are
/// left alone.
///
/// Returns the number of values rewritten.
pub fn normalize_legacy_statuses(value: &mut Value) -> usize {
    let mut rewritten = 0;
    let Some(phases) = value.get_mut("phases").and_then(Value::as_object_mut) else {
        return 0;
    };
    for block in phases.values_mut() {
        rewritten += normalize_status_field(block);
        let Some(files) = block.get_mut("files").and_then(Value::as_object_mut) else {
            continue;
        };
        for record in files.values_mut() {
            rewritten += normalize_status_field(record);
            if let Some(units) = record.get_mut("units").and_then(Value::as_array_mut) {
                rewritten += units.iter_mut().map(normalize_status_field).sum::<usize>();
            }
        }
    }
    rewritten
}

fn normalize_status_field(object: &mut Value) -> usize {
    match object.get_mut("status") {
        Some(Value::String(s)) => match normalize_status(s) {
            Some(canonical) => {
                *s = canonical.to_string();
                1
            }
            None => 0,
        },
        _ => 0,
    }
}

/// Start/end timestamps for a phase block or file record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl Timestamps {
    /// Begin a new interval, clearing any previous end.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.start = Some(now);
        self.end = None;
        self.duration_secs = None;
    }

    /// Close the current interval.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        let start = *self.start.get_or_insert(now);
        self.end = Some(now);
        self.duration_secs = Some((now - start).num_milliseconds().max(0) as f64 / 1000.0);
    }
}

/// A recorded error with optional unit attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
}

impl ErrorEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            file_id: None,
            unit_id: None,
        }
    }

    pub fn for_unit(file_id: &str, unit_id: &str, message: impl Into<String>) -> Self {
        Self {
            file_id: Some(file_id.to_string()),
            unit_id: Some(unit_id.to_string()),
            ..Self::new(message)
        }
    }
}

/// Quality-check outcome reported by the phase executable for one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl Validation {
    pub fn passed() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            details: Value::Null,
        }
    }
}

/// The finest-grained retryable piece of work within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_used: Option<String>,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Configurations tried for this unit during the current run.
    #[serde(default)]
    pub attempts: u32,
}

impl Unit {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            status: Status::Pending,
            output_ref: None,
            engine_used: None,
            validation: Validation::default(),
            errors: Vec::new(),
            attempts: 0,
        }
    }

    /// A unit that passed validation.
    pub fn succeeded(unit_id: impl Into<String>, output_ref: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            output_ref: Some(output_ref.into()),
            validation: Validation::passed(),
            ..Self::new(unit_id)
        }
    }

    /// A unit that failed validation.
    pub fn failed(unit_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            validation: Validation::failed(reason),
            ..Self::new(unit_id)
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine_used = Some(engine.into());
        self
    }

    /// Whether the unit carries a usable output reference string.
    pub fn has_output_ref(&self) -> bool {
        self.output_ref.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    /// Validation reason, or the last error, for reporting.
    pub fn failure_reason(&self) -> String {
        self.validation
            .reason
            .clone()
            .or_else(|| self.errors.last().cloned())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Per input-document state within one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub status: Status,
    /// Digest of the upstream input this phase consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub artifact_paths: Vec<PathBuf>,
    #[serde(default)]
    pub timestamps: Timestamps,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub units: Vec<Unit>,
    /// Unit count the phase declared for this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_units: Option<usize>,
}

impl FileRecord {
    pub fn unit(&self, unit_id: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.unit_id == unit_id)
    }

    pub fn unit_mut(&mut self, unit_id: &str) -> Option<&mut Unit> {
        self.units.iter_mut().find(|u| u.unit_id == unit_id)
    }

    /// Insert or replace a unit, keeping insertion order for existing IDs.
    pub fn upsert_unit(&mut self, unit: Unit) {
        match self.unit_mut(&unit.unit_id) {
            Some(existing) => *existing = unit,
            None => self.units.push(unit),
        }
    }

    /// Status derived from units, or `None` if there are no units.
    ///
    /// An explicit `running` marker wins while a phase is in flight.
    pub fn derived_status(&self) -> Option<Status> {
        if self.status == Status::Running {
            return Some(Status::Running);
        }
        let derived = Status::aggregate(self.units.iter().map(|u| u.status))?;
        let succeeded = self
            .units
            .iter()
            .filter(|u| u.status == Status::Success)
            .count();
        match (derived, self.expected_units) {
            (Status::Success, Some(expected)) if succeeded < expected => Some(Status::Partial),
            _ => Some(derived),
        }
    }

    pub fn recompute(&mut self) {
        if let Some(status) = self.derived_status() {
            self.status = status;
        }
    }

    pub fn failed_unit_ids(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|u| u.status == Status::Failed)
            .map(|u| u.unit_id.clone())
            .collect()
    }
}

/// One block per phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseBlock {
    pub status: Status,
    #[serde(default)]
    pub timestamps: Timestamps,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
}

impl PhaseBlock {
    pub fn derived_status(&self) -> Option<Status> {
        Status::aggregate(self.files.values().map(|f| f.status))
    }

    /// Recompute file statuses and then the block status.
    pub fn recompute(&mut self) {
        for record in self.files.values_mut() {
            record.recompute();
        }
        if let Some(status) = self.derived_status() {
            self.status = status;
        }
    }
}

/// Global metadata for a pipeline run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Identity of the pipeline input (e.g. a book slug).
    pub input_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The single persisted source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub schema_version: u32,
    pub metadata: Metadata,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseBlock>,
    /// Fields written by newer builds, preserved on rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StateDocument {
    pub fn new(input_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            metadata: Metadata {
                input_id: input_id.into(),
                run_id: None,
                created_at: now,
                updated_at: now,
            },
            phases: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn phase(&self, phase: &str) -> Option<&PhaseBlock> {
        self.phases.get(phase)
    }

    pub fn file(&self, phase: &str, file_id: &str) -> Option<&FileRecord> {
        self.phases.get(phase).and_then(|p| p.files.get(file_id))
    }

    /// Get or lazily create a phase block.
    pub fn phase_mut(&mut self, phase: &str) -> &mut PhaseBlock {
        self.phases.entry(phase.to_string()).or_default()
    }

    /// Get or lazily create a file record.
    pub fn file_mut(&mut self, phase: &str, file_id: &str) -> &mut FileRecord {
        self.phase_mut(phase)
            .files
            .entry(file_id.to_string())
            .or_default()
    }

    /// Status of a file within a phase; `pending` if never recorded.
    pub fn file_status(&self, phase: &str, file_id: &str) -> Status {
        self.file(phase, file_id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    /// Recompute every aggregate status bottom-up.
    pub fn recompute(&mut self) {
        for block in self.phases.values_mut() {
            block.recompute();
        }
    }

    /// Structural validation applied on load and before every commit.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version == 0 {
            return Err("schema_version must be at least 1".to_string());
        }
        if self.schema_version > SCHEMA_VERSION {
            return Err(format!(
                "schema_version {} is newer than supported version {}",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        if self.metadata.input_id.trim().is_empty() {
            return Err("metadata.input_id must not be empty".to_string());
        }

        for (phase_name, block) in &self.phases {
            if phase_name.trim().is_empty() {
                return Err("phase names must not be empty".to_string());
            }
            for (file_id, record) in &block.files {
                validate_file(phase_name, file_id, record)?;
            }
            if let Some(derived) = block.derived_status()
                && derived != block.status
            {
                return Err(format!(
                    "phase {} status is {} but its files aggregate to {}",
                    phase_name, block.status, derived
                ));
            }
        }
        Ok(())
    }
}

fn validate_file(phase: &str, file_id: &str, record: &FileRecord) -> Result<(), String> {
    let mut seen = HashSet::new();
    for unit in &record.units {
        if unit.unit_id.trim().is_empty() {
            return Err(format!("{}/{}: unit with empty unit_id", phase, file_id));
        }
        if !seen.insert(unit.unit_id.as_str()) {
            return Err(format!(
                "{}/{}: duplicate unit_id {}",
                phase, file_id, unit.unit_id
            ));
        }
        if unit.status == Status::Success && !unit.validation.passed {
            return Err(format!(
                "{}/{}: unit {} is success but did not pass validation",
                phase, file_id, unit.unit_id
            ));
        }
        if unit.status == Status::Partial {
            return Err(format!(
                "{}/{}: unit {} cannot be partial",
                phase, file_id, unit.unit_id
            ));
        }
    }
    if let Some(derived) = record.derived_status()
        && derived != record.status
    {
        return Err(format!(
            "{}/{} status is {} but its units aggregate to {}",
            phase, file_id, record.status, derived
        ));
    }
    Ok(())
}
