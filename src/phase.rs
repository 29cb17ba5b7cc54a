//! Phase definitions and dependency ordering.
//!
//! This module provides:
//! - `PhaseDefinition`, one external executable stage of the pipeline
//! - `PhasePlan`, the validated phase list in dependency order

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::errors::OrchestratorError;
use crate::fallback::{ContentCategory, EngineConfig};

fn default_required() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_unit_timeout_secs() -> u64 {
    600
}

/// A single pipeline phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    /// Unique phase name, also the key of its block in the state document
    pub name: String,
    /// Shell command run once per file (and once per unit on retry)
    pub command: String,
    /// Phases that must succeed for a file before this one runs
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// A failed required phase aborts the run
    #[serde(default = "default_required")]
    pub required: bool,
    /// Deadline for a whole-file invocation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Deadline for a single-unit retry invocation
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
    /// Units the phase produces per file, when known up front
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_units: Option<usize>,
    #[serde(default)]
    pub content_category: ContentCategory,
    /// Cap on this phase's worker pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// Primary engine configuration; phases without one never fall back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,
}

impl PhaseDefinition {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            depends_on: Vec::new(),
            required: default_required(),
            timeout_secs: default_timeout_secs(),
            unit_timeout_secs: default_unit_timeout_secs(),
            expected_units: None,
            content_category: ContentCategory::default(),
            max_workers: None,
            engine: None,
        }
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_expected_units(mut self, count: usize) -> Self {
        self.expected_units = Some(count);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }
}

/// Validated phases in dependency order.
///
/// Ties are broken by declaration order, so the plan is deterministic.
#[derive(Debug, Clone, Default)]
pub struct PhasePlan {
    phases: Vec<PhaseDefinition>,
}

impl PhasePlan {
    pub fn build(definitions: Vec<PhaseDefinition>) -> Result<Self, OrchestratorError> {
        let mut index_map = HashMap::new();
        for (i, phase) in definitions.iter().enumerate() {
            if phase.name.trim().is_empty() {
                return Err(OrchestratorError::Config("phase with empty name".into()));
            }
            if phase.command.trim().is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "phase '{}' has no command",
                    phase.name
                )));
            }
            if let Some(engine) = &phase.engine {
                engine.validate().map_err(|e| {
                    OrchestratorError::Config(format!("phase '{}': {}", phase.name, e))
                })?;
            }
            if index_map.insert(phase.name.as_str(), i).is_some() {
                return Err(OrchestratorError::Config(format!(
                    "duplicate phase name: {}",
                    phase.name
                )));
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
        let mut in_degree = vec![0usize; definitions.len()];
        for (to_idx, phase) in definitions.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx = *index_map.get(dep.as_str()).ok_or_else(|| {
                    OrchestratorError::Config(format!(
                        "unknown dependency '{}' in phase '{}'",
                        dep, phase.name
                    ))
                })?;
                dependents[from_idx].push(to_idx);
                in_degree[to_idx] += 1;
            }
        }

        // Kahn's algorithm, always taking the earliest declared ready phase.
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(definitions.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in &dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != definitions.len() {
            let cycle: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| definitions[i].name.as_str())
                .collect();
            return Err(OrchestratorError::Config(format!(
                "cycle detected in phase dependencies: {:?}",
                cycle
            )));
        }

        let mut slots: Vec<Option<PhaseDefinition>> = definitions.into_iter().map(Some).collect();
        let phases = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Requested phases in dependency order; an empty request selects all.
    pub fn select(&self, requested: &[String]) -> Result<Vec<&PhaseDefinition>, OrchestratorError> {
        if let Some(unknown) = requested.iter().find(|r| self.get(r).is_none()) {
            return Err(OrchestratorError::UnknownPhase(unknown.clone()));
        }
        Ok(self
            .phases
            .iter()
            .filter(|p| requested.is_empty() || requested.contains(&p.name))
            .collect())
    }
}
