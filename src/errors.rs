//! Typed error hierarchy for stagehand.
//!
//! Two top-level enums cover the two subsystems:
//! - `StateError`: persisted state document, lock and backup failures
//! - `OrchestratorError`: run-level failures in the phase driver
//!
//! Unit validation failures and phase invocation failures are not errors:
//! they are outcomes recorded in the state document and recovered through
//! the fallback path.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::state::Status;

/// Errors from the state store, its lock and its backups.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State document at {path} is corrupt: {reason}{}", recommend(.recommended_backup))]
    Corruption {
        path: PathBuf,
        reason: String,
        recommended_backup: Option<PathBuf>,
    },

    #[error("Timed out after {:.1}s waiting for state lock {path}", secs(.waited))]
    LockContention { path: PathBuf, waited: Duration },

    #[error("State document {path} does not exist; run 'stagehand init' first")]
    NotInitialized { path: PathBuf },

    #[error("Mutation rejected, resulting document is invalid: {reason}")]
    InvalidDocument { reason: String },

    #[error("Backup {name} not found")]
    BackupNotFound { name: String },

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state document: {0}")]
    Serialize(#[source] serde_json::Error),
}

fn secs(waited: &Duration) -> f64 {
    waited.as_secs_f64()
}

fn recommend(backup: &Option<PathBuf>) -> String {
    match backup {
        Some(path) => format!(" (most recent backup: {})", path.display()),
        None => String::new(),
    }
}

impl StateError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the lock could not be obtained in time.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(
        "Refusing to run phase {phase} for {file_id}: dependency {dependency} is {status}, not success"
    )]
    DependencyViolation {
        phase: String,
        file_id: String,
        dependency: String,
        status: Status,
    },

    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// The underlying state error, if the run failed at the state-store level.
    pub fn as_state_error(&self) -> Option<&StateError> {
        match self {
            Self::State(err) => Some(err),
            _ => None,
        }
    }
}
