//! Append-only transaction log kept beside the state document.
//!
//! Each commit attempt appends one JSON line, whether or not the document
//! write succeeded. The log is never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::StateError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub success: bool,
    #[serde(default)]
    pub detail: String,
}

impl TransactionLogEntry {
    pub fn new(operation: &str, success: bool, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            success,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionLog {
    path: PathBuf,
}

impl TransactionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &TransactionLogEntry) -> Result<(), StateError> {
        let mut line = serde_json::to_string(entry).map_err(StateError::Serialize)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| {
                StateError::io(
                    format!("Failed to append transaction log {}", self.path.display()),
                    e,
                )
            })
    }

    /// Most recent entries last; skips lines that fail to parse.
    pub fn entries(&self, limit: Option<usize>) -> Result<Vec<TransactionLogEntry>, StateError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            StateError::io(
                format!("Failed to read transaction log {}", self.path.display()),
                e,
            )
        })?;
        let entries: Vec<TransactionLogEntry> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
        Ok(entries.into_iter().skip(skip).collect())
    }
}
