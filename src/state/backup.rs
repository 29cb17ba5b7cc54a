//! Timestamped pre-write copies of the state document.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

use crate::errors::StateError;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Reference to one backup file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRef {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// Writes, lists and rotates backups in a dedicated directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    stem: String,
    retention: usize,
}

impl BackupManager {
    /// `stem` prefixes every backup name (the document's file stem).
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            retention: retention.max(1),
        }
    }

    /// Write an immutable copy of `bytes`.
    pub fn write(&self, bytes: &[u8]) -> Result<BackupRef, StateError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            StateError::io(format!("Failed to create backup dir {}", self.dir.display()), e)
        })?;

        let created_at = Utc::now();
        let stamp = created_at.format(TIMESTAMP_FORMAT).to_string();
        let mut name = format!("{}.{}.json", self.stem, stamp);
        let mut seq = 1;
        while self.dir.join(&name).exists() {
            name = format!("{}.{}-{}.json", self.stem, stamp, seq);
            seq += 1;
        }
        let path = self.dir.join(&name);
        fs::write(&path, bytes)
            .map_err(|e| StateError::io(format!("Failed to write backup {}", path.display()), e))?;

        Ok(BackupRef {
            name,
            path,
            created_at,
            size: bytes.len() as u64,
        })
    }

    /// Backups newest first, at most `limit` entries.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<BackupRef>, StateError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            StateError::io(format!("Failed to read backup dir {}", self.dir.display()), e)
        })?;

        let prefix = format!("{}.", self.stem);
        let mut backups: Vec<BackupRef> = entries
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let stamp = name.strip_prefix(&prefix)?.strip_suffix(".json")?;
                let created_at = parse_stamp(stamp)?;
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                Some(BackupRef {
                    path: entry.path(),
                    name,
                    created_at,
                    size,
                })
            })
            .collect();

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
        if let Some(limit) = limit {
            backups.truncate(limit);
        }
        Ok(backups)
    }

    pub fn find(&self, name: &str) -> Result<BackupRef, StateError> {
        self.list(None)?
            .into_iter()
            .find(|b| b.name == name)
            .ok_or_else(|| StateError::BackupNotFound {
                name: name.to_string(),
            })
    }

    /// Delete the oldest backups beyond the retention count.
    pub fn rotate(&self) -> Result<usize, StateError> {
        let backups = self.list(None)?;
        let mut removed = 0;
        for stale in backups.iter().skip(self.retention) {
            fs::remove_file(&stale.path).map_err(|e| {
                StateError::io(format!("Failed to remove backup {}", stale.path.display()), e)
            })?;
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!(removed, retention = self.retention, "rotated state backups");
        }
        Ok(removed)
    }
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    let base = stamp.split('-').next()?;
    NaiveDateTime::parse_from_str(base, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
