//! The state store: the only component that touches the persisted document.
//!
//! Every mutation goes through [`StateStore::transaction`], which follows a
//! fixed protocol:
//!
//! 1. acquire the cross-process lock (bounded timeout)
//! 2. read the current on-disk document
//! 3. write a backup copy
//! 4. apply the mutation to an in-memory copy and recompute aggregates
//! 5. validate the result
//! 6. write a temp file in the same directory
//! 7. fsync it
//! 8. rename it over the document
//! 9. append a transaction-log entry
//! 10. release the lock
//! 11. rotate backups
//!
//! A failed validation aborts before step 6, so the on-disk document is only
//! ever the old or the new complete version.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::atomic::{self, FaultPoint};
use super::backup::{BackupManager, BackupRef};
use super::lock::FileLock;
use super::schema::{self, FileRecord, StateDocument, Unit};
use super::txlog::{TransactionLog, TransactionLogEntry};
use crate::errors::StateError;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKUP_RETENTION: usize = 20;

/// Tunables for a [`StateStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub lock_timeout: Duration,
    pub backup_retention: usize,
    /// Defaults to `<state dir>/backups`.
    pub backup_dir: Option<PathBuf>,
    /// Defaults to `<state dir>/<stem>.transactions.jsonl`.
    pub log_path: Option<PathBuf>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            backup_dir: None,
            log_path: None,
        }
    }
}

impl StoreOptions {
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_backup_retention(mut self, retention: usize) -> Self {
        self.backup_retention = retention;
        self
    }
}

/// Handle to one persisted state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock: FileLock,
    backups: BackupManager,
    txlog: TransactionLog,
    lock_timeout: Duration,
    fault: Option<FaultPoint>,
}

/// Mutable view of the document for the duration of one transaction.
pub struct Transaction<'a> {
    doc: &'a mut StateDocument,
    now: DateTime<Utc>,
}

impl Deref for Transaction<'_> {
    type Target = StateDocument;

    fn deref(&self) -> &Self::Target {
        self.doc
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.doc
    }
}

impl Transaction<'_> {
    /// Commit time shared by every mutation in this transaction.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Record a unit result, creating the phase block and file record lazily.
    ///
    /// The attempt counter and earlier errors of a re-reported unit carry over.
    pub fn record_unit(&mut self, phase: &str, file_id: &str, mut unit: Unit) {
        let record = self.doc.file_mut(phase, file_id);
        if let Some(previous) = record.unit(&unit.unit_id) {
            unit.attempts = previous.attempts;
            let mut errors = previous.errors.clone();
            errors.append(&mut unit.errors);
            unit.errors = errors;
        }
        record.upsert_unit(unit);
    }

    /// Put back every unit outside `scope` as it was in `snapshot`.
    ///
    /// Returns the IDs that had to be restored.
    pub fn restore_out_of_scope(
        &mut self,
        phase: &str,
        file_id: &str,
        snapshot: &FileRecord,
        scope: &[String],
    ) -> Vec<String> {
        let record = self.doc.file_mut(phase, file_id);
        let mut restored = Vec::new();
        for original in snapshot.units.iter().filter(|u| !scope.contains(&u.unit_id)) {
            if record.unit(&original.unit_id) != Some(original) {
                record.upsert_unit(original.clone());
                restored.push(original.unit_id.clone());
            }
        }
        restored
    }
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>, options: StoreOptions) -> Self {
        let path = path.into();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string());

        let backup_dir = options.backup_dir.unwrap_or_else(|| dir.join("backups"));
        let log_path = options
            .log_path
            .unwrap_or_else(|| dir.join(format!("{}.transactions.jsonl", stem)));

        Self {
            lock: FileLock::for_document(&path),
            backups: BackupManager::new(backup_dir, stem, options.backup_retention),
            txlog: TransactionLog::new(log_path),
            lock_timeout: options.lock_timeout,
            fault: None,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn transaction_log(&self) -> &TransactionLog {
        &self.txlog
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, fault: Option<FaultPoint>) {
        self.fault = fault;
    }

    /// Create the document if it does not exist yet; return the current one.
    pub fn initialize(&self, input_id: &str) -> Result<StateDocument, StateError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| StateError::io("Failed to create state directory", e))?;
        }

        let guard = self.lock.acquire(self.lock_timeout)?;
        let cleaned = atomic::remove_stale_temp_files(&self.path);
        if cleaned > 0 {
            tracing::warn!(cleaned, "removed temp files from an interrupted write");
        }

        let result = if self.path.exists() {
            self.read_unlocked()
        } else {
            let doc = StateDocument::new(input_id);
            doc.validate()
                .map_err(|reason| StateError::InvalidDocument { reason })?;
            let bytes = serde_json::to_vec_pretty(&doc).map_err(StateError::Serialize)?;
            let written = atomic::write_atomic_inner(&self.path, &bytes, self.fault);
            self.log_attempt("init", &written, format!("input_id={}", input_id));
            written.map(|_| doc)
        };
        guard.release()?;
        result
    }

    /// Read and validate the current document.
    ///
    /// The rename in the write protocol is atomic, so readers never need the lock.
    pub fn read(&self) -> Result<StateDocument, StateError> {
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> Result<StateDocument, StateError> {
        let bytes = self.read_bytes()?;
        self.parse(&bytes, &self.path)
    }

    fn read_bytes(&self) -> Result<Vec<u8>, StateError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StateError::NotInitialized {
                path: self.path.clone(),
            }),
            Err(e) => Err(StateError::io(
                format!("Failed to read {}", self.path.display()),
                e,
            )),
        }
    }

    /// Parse raw bytes, applying the legacy status aliases once.
    fn parse(&self, bytes: &[u8], origin: &Path) -> Result<StateDocument, StateError> {
        let corrupt = |reason: String| StateError::Corruption {
            path: origin.to_path_buf(),
            reason,
            recommended_backup: self.latest_valid_backup().map(|b| b.path),
        };

        let mut raw: Value =
            serde_json::from_slice(bytes).map_err(|e| corrupt(format!("invalid JSON: {}", e)))?;
        let rewritten = schema::normalize_legacy_statuses(&mut raw);
        if rewritten > 0 {
            tracing::debug!(rewritten, "normalized legacy status strings");
        }
        let doc: StateDocument =
            serde_json::from_value(raw).map_err(|e| corrupt(e.to_string()))?;
        doc.validate().map_err(corrupt)?;
        Ok(doc)
    }

    /// Run `mutate` as one atomic transaction.
    ///
    /// If `mutate` returns an error nothing is written. The closure may be
    /// handed a document that another process committed a moment earlier;
    /// it must derive everything it needs from the transaction view.
    pub fn transaction<T, F>(&self, operation: &str, mutate: F) -> Result<T, StateError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, StateError>,
    {
        let guard = match self.lock.acquire(self.lock_timeout) {
            Ok(guard) => guard,
            Err(err) => {
                self.append_log(TransactionLogEntry::new(operation, false, err.to_string()));
                return Err(err);
            }
        };

        let result = self.commit_locked(operation, mutate);
        let detail = match &result {
            Ok((_, backup, run_id)) => {
                let mut parts = Vec::new();
                if let Some(b) = backup {
                    parts.push(format!("backup={}", b.name));
                }
                if let Some(id) = run_id {
                    parts.push(format!("run_id={}", id));
                }
                parts.join(" ")
            }
            Err(_) => String::new(),
        };
        self.log_attempt(operation, &result, detail);
        guard.release()?;

        let (value, _, _) = result?;
        if let Err(err) = self.backups.rotate() {
            tracing::warn!(error = %err, "backup rotation failed");
        }
        Ok(value)
    }

    fn commit_locked<T, F>(
        &self,
        operation: &str,
        mutate: F,
    ) -> Result<(T, Option<BackupRef>, Option<String>), StateError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, StateError>,
    {
        let bytes = self.read_bytes()?;
        let current = self.parse(&bytes, &self.path)?;
        let backup = self.backups.write(&bytes)?;

        let mut working = current;
        let now = Utc::now();
        let value = {
            let mut txn = Transaction {
                doc: &mut working,
                now,
            };
            mutate(&mut txn)?
        };
        working.recompute();
        working.metadata.updated_at = now;

        working.validate().map_err(|reason| {
            tracing::warn!(operation, %reason, "rejected invalid mutation");
            StateError::InvalidDocument { reason }
        })?;

        let new_bytes = serde_json::to_vec_pretty(&working).map_err(StateError::Serialize)?;
        atomic::write_atomic_inner(&self.path, &new_bytes, self.fault)?;
        tracing::debug!(operation, bytes = new_bytes.len(), "state committed");
        Ok((value, Some(backup), working.metadata.run_id))
    }

    fn log_attempt<T>(&self, operation: &str, result: &Result<T, StateError>, detail: String) {
        let entry = match result {
            Ok(_) => TransactionLogEntry::new(operation, true, detail),
            Err(err) => TransactionLogEntry::new(operation, false, err.to_string()),
        };
        self.append_log(entry);
    }

    fn append_log(&self, entry: TransactionLogEntry) {
        if let Err(err) = self.txlog.append(&entry) {
            tracing::warn!(error = %err, operation = %entry.operation, "failed to append transaction log");
        }
    }

    /// Backups newest first.
    pub fn list_backups(&self, limit: Option<usize>) -> Result<Vec<BackupRef>, StateError> {
        self.backups.list(limit)
    }

    pub fn find_backup(&self, name: &str) -> Result<BackupRef, StateError> {
        self.backups.find(name)
    }

    /// Newest backup that parses and validates.
    pub fn latest_valid_backup(&self) -> Option<BackupRef> {
        self.backups.list(None).ok()?.into_iter().find(|backup| {
            fs::read(&backup.path)
                .ok()
                .and_then(|bytes| {
                    let mut raw: Value = serde_json::from_slice(&bytes).ok()?;
                    schema::normalize_legacy_statuses(&mut raw);
                    serde_json::from_value::<StateDocument>(raw).ok()
                })
                .is_some_and(|doc| doc.validate().is_ok())
        })
    }

    /// Replace the document with a backup, backing up the current one first.
    pub fn restore_backup(&self, backup: &BackupRef) -> Result<StateDocument, StateError> {
        let guard = self.lock.acquire(self.lock_timeout)?;
        let result = self.restore_locked(backup);
        self.log_attempt("restore", &result, format!("from={}", backup.name));
        guard.release()?;
        if result.is_ok()
            && let Err(err) = self.backups.rotate()
        {
            tracing::warn!(error = %err, "backup rotation failed");
        }
        result
    }

    fn restore_locked(&self, backup: &BackupRef) -> Result<StateDocument, StateError> {
        let bytes = fs::read(&backup.path).map_err(|e| {
            StateError::io(format!("Failed to read backup {}", backup.path.display()), e)
        })?;
        let doc = self.parse(&bytes, &backup.path)?;
        if let Ok(current) = fs::read(&self.path) {
            self.backups.write(&current)?;
        }
        atomic::write_atomic_inner(&self.path, &bytes, self.fault)?;
        Ok(doc)
    }
}
