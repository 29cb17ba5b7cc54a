//! Durable all-or-nothing file replacement.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::StateError;

/// Points at which a write can be interrupted in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) enum FaultPoint {
    /// Temp file partially written, process dies.
    MidTempWrite,
    /// Temp file complete and synced, process dies before rename.
    BeforeRename,
    /// Rename done, directory fsync fails.
    DirSync,
}

/// Temporary sibling path used while replacing `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(target.file_name().unwrap_or_default());
    name.push(format!(".tmp.{}", std::process::id()));
    target.with_file_name(name)
}

/// Replace `target` with `bytes` so readers see either the old or new file.
///
/// Writes a temp file in the same directory, fsyncs it, renames it over the
/// target and fsyncs the directory. Once the rename succeeds the new file is
/// in place, so a failed directory fsync is logged, not returned.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StateError> {
    write_atomic_inner(target, bytes, None)
}

#[cfg(test)]
pub(crate) fn write_atomic_with_fault(
    target: &Path,
    bytes: &[u8],
    fault: FaultPoint,
) -> Result<(), StateError> {
    write_atomic_inner(target, bytes, Some(fault))
}

pub(crate) fn write_atomic_inner(
    target: &Path,
    bytes: &[u8],
    fault: Option<FaultPoint>,
) -> Result<(), StateError> {
    let tmp = temp_path_for(target);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| StateError::io(format!("Failed to create {}", tmp.display()), e))?;

        if fault == Some(FaultPoint::MidTempWrite) {
            let half = &bytes[..bytes.len() / 2];
            let _ = file.write_all(half);
            return Err(StateError::Aborted("injected fault mid temp write".into()));
        }

        file.write_all(bytes)
            .map_err(|e| StateError::io(format!("Failed to write {}", tmp.display()), e))?;
        file.sync_all()
            .map_err(|e| StateError::io(format!("Failed to sync {}", tmp.display()), e))?;
    }

    if fault == Some(FaultPoint::BeforeRename) {
        return Err(StateError::Aborted("injected fault before rename".into()));
    }

    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(StateError::io(
            format!("Failed to rename {} over {}", tmp.display(), target.display()),
            e,
        ));
    }

    let synced = if fault == Some(FaultPoint::DirSync) {
        Err(StateError::Aborted("injected fault syncing directory".into()))
    } else {
        sync_parent_dir(target)
    };
    if let Err(err) = synced {
        tracing::warn!(
            path = %target.display(),
            error = %err,
            "file replaced but directory fsync failed; rename may not survive power loss"
        );
    }
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(target: &Path) -> Result<(), StateError> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| StateError::io(format!("Failed to sync directory {}", parent.display()), e))
}

#[cfg(not(unix))]
fn sync_parent_dir(_target: &Path) -> Result<(), StateError> {
    Ok(())
}

/// Remove temp files left behind by an interrupted write.
pub fn remove_stale_temp_files(target: &Path) -> usize {
    let (Some(dir), Some(name)) = (target.parent(), target.file_name()) else {
        return 0;
    };
    let prefix = format!(".{}.tmp.", name.to_string_lossy());
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .filter(|e| fs::remove_file(e.path()).is_ok())
        .count()
}
