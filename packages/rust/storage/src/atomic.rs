//! Write-temp-then-rename file replacement with an optional `.backup` copy.
//!
//! Sequence: write `.<name>.tmp`, copy the current target to `<name>.backup`,
//! rename the temp file onto the target. Only the rename is assumed atomic.
//! If the rename fails and the target went missing, the backup is restored.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use plancrawl_shared::{PlanCrawlError, Result};
use tracing::{debug, warn};

use crate::paths::{backup_path, temp_path};

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &[u8], keep_backup: bool) -> Result<()> {
    let temp = stage(path, contents, keep_backup)?;
    commit(&temp, path)
}

/// Steps before the rename: temp file written and synced, backup refreshed.
pub(crate) fn stage(path: &Path, contents: &[u8], keep_backup: bool) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PlanCrawlError::io(parent, e))?;
    }

    let temp = temp_path(path);
    let mut file = File::create(&temp).map_err(|e| PlanCrawlError::io(&temp, e))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|e| PlanCrawlError::io(&temp, e))?;
    drop(file);

    if keep_backup && path.exists() {
        let backup = backup_path(path);
        std::fs::copy(path, &backup).map_err(|e| PlanCrawlError::io(&backup, e))?;
    }

    Ok(temp)
}

/// The rename. On failure the temp file is removed and the backup restored
/// if the target no longer exists.
pub(crate) fn commit(temp: &Path, path: &Path) -> Result<()> {
    match std::fs::rename(temp, path) {
        Ok(()) => {
            debug!(path = %path.display(), "replaced file");
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(temp);
            if let Err(restore) = restore_backup_if_missing(path) {
                warn!(path = %path.display(), error = %restore, "backup restore failed");
            }
            Err(PlanCrawlError::io(path, e))
        }
    }
}

/// Copy `<path>.backup` back to `path` when `path` is missing.
/// Returns whether a restore happened.
pub fn restore_backup_if_missing(path: &Path) -> Result<bool> {
    let backup = backup_path(path);
    if path.exists() || !backup.exists() {
        return Ok(false);
    }
    std::fs::copy(&backup, path).map_err(|e| PlanCrawlError::io(path, e))?;
    warn!(path = %path.display(), "target missing, restored from backup");
    Ok(true)
}

/// Remove a temp file left behind by an interrupted write.
pub fn discard_stale_temp(path: &Path) -> bool {
    let temp = temp_path(path);
    if temp.exists() && std::fs::remove_file(&temp).is_ok() {
        debug!(temp = %temp.display(), "removed stale temp file");
        return true;
    }
    false
}
