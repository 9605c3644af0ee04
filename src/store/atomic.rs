//! Atomic file writes and cross-process advisory locking (§4.A).
//!
//! Every store writes through [`atomic_write`]: content goes to a `.tmp`
//! sibling first, then an atomic rename replaces the target. A `.backup`
//! copy of the previous contents is kept alongside, best-effort, so
//! [`read_with_recovery`] has somewhere to fall back to if the primary
//! file is ever found corrupted.

use crate::error::{RasenError, RasenResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".backup");
    path.with_file_name(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `content` to `path` atomically, keeping a best-effort `.backup`
/// of whatever was there before.
pub fn atomic_write(path: &Path, content: &str) -> RasenResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if path.exists() {
        let _ = fs::copy(path, backup_path(path));
    }

    let tmp = tmp_path(path);
    let write_result = fs::write(&tmp, content);
    if write_result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    write_result?;

    fs::rename(&tmp, path)
        .map_err(|e| RasenError::storage(path, format!("atomic rename failed: {e}")))
}

/// Reads `path`, falling back to its `.backup` sibling if the primary file
/// is missing or fails to parse. Returns `None` if neither is usable.
pub fn read_with_recovery(path: &Path) -> Option<String> {
    if let Ok(content) = fs::read_to_string(path) {
        return Some(content);
    }
    let backup = backup_path(path);
    fs::read_to_string(backup).ok()
}

/// An exclusive advisory lock held for the lifetime of the guard, backed by
/// an empty sentinel file beside `path` (the data file itself is never
/// opened under the lock, matching the write-via-temp-file-plus-rename
/// pattern above).
pub struct FileLock {
    _file: File,
}

impl FileLock {
    pub fn acquire_exclusive(path: &Path) -> RasenResult<Self> {
        let lock_path = lock_sentinel(path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| RasenError::lock(&lock_path, e.to_string()))?;
        file.lock_exclusive()
            .map_err(|e| RasenError::lock(&lock_path, e.to_string()))?;
        Ok(Self { _file: file })
    }

    pub fn acquire_shared(path: &Path) -> RasenResult<Self> {
        let lock_path = lock_sentinel(path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| RasenError::lock(&lock_path, e.to_string()))?;
        file.lock_shared()
            .map_err(|e| RasenError::lock(&lock_path, e.to_string()))?;
        Ok(Self { _file: file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self._file);
    }
}

fn lock_sentinel(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}
