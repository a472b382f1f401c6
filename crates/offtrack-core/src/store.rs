//! Atomic file store.
//!
//! JSON reads never fail: a missing or unparsable document reads as `None`.
//! JSON writes go to a uniquely named temporary file in the destination's
//! directory and are renamed over the destination, so a reader only ever sees
//! the complete old document or the complete new one.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Error, FileSystemError, Result};

/// Converts an I/O error for read operations.
pub(crate) fn read_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::ReadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for write operations.
pub(crate) fn write_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::WriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for directory creation.
pub(crate) fn create_dir_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::CreateDirFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for delete operations.
pub(crate) fn delete_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::DeleteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Existence, size and modification time of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes.
    pub len: u64,
    /// Whether this is a regular file.
    pub is_file: bool,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// Last modified time in Unix milliseconds (0 if unavailable).
    pub modified_ms: u64,
}

impl FileStat {
    /// A regular file with at least one byte.
    #[must_use]
    pub const fn is_non_empty_file(&self) -> bool {
        self.is_file && self.len > 0
    }
}

/// Current time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stat a path. `None` if it does not exist or cannot be inspected.
#[must_use]
pub fn stat(path: &Path) -> Option<FileStat> {
    let meta = fs::metadata(path).ok()?;
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as u64);
    Some(FileStat {
        len: meta.len(),
        is_file: meta.is_file(),
        is_dir: meta.is_dir(),
        modified_ms,
    })
}

/// Whether `path` is a regular file with nonzero size.
#[must_use]
pub fn is_non_empty_file(path: &Path) -> bool {
    stat(path).is_some_and(|s| s.is_non_empty_file())
}

/// Create a directory and all parents. Succeeds if it already exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| create_dir_error(path, e))
}

/// Read and parse a JSON document. `None` on any read or parse error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Could not read {}: {}", path.display(), e);
            }
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unparsable JSON at {}: {}", path.display(), e);
            None
        }
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &content)
}

/// Atomically replace `path` with `bytes`.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| write_error(path, e))?;
    tmp.write_all(bytes).map_err(|e| write_error(path, e))?;
    tmp.as_file().sync_all().map_err(|e| write_error(path, e))?;
    tmp.persist(path).map_err(|e| write_error(path, e.error))?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(delete_error(path, e)),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(delete_error(path, e)),
    }
}

/// Remove empty directories from `start` upward, never removing `stop` itself.
///
/// Stops at the first non-empty directory. `start` must be inside `stop`.
pub fn remove_empty_dirs_upward(start: &Path, stop: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        let is_empty = fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
        if !is_empty || fs::remove_dir(dir).is_err() {
            break;
        }
        debug!("Removed empty directory {}", dir.display());
        current = dir.parent();
    }
}

/// Move a file, falling back to copy + delete when rename is not possible
/// (for example across devices).
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    let move_failed = |reason: String| Error::MoveFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        reason,
    };

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| move_failed(e.to_string()))?;
    }

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(
                "Rename {} -> {} failed ({}), copying instead",
                from.display(),
                to.display(),
                rename_err
            );
            fs::copy(from, to).map_err(|e| move_failed(format!("{rename_err}; copy: {e}")))?;
            if let Err(e) = fs::remove_file(from) {
                warn!("Copied but could not remove {}: {}", from.display(), e);
            }
            Ok(())
        }
    }
}

/// List direct child directories of `dir` (empty if unreadable).
pub fn child_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Parse a directory's final component as a positive numeric id.
pub fn dir_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|id| *id > 0)
}
