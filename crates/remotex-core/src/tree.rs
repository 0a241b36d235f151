//! Filesystem operations on a subdir tree.
//!
//! Callers validate paths with [`crate::path_guard`] first; these helpers
//! only join and touch the filesystem. Everything except [`offload`] is
//! blocking.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use remotex_state::FileRecord;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::domain::{RemotexError, Result};

/// Run blocking filesystem work off the async runtime. The outer error is
/// a failed task, the inner one the I/O result.
pub async fn offload<T, F>(f: F) -> Result<io::Result<T>>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RemotexError::internal(format!("blocking task failed: {e}")))
}

/// Join a slash-separated relative path onto `root`.
pub fn resolve(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|c| !c.is_empty())
        .fold(root.to_path_buf(), |acc, c| acc.join(c))
}

/// Atomically write `data` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, data: &[u8]) -> io::Result<FileRecord> {
    let path = resolve(root, rel);
    let parent = path.parent().unwrap_or(root);
    fs::create_dir_all(parent)?;

    // Temp file in the same directory, then rename over the target.
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;

    Ok(FileRecord::from_content(rel, data))
}

/// Read a regular file. Directories and other special files are an
/// `InvalidInput` error.
pub fn read_file(root: &Path, rel: &str) -> io::Result<Vec<u8>> {
    let path = resolve(root, rel);
    let meta = fs::symlink_metadata(&path)?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{rel} is not a regular file"),
        ));
    }
    fs::read(path)
}

/// Remove `root/rel` (recursively for directories) and then every ancestor
/// left empty, stopping below `root`.
pub fn remove_path(root: &Path, rel: &str) -> io::Result<()> {
    let path = resolve(root, rel);
    let meta = fs::symlink_metadata(&path)?;
    if meta.is_dir() {
        fs::remove_dir_all(&path)?;
    } else {
        fs::remove_file(&path)?;
    }
    prune_empty_ancestors(root, &path);
    Ok(())
}

fn prune_empty_ancestors(root: &Path, removed: &Path) {
    let mut current = removed.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // remove_dir only succeeds on empty directories
        if fs::remove_dir(dir).is_err() {
            break;
        }
        debug!(dir = %dir.display(), "pruned empty directory");
        current = dir.parent();
    }
}

/// Delete everything inside `root`, keeping `root` itself.
pub fn clear_dir(root: &Path) -> io::Result<()> {
    if !root.exists() {
        return fs::create_dir_all(root);
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
