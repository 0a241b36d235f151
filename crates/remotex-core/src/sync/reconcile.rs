use std::path::{Path, PathBuf};

use remotex_state::{ContentDigest, Subdir};
use tracing::{debug, info, instrument, warn};

use super::remote::RemoteEndpoint;
use crate::domain::{RemotexError, Result};
use crate::manifest::{diff, scan_manifest, DiffResult, ScanReport, SkippedFile};
use crate::path_guard::validate_relative_path;
use crate::tree::{self, offload};

/// What one push or pull changed.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub subdir: Subdir,
    pub diff: DiffResult,
    /// Local files the scan could not read
    pub skipped: Vec<SkippedFile>,
}

async fn scan_local(root: PathBuf) -> Result<ScanReport> {
    tokio::task::spawn_blocking(move || scan_manifest(&root))
        .await
        .map_err(|e| RemotexError::internal(format!("scan task failed: {e}")))?
}

/// Make the remote subdir match the local one.
///
/// Deletes what the remote has and the local side lacks, then uploads what
/// is new or changed locally. Unchanged files are not transferred.
#[instrument(skip(remote))]
pub async fn push(
    local_root: &Path,
    subdir: Subdir,
    remote: &dyn RemoteEndpoint,
) -> Result<SyncReport> {
    let local_dir = local_root.join(subdir.as_str());
    let remote_files = remote.list_files(subdir).await?;
    let local = scan_local(local_dir.clone()).await?;
    let delta = diff(&remote_files, &local.manifest);

    for file in &delta.removed {
        validate_relative_path(&file.path)?;
        debug!(path = %file.path, "deleting remote file");
        remote.delete(subdir, &file.path).await?;
    }

    for file in &delta.added {
        validate_relative_path(&file.path)?;
        let root = local_dir.clone();
        let rel = file.path.clone();
        let data = offload(move || tree::read_file(&root, &rel)).await??;
        debug!(path = %file.path, size = data.len(), "uploading file");
        remote.upload(subdir, &file.path, data).await?;
    }

    info!(
        added = delta.added.len(),
        removed = delta.removed.len(),
        unchanged = delta.same.len(),
        "push complete"
    );
    Ok(SyncReport {
        subdir,
        diff: delta,
        skipped: local.skipped,
    })
}

/// Make the local subdir match the remote one.
///
/// Deletes local files the remote lacks (pruning emptied directories), then
/// downloads what is new or changed remotely.
#[instrument(skip(remote))]
pub async fn pull(
    local_root: &Path,
    subdir: Subdir,
    remote: &dyn RemoteEndpoint,
) -> Result<SyncReport> {
    let local_dir = local_root.join(subdir.as_str());
    tokio::fs::create_dir_all(&local_dir).await?;

    let local = scan_local(local_dir.clone()).await?;
    let remote_files = remote.list_files(subdir).await?;
    let delta = diff(&local.manifest, &remote_files);

    for file in &delta.removed {
        validate_relative_path(&file.path)?;
        let root = local_dir.clone();
        let rel = file.path.clone();
        debug!(path = %file.path, "deleting local file");
        match offload(move || tree::remove_path(&root, &rel)).await? {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
    }

    for file in &delta.added {
        validate_relative_path(&file.path)?;
        let data = remote.download(subdir, &file.path).await?;
        let received = ContentDigest::from_bytes(&data);
        if received != file.digest {
            // written anyway; the next pull converges
            warn!(
                path = %file.path,
                expected = %file.digest.short(),
                received = %received.short(),
                "downloaded content does not match listing"
            );
        }
        let root = local_dir.clone();
        let rel = file.path.clone();
        offload(move || tree::write_file(&root, &rel, &data)).await??;
        debug!(path = %file.path, "downloaded file");
    }

    info!(
        added = delta.added.len(),
        removed = delta.removed.len(),
        unchanged = delta.same.len(),
        "pull complete"
    );
    Ok(SyncReport {
        subdir,
        diff: delta,
        skipped: local.skipped,
    })
}
