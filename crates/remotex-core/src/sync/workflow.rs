use std::path::Path;

use remotex_state::Subdir;
use tracing::{info, instrument};

use super::reconcile::{pull, push, SyncReport};
use super::remote::{BuildEndpoint, RemoteEndpoint};
use crate::domain::{BuildOptions, RemotexError, Result};

/// Result of a push, build and pull round trip.
#[derive(Debug, Clone)]
pub struct BuildSyncReport {
    pub pushed: SyncReport,
    pub output: String,
    pub pulled: Vec<SyncReport>,
}

/// Push `src`, build, then pull `out` (and `aux` when `save_aux`).
///
/// A failed build is returned as-is (a driver failure keeps its output) and
/// nothing is pulled.
#[instrument(skip(endpoint, options))]
pub async fn build_and_sync<E>(
    local_root: &Path,
    endpoint: &E,
    options: &BuildOptions,
    save_aux: bool,
) -> Result<BuildSyncReport>
where
    E: RemoteEndpoint + BuildEndpoint,
{
    let pushed = push(local_root, Subdir::Src, endpoint).await?;
    let output = endpoint.build(options).await?;

    let mut pulled = vec![pull(local_root, Subdir::Out, endpoint).await?];
    if save_aux {
        pulled.push(pull(local_root, Subdir::Aux, endpoint).await?);
    }
    info!("build synced");
    Ok(BuildSyncReport {
        pushed,
        output,
        pulled,
    })
}

/// Materialize a remote project into a new directory.
#[instrument(skip(endpoint))]
pub async fn clone_into<E>(local_root: &Path, endpoint: &E, save_aux: bool) -> Result<Vec<SyncReport>>
where
    E: RemoteEndpoint,
{
    if tokio::fs::try_exists(local_root).await? {
        return Err(RemotexError::internal(format!(
            "{} already exists",
            local_root.display()
        )));
    }
    for subdir in Subdir::ALL {
        tokio::fs::create_dir_all(local_root.join(subdir.as_str())).await?;
    }

    let mut reports = vec![
        pull(local_root, Subdir::Src, endpoint).await?,
        pull(local_root, Subdir::Out, endpoint).await?,
    ];
    if save_aux {
        reports.push(pull(local_root, Subdir::Aux, endpoint).await?);
    }
    info!(root = %local_root.display(), "clone complete");
    Ok(reports)
}
