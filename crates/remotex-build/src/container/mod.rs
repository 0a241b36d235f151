//! latexmk inside an ephemeral, network-less container.
//!
//! One auto-removing container per build. A watchdog task kills the
//! container when the build context ends; the executing task races the
//! attached run against the same context and, after joining the watchdog,
//! alone decides the outcome. A kill that cannot be confirmed is reported
//! to the [`Supervisor`](crate::supervisor::Supervisor) and surfaces as
//! `RemotexError::Unrecoverable`.

pub mod docker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use remotex_core::{RemotexError, Result, ValidationError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::context::{BuildContext, CancelReason};
use crate::executor::BuildExecutor;
use crate::flags::{driver_args, BuildJob};
use crate::supervisor::FatalReporter;

pub use docker::DockerCli;

pub const WORKDIR: &str = "/workdir";
pub const OUT_MOUNT: &str = "/mnt/out";
pub const AUX_MOUNT: &str = "/mnt/aux";
pub const SHARED_MOUNT: &str = "/workdir/shared";

/// Name of the mount point created inside `src` for the shared directory.
const SHARED_MOUNTPOINT: &str = "shared";

/// Errors from a container runtime.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The container no longer exists (already exited and removed).
    #[error("container {id} no longer exists")]
    Gone { id: String },

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("container runtime io: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a mount comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Bind { host: PathBuf, read_only: bool },
    Tmpfs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub target: String,
    pub source: MountSource,
}

/// Everything needed to create one build container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub mounts: Vec<Mount>,
    pub network_disabled: bool,
    pub auto_remove: bool,
}

/// How an attached container run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerExit {
    pub exit_code: i32,
    pub output: String,
}

/// Minimal container engine surface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> std::result::Result<String, ContainerError>;

    /// Start the container and wait for it, collecting its output.
    async fn start_attached(&self, id: &str) -> std::result::Result<ContainerExit, ContainerError>;

    /// Kill immediately. `Gone` if it already exited.
    async fn kill(&self, id: &str) -> std::result::Result<(), ContainerError>;

    /// Make the image available locally, returning once fully provisioned.
    async fn pull_image(&self, image: &str) -> std::result::Result<(), ContainerError>;
}

/// Creates `src/shared` as an empty mount point and removes it on drop.
struct SharedMountpoint {
    path: PathBuf,
}

impl SharedMountpoint {
    fn create(src: &Path) -> Result<Self> {
        let path = src.join(SHARED_MOUNTPOINT);
        if path.symlink_metadata().is_ok() {
            return Err(ValidationError::InvalidPath {
                path: SHARED_MOUNTPOINT.to_string(),
                reason: "reserved for the shared include mount",
            }
            .into());
        }
        std::fs::create_dir(&path)?;
        Ok(Self { path })
    }
}

impl Drop for SharedMountpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove shared mount point");
        }
    }
}

/// What the watchdog did.
#[derive(Debug)]
enum Watch {
    /// The run finished first
    Idle,
    /// The context ended and the kill was confirmed
    Killed(CancelReason),
    /// The context ended and the kill could not be confirmed
    KillFailed(CancelReason, String),
}

/// Runs builds in containers through a [`ContainerRuntime`].
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    kill_grace: Duration,
    reporter: FatalReporter,
}

impl ContainerExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        image: impl Into<String>,
        kill_grace: Duration,
        reporter: FatalReporter,
    ) -> Self {
        Self {
            runtime,
            image: image.into(),
            kill_grace,
            reporter,
        }
    }

    /// Provision the configured image.
    pub async fn pull_image(&self) -> Result<()> {
        info!(image = %self.image, "pulling build image");
        self.runtime
            .pull_image(&self.image)
            .await
            .map_err(|e| RemotexError::internal(format!("pulling {}: {e}", self.image)))?;
        info!(image = %self.image, "build image ready");
        Ok(())
    }

    fn spec(&self, job: &BuildJob) -> Result<ContainerSpec> {
        let args = driver_args(&job.options, Some(AUX_MOUNT), OUT_MOUNT, &job.policy)?;
        let mut command = vec!["latexmk".to_string()];
        command.extend(args);

        let dirs = &job.dirs;
        let mut mounts = vec![
            Mount {
                target: WORKDIR.to_string(),
                source: MountSource::Bind {
                    host: dirs.src.clone(),
                    read_only: true,
                },
            },
            Mount {
                target: OUT_MOUNT.to_string(),
                source: MountSource::Bind {
                    host: dirs.out.clone(),
                    read_only: false,
                },
            },
            Mount {
                target: AUX_MOUNT.to_string(),
                source: match &dirs.aux {
                    Some(aux) => MountSource::Bind {
                        host: aux.clone(),
                        read_only: false,
                    },
                    None => MountSource::Tmpfs,
                },
            },
        ];
        if let Some(shared) = &dirs.shared {
            mounts.push(Mount {
                target: SHARED_MOUNT.to_string(),
                source: MountSource::Bind {
                    host: shared.clone(),
                    read_only: true,
                },
            });
        }

        Ok(ContainerSpec {
            name: format!("remotex-build-{}", uuid::Uuid::new_v4()),
            image: self.image.clone(),
            command,
            working_dir: WORKDIR.to_string(),
            mounts,
            network_disabled: true,
            auto_remove: true,
        })
    }

    fn spawn_watchdog(
        &self,
        id: String,
        ctx: BuildContext,
        finished: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<Watch> {
        let runtime = self.runtime.clone();
        let grace = self.kill_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = finished => Watch::Idle,
                reason = ctx.done() => {
                    warn!(container = %id, reason = reason.describe(), "killing build container");
                    match tokio::time::timeout(grace, runtime.kill(&id)).await {
                        Ok(Ok(())) => Watch::Killed(reason),
                        Ok(Err(ContainerError::Gone { .. })) => {
                            debug!(container = %id, "container already gone");
                            Watch::Killed(reason)
                        }
                        Ok(Err(e)) => Watch::KillFailed(reason, e.to_string()),
                        Err(_) => Watch::KillFailed(
                            reason,
                            format!("kill not confirmed within {}s", grace.as_secs_f32()),
                        ),
                    }
                }
            }
        })
    }
}

#[async_trait]
impl BuildExecutor for ContainerExecutor {
    async fn execute(&self, job: &BuildJob, ctx: &BuildContext) -> Result<String> {
        let spec = self.spec(job)?;
        let _mountpoint = match &job.dirs.shared {
            Some(_) => Some(SharedMountpoint::create(&job.dirs.src)?),
            None => None,
        };

        if ctx.is_done() {
            return Err(RemotexError::internal("build context ended before start"));
        }

        info!(name = %spec.name, image = %spec.image, command = ?spec.command, "creating build container");
        let id = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| RemotexError::internal(format!("creating container: {e}")))?;

        let (finished_tx, finished_rx) = oneshot::channel();
        let watchdog = self.spawn_watchdog(id.clone(), ctx.clone(), finished_rx);

        let mut attach = Box::pin(self.runtime.start_attached(&id));
        let attached = tokio::select! {
            res = &mut attach => Some(res),
            _ = ctx.done() => None,
        };

        // on normal completion release the watchdog; otherwise keep the
        // sender alive so it can only finish by acting on the context
        let mut finished_tx = Some(finished_tx);
        if attached.is_some() {
            if let Some(tx) = finished_tx.take() {
                let _ = tx.send(());
            }
        }
        let watch = watchdog
            .await
            .unwrap_or_else(|e| Watch::KillFailed(CancelReason::Cancelled, format!("watchdog failed: {e}")));
        drop(finished_tx);

        match (attached, watch) {
            (_, Watch::KillFailed(reason, detail)) => {
                let message = format!("container {id} may still be running ({}): {detail}", reason.describe());
                error!(container = %id, %detail, "unconfirmed container kill");
                self.reporter.report("container-executor", message.clone());
                Err(RemotexError::Unrecoverable(message))
            }
            (Some(Ok(exit)), _) => {
                debug!(container = %id, exit_code = exit.exit_code, "container exited");
                if exit.exit_code == 0 {
                    Ok(exit.output)
                } else {
                    Err(RemotexError::Driver {
                        exit_code: exit.exit_code,
                        output: exit.output,
                    })
                }
            }
            (Some(Err(e)), _) => Err(RemotexError::internal(format!("running container: {e}"))),
            (None, watch) => {
                let reason = match watch {
                    Watch::Killed(reason) => reason,
                    _ => CancelReason::Cancelled,
                };
                // collect whatever the killed container printed
                let output = match tokio::time::timeout(self.kill_grace, &mut attach).await {
                    Ok(Ok(exit)) => exit.output,
                    _ => String::new(),
                };
                Err(RemotexError::Internal {
                    reason: reason.describe().to_string(),
                    output,
                })
            }
        }
    }
}
