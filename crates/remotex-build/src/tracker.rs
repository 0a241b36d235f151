//! Build lifecycle: one tracked attempt per request.
//!
//! A build runs under a per-project in-flight guard and a Pending ledger
//! row, makes exactly one terminal transition (even when the caller drops
//! the build future), and leaves the file index matching the directories it
//! touched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use remotex_core::{BuildOptions, ProjectHandle, ProjectService, RemotexError, Result};
use remotex_state::{
    BuildId, BuildOutcome, BuildRecord, BuildStatus, FailureReason, Persistence, ProjectId,
    StorageError, StorageResult, Subdir,
};
use tracing::{error, info, instrument, warn};

use crate::config::{BuildMode, ServerConfig};
use crate::context::BuildContext;
use crate::executor::BuildExecutor;
use crate::flags::{validate_document, BuildJob, DriverDirs};
use crate::redact::Redactor;

/// A completed, successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub build_id: BuildId,
    pub status: BuildStatus,
    pub output: String,
    pub duration: Duration,
}

/// Attempts at recording a build's terminal transition.
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Added to the build deadline and kill grace before a Pending row left by
/// an earlier process counts as stale.
const STALE_MARGIN: Duration = Duration::from_secs(60);

const ABANDONED: &str = "build abandoned before its outcome was recorded";

type InFlightSet = Arc<Mutex<HashSet<ProjectId>>>;

/// Removes its project from the in-flight set when dropped.
struct InFlight {
    set: InFlightSet,
    project_id: ProjectId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.project_id);
    }
}

/// A Pending ledger row that still owes its terminal transition.
///
/// Dropped while armed (the build future was cancelled, or recording
/// failed), it records `Failed(Internal)` on the runtime and only then
/// releases the in-flight slot.
struct PendingBuild {
    store: Arc<dyn Persistence>,
    build_id: BuildId,
    started: Instant,
    in_flight: Option<InFlight>,
    armed: bool,
}

impl PendingBuild {
    /// Record `outcome`. Once the row is settled (recorded, already
    /// terminal or gone) the in-flight slot is handed back.
    async fn finish(mut self, outcome: BuildOutcome) -> (StorageResult<BuildRecord>, Option<InFlight>) {
        let recorded = record_outcome(self.store.as_ref(), &self.build_id, outcome).await;
        let settled = matches!(
            recorded,
            Ok(_) | Err(StorageError::InvalidBuildState { .. } | StorageError::BuildNotFound { .. })
        );
        if settled {
            self.armed = false;
            return (recorded, self.in_flight.take());
        }
        (recorded, None)
    }
}

impl Drop for PendingBuild {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let build_id = self.build_id.clone();
        let in_flight = self.in_flight.take();
        let outcome = BuildOutcome {
            status: BuildStatus::Failed(FailureReason::Internal),
            duration_ms: self.started.elapsed().as_millis() as u64,
            output: ABANDONED.to_string(),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match record_outcome(store.as_ref(), &build_id, outcome).await {
                        Ok(_) => warn!(%build_id, "abandoned build recorded as failed"),
                        Err(e) => error!(%build_id, error = %e, "could not record abandoned build"),
                    }
                    drop(in_flight);
                });
            }
            Err(_) => error!(%build_id, "no runtime to record abandoned build, left pending"),
        }
    }
}

async fn record_outcome(
    store: &dyn Persistence,
    build_id: &BuildId,
    outcome: BuildOutcome,
) -> StorageResult<BuildRecord> {
    let mut attempt = 1;
    loop {
        match store.finish_build(build_id, outcome.clone()).await {
            Ok(record) => return Ok(record),
            Err(e @ (StorageError::InvalidBuildState { .. } | StorageError::BuildNotFound { .. })) => {
                return Err(e)
            }
            Err(e) if attempt < FINISH_ATTEMPTS => {
                warn!(%build_id, attempt, error = %e, "recording build outcome failed, retrying");
                tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

struct ResolvedDirs {
    project: PathBuf,
    shared: Option<PathBuf>,
}

impl ResolvedDirs {
    fn into_driver_dirs(self) -> DriverDirs {
        DriverDirs {
            src: self.project.join(Subdir::Src.as_str()),
            aux: Some(self.project.join(Subdir::Aux.as_str())),
            out: self.project.join(Subdir::Out.as_str()),
            shared: self.shared,
        }
    }
}

fn conflict(project: &ProjectHandle) -> RemotexError {
    RemotexError::Conflict {
        project: format!("{}/{}", project.record.owner, project.record.name),
    }
}

/// Runs and records builds.
pub struct BuildTracker {
    service: Arc<ProjectService>,
    executor: Arc<dyn BuildExecutor>,
    config: ServerConfig,
    in_flight: InFlightSet,
}

fn status_of(result: &Result<String>) -> BuildStatus {
    match result {
        Ok(_) => BuildStatus::Finished,
        Err(RemotexError::Driver { exit_code, .. }) => {
            BuildStatus::Failed(FailureReason::ExitCode(*exit_code))
        }
        Err(_) => BuildStatus::Failed(FailureReason::Internal),
    }
}

/// What the ledger keeps for a result: the log, or the reason followed by
/// whatever output was captured.
fn ledger_output(result: &Result<String>) -> String {
    match result {
        Ok(output) => output.clone(),
        Err(RemotexError::Driver { output, .. }) => output.clone(),
        Err(RemotexError::Internal { reason, output }) if !output.is_empty() => {
            format!("{reason}\n{output}")
        }
        Err(RemotexError::Internal { reason, .. }) => reason.clone(),
        Err(e) => e.to_string(),
    }
}

async fn absolute(path: &Path) -> Result<PathBuf> {
    tokio::fs::canonicalize(path)
        .await
        .map_err(|e| RemotexError::internal(format!("{}: {e}", path.display())))
}

impl BuildTracker {
    pub fn new(
        service: Arc<ProjectService>,
        executor: Arc<dyn BuildExecutor>,
        config: ServerConfig,
    ) -> Self {
        Self {
            service,
            executor,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn service(&self) -> &Arc<ProjectService> {
        &self.service
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn acquire(&self, project: &ProjectHandle) -> Result<InFlight> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(project.id().clone()) {
            return Err(conflict(project));
        }
        Ok(InFlight {
            set: self.in_flight.clone(),
            project_id: project.id().clone(),
        })
    }

    /// Fail Pending builds left behind by a process that died mid-build.
    ///
    /// Only rows older than the longest a live build can take are touched,
    /// so builds running in another process sharing the database survive.
    pub async fn recover_stale_builds(&self) -> Result<Vec<BuildId>> {
        let horizon = self.config.max_build_time() + self.config.kill_grace() + STALE_MARGIN;
        let horizon = chrono::Duration::from_std(horizon)
            .map_err(|e| RemotexError::internal(format!("stale build horizon: {e}")))?;
        let cutoff = Utc::now() - horizon;
        let abandoned = self
            .service
            .store()
            .abandon_stale_builds(cutoff, ABANDONED)
            .await?;
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "failed stale pending builds");
        }
        Ok(abandoned)
    }

    /// Build with no caller deadline beyond `max_build_time`.
    pub async fn run_build(
        &self,
        owner: &str,
        project: &str,
        options: &BuildOptions,
    ) -> Result<BuildReport> {
        self.run_build_within(owner, project, options, &BuildContext::background())
            .await
    }

    /// Build inside a caller context; the build deadline nests within it.
    #[instrument(skip(self, options, ctx))]
    pub async fn run_build_within(
        &self,
        owner: &str,
        project: &str,
        options: &BuildOptions,
        ctx: &BuildContext,
    ) -> Result<BuildReport> {
        let handle = self.service.project(owner, project).await?;
        if let Some(document) = &options.document {
            validate_document(document)?;
        }
        let in_flight = self.acquire(&handle)?;

        let store = self.service.store().clone();
        let record = store
            .begin_build(handle.id(), options.snapshot())
            .await
            .map_err(|e| match e {
                StorageError::BuildInProgress { .. } => conflict(&handle),
                other => other.into(),
            })?;
        info!(build_id = %record.build_id, project_id = %handle.id(), "build started");
        let started = Instant::now();
        let pending = PendingBuild {
            store,
            build_id: record.build_id.clone(),
            started,
            in_flight: Some(in_flight),
            armed: true,
        };

        let mut redactor = Redactor::new().with_path(&handle.dir, "<project>");
        if let Some(dir) = self.config.shared_dir.as_deref().filter(|d| d.is_absolute()) {
            redactor = redactor.with_path(dir, "<shared>");
        }
        let result = match self.driver_dirs(&handle).await {
            Ok(dirs) => {
                redactor = redactor.with_path(&dirs.project, "<project>");
                if let Some(dir) = &dirs.shared {
                    redactor = redactor.with_path(dir, "<shared>");
                }
                let job = BuildJob {
                    options: options.clone(),
                    dirs: dirs.into_driver_dirs(),
                    policy: self.config.policy,
                };
                self.execute(&handle, &job, &ctx.with_timeout(self.config.max_build_time()))
                    .await
            }
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(output) => Ok(redactor.redact(&output)),
            Err(e) => Err(e.map_text(|t| redactor.redact(t))),
        };
        let duration = started.elapsed();

        let status = status_of(&result);
        let (finished, _in_flight) = pending
            .finish(BuildOutcome {
                status,
                duration_ms: duration.as_millis() as u64,
                output: ledger_output(&result),
            })
            .await;
        info!(build_id = %record.build_id, %status, elapsed_ms = duration.as_millis() as u64, "build complete");

        let rescanned = self.rescan(&handle).await;

        // precedence: build failure, then ledger failure, then rescan failure
        let output = result?;
        finished?;
        rescanned?;
        Ok(BuildReport {
            build_id: record.build_id,
            status,
            output,
            duration,
        })
    }

    /// Canonical project and shared directories for the driver.
    async fn driver_dirs(&self, handle: &ProjectHandle) -> Result<ResolvedDirs> {
        let project = absolute(&handle.dir).await?;
        let shared = match &self.config.shared_dir {
            Some(dir) => Some(absolute(dir).await?),
            None => None,
        };
        Ok(ResolvedDirs { project, shared })
    }

    async fn execute(&self, handle: &ProjectHandle, job: &BuildJob, ctx: &BuildContext) -> Result<String> {
        if job.options.clean_build {
            info!(project_id = %handle.id(), "clean build: clearing aux and out");
            self.service.clear_subdir(handle, Subdir::Aux).await?;
            self.service.clear_subdir(handle, Subdir::Out).await?;
        }
        self.executor.execute(job, ctx).await
    }

    /// Refresh the index of every directory a build may have written.
    async fn rescan(&self, handle: &ProjectHandle) -> Result<()> {
        let mut subdirs = vec![Subdir::Aux, Subdir::Out];
        if self.config.build_mode == BuildMode::Native {
            subdirs.push(Subdir::Src);
        }
        let scans = subdirs
            .iter()
            .map(|subdir| self.service.scan_subdir(handle, *subdir));
        let mut first_error = None;
        for (subdir, scanned) in subdirs.iter().zip(join_all(scans).await) {
            match scanned {
                Ok(report) => {
                    for skipped in &report.skipped {
                        warn!(%subdir, path = %skipped.path, reason = %skipped.reason, "not indexed");
                    }
                }
                Err(e) => {
                    error!(%subdir, error = %e, "rescan failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// All builds of a project, newest first.
    pub async fn list_builds(&self, owner: &str, project: &str) -> Result<Vec<BuildRecord>> {
        let handle = self.service.project(owner, project).await?;
        Ok(self.service.store().list_builds(handle.id()).await?)
    }

    pub async fn latest_build(&self, owner: &str, project: &str) -> Result<Option<BuildRecord>> {
        Ok(self.list_builds(owner, project).await?.into_iter().next())
    }
}
