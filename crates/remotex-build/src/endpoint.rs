//! Sync and build against a project served from this process.

use std::sync::Arc;

use async_trait::async_trait;
use remotex_core::{BuildEndpoint, BuildOptions, ProjectHandle, RemoteEndpoint, Result};
use remotex_state::{FileRecord, Subdir};

use crate::tracker::BuildTracker;

/// A [`RemoteEndpoint`] + [`BuildEndpoint`] bound to one project, with no
/// transport in between.
pub struct InProcessRemote {
    tracker: Arc<BuildTracker>,
    owner: String,
    project: String,
}

impl InProcessRemote {
    pub fn new(tracker: Arc<BuildTracker>, owner: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            tracker,
            owner: owner.into(),
            project: project.into(),
        }
    }

    async fn handle(&self) -> Result<ProjectHandle> {
        self.tracker.service().project(&self.owner, &self.project).await
    }
}

#[async_trait]
impl RemoteEndpoint for InProcessRemote {
    async fn list_files(&self, subdir: Subdir) -> Result<Vec<FileRecord>> {
        let handle = self.handle().await?;
        self.tracker.service().list_files(&handle, subdir).await
    }

    async fn upload(&self, subdir: Subdir, path: &str, data: Vec<u8>) -> Result<()> {
        let handle = self.handle().await?;
        self.tracker
            .service()
            .create_file(&handle, subdir, path, data)
            .await
            .map(|_| ())
    }

    async fn download(&self, subdir: Subdir, path: &str) -> Result<Vec<u8>> {
        let handle = self.handle().await?;
        self.tracker.service().read_file(&handle, subdir, path).await
    }

    async fn delete(&self, subdir: Subdir, path: &str) -> Result<()> {
        let handle = self.handle().await?;
        self.tracker.service().delete_file(&handle, subdir, path).await
    }
}

#[async_trait]
impl BuildEndpoint for InProcessRemote {
    async fn build(&self, options: &BuildOptions) -> Result<String> {
        let report = self
            .tracker
            .run_build(&self.owner, &self.project, options)
            .await?;
        Ok(report.output)
    }
}
