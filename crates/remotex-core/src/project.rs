//! Server-side project trees and their file index.
//!
//! A project lives at `<projects_root>/<owner>/<name>/{src,aux,out}`. The
//! database holds the project row and the last scanned listing of each
//! subdir; [`ProjectService`] keeps the two in step.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use remotex_state::{
    BuildLedger, BuildRecord, FileRecord, Persistence, ProjectCatalog, ProjectId, ProjectRecord,
    Subdir,
};
use tracing::{debug, info, instrument, warn};

use crate::domain::{RemotexError, Result, ValidationError};
use crate::manifest::{scan_manifest, ScanReport};
use crate::path_guard::{validate_name, validate_relative_path};
use crate::tree::{self, offload};

/// Resolved project: its row plus where it lives on disk.
#[derive(Debug, Clone)]
pub struct ProjectHandle {
    pub record: ProjectRecord,
    pub dir: PathBuf,
}

impl ProjectHandle {
    pub fn id(&self) -> &ProjectId {
        &self.record.project_id
    }

    pub fn subdir(&self, subdir: Subdir) -> PathBuf {
        self.dir.join(subdir.as_str())
    }
}

/// A project together with its most recent build.
#[derive(Debug, Clone)]
pub struct ProjectSummary {
    pub handle: ProjectHandle,
    pub latest_build: Option<BuildRecord>,
}

/// Project lifecycle and file operations.
pub struct ProjectService {
    projects_root: PathBuf,
    store: Arc<dyn Persistence>,
    max_file_size: u64,
}

/// Missing entries are `NotFound`, everything else is internal.
fn fs_error(err: io::Error, subdir: Subdir, path: &str) -> RemotexError {
    if err.kind() == io::ErrorKind::NotFound {
        RemotexError::NotFound(format!("{subdir}/{path}"))
    } else {
        RemotexError::internal(format!("{subdir}/{path}: {err}"))
    }
}

impl ProjectService {
    pub fn new(
        projects_root: impl Into<PathBuf>,
        store: Arc<dyn Persistence>,
        max_file_size: u64,
    ) -> Self {
        Self {
            projects_root: projects_root.into(),
            store,
            max_file_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    fn project_dir(&self, owner: &str, name: &str) -> PathBuf {
        self.projects_root.join(owner).join(name)
    }

    /// Create the project row and its three subdirs.
    #[instrument(skip(self))]
    pub async fn create_project(
        &self,
        owner: &str,
        name: &str,
        public: bool,
    ) -> Result<ProjectHandle> {
        validate_name(owner)?;
        validate_name(name)?;

        let record = self.store.create_project(owner, name, public).await?;
        let dir = self.project_dir(owner, name);
        let subdirs: Vec<PathBuf> = Subdir::ALL.iter().map(|s| dir.join(s.as_str())).collect();
        let created = offload(move || {
            for subdir in subdirs {
                std::fs::create_dir_all(subdir)?;
            }
            Ok(())
        })
        .await
        .and_then(|r| r.map_err(RemotexError::from));

        if let Err(e) = created {
            warn!(owner, project = name, error = %e, "project directories not created, rolling back");
            self.store.delete_project(&record.project_id).await?;
            return Err(e);
        }

        info!(owner, project = name, project_id = %record.project_id, "project created");
        Ok(ProjectHandle { record, dir })
    }

    /// Delete the project directory and its rows (builds and file index
    /// cascade).
    #[instrument(skip(self))]
    pub async fn delete_project(&self, owner: &str, name: &str) -> Result<()> {
        let handle = self.project(owner, name).await?;
        let dir = handle.dir.clone();
        offload(move || match std::fs::remove_dir_all(&dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        })
        .await??;
        self.store.delete_project(handle.id()).await?;
        info!(owner, project = name, "project deleted");
        Ok(())
    }

    /// Resolve `owner/name` to a handle.
    pub async fn project(&self, owner: &str, name: &str) -> Result<ProjectHandle> {
        validate_name(owner)?;
        validate_name(name)?;
        let record = self.store.resolve_project(owner, name).await?;
        Ok(ProjectHandle {
            dir: self.project_dir(owner, name),
            record,
        })
    }

    /// The owner's projects, newest first, each with its latest build.
    pub async fn list_projects(&self, owner: &str) -> Result<Vec<ProjectSummary>> {
        validate_name(owner)?;
        let records = self.store.list_projects(owner).await?;
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            let latest_build = self.latest_build(&record.project_id).await?;
            summaries.push(ProjectSummary {
                handle: ProjectHandle {
                    dir: self.project_dir(&record.owner, &record.name),
                    record,
                },
                latest_build,
            });
        }
        Ok(summaries)
    }

    /// One project and its latest build.
    pub async fn project_info(&self, owner: &str, name: &str) -> Result<ProjectSummary> {
        let handle = self.project(owner, name).await?;
        let latest_build = self.latest_build(handle.id()).await?;
        Ok(ProjectSummary {
            handle,
            latest_build,
        })
    }

    async fn latest_build(&self, project_id: &ProjectId) -> Result<Option<BuildRecord>> {
        Ok(self.store.list_builds(project_id).await?.into_iter().next())
    }

    /// Scan a subdir and replace its index rows with the result.
    pub async fn scan_subdir(&self, project: &ProjectHandle, subdir: Subdir) -> Result<ScanReport> {
        let root = project.subdir(subdir);
        let report = tokio::task::spawn_blocking(move || scan_manifest(&root))
            .await
            .map_err(|e| RemotexError::internal(format!("scan task failed: {e}")))??;
        self.store
            .replace_files(project.id(), subdir, report.manifest.clone())
            .await?;
        debug!(project_id = %project.id(), %subdir, files = report.manifest.len(), "index refreshed");
        Ok(report)
    }

    /// Indexed listing of a subdir.
    pub async fn list_files(
        &self,
        project: &ProjectHandle,
        subdir: Subdir,
    ) -> Result<Vec<FileRecord>> {
        Ok(self.store.list_files(project.id(), subdir).await?)
    }

    /// Write one file and index it.
    pub async fn create_file(
        &self,
        project: &ProjectHandle,
        subdir: Subdir,
        path: &str,
        data: Vec<u8>,
    ) -> Result<FileRecord> {
        validate_relative_path(path)?;
        let size = data.len() as u64;
        if size > self.max_file_size {
            return Err(ValidationError::FileTooLarge {
                path: path.to_string(),
                size,
                limit: self.max_file_size,
            }
            .into());
        }

        let root = project.subdir(subdir);
        let rel = path.to_string();
        let record = offload(move || tree::write_file(&root, &rel, &data))
            .await?
            .map_err(|e| fs_error(e, subdir, path))?;
        self.store
            .upsert_file(project.id(), subdir, record.clone())
            .await?;
        debug!(project_id = %project.id(), %subdir, path, size, "file stored");
        Ok(record)
    }

    /// Read a regular file.
    pub async fn read_file(
        &self,
        project: &ProjectHandle,
        subdir: Subdir,
        path: &str,
    ) -> Result<Vec<u8>> {
        validate_relative_path(path)?;
        let root = project.subdir(subdir);
        let rel = path.to_string();
        offload(move || tree::read_file(&root, &rel))
            .await?
            .map_err(|e| fs_error(e, subdir, path))
    }

    /// Delete a file or directory, prune empty parents and drop the index
    /// rows at and below `path`.
    pub async fn delete_file(&self, project: &ProjectHandle, subdir: Subdir, path: &str) -> Result<()> {
        validate_relative_path(path)?;
        let root = project.subdir(subdir);
        let rel = path.to_string();
        offload(move || tree::remove_path(&root, &rel))
            .await?
            .map_err(|e| fs_error(e, subdir, path))?;
        self.store.remove_path(project.id(), subdir, path).await?;
        debug!(project_id = %project.id(), %subdir, path, "file deleted");
        Ok(())
    }

    /// Empty a subdir on disk and in the index.
    pub async fn clear_subdir(&self, project: &ProjectHandle, subdir: Subdir) -> Result<()> {
        let root = project.subdir(subdir);
        offload(move || tree::clear_dir(&root)).await??;
        self.store
            .replace_files(project.id(), subdir, Vec::new())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotex_state::fakes::MemoryStore;
    use remotex_state::{BuildOutcome, BuildStatus, ProjectCatalog};

    async fn service() -> (tempfile::TempDir, ProjectService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.create_user("alice").await.unwrap();
        let svc = ProjectService::new(dir.path().join("projects"), store, 1024);
        (dir, svc)
    }

    #[tokio::test]
    async fn create_project_lays_out_subdirs() {
        let (_dir, svc) = service().await;
        let handle = svc.create_project("alice", "thesis", false).await.unwrap();
        for subdir in Subdir::ALL {
            assert!(handle.subdir(subdir).is_dir());
        }
        assert!(svc.create_project("alice", "../x", false).await.is_err());
    }

    #[tokio::test]
    async fn listing_and_info_carry_latest_build() {
        let (_dir, svc) = service().await;
        let thesis = svc.create_project("alice", "thesis", false).await.unwrap();
        svc.create_project("alice", "slides", true).await.unwrap();

        let build = svc
            .store()
            .begin_build(thesis.id(), serde_json::Value::Null)
            .await
            .unwrap();
        svc.store()
            .finish_build(
                &build.build_id,
                BuildOutcome {
                    status: BuildStatus::Finished,
                    duration_ms: 5,
                    output: String::new(),
                },
            )
            .await
            .unwrap();

        let listed = svc.list_projects("alice").await.unwrap();
        assert_eq!(listed.len(), 2);
        let thesis_row = listed
            .iter()
            .find(|p| p.handle.record.name == "thesis")
            .unwrap();
        assert_eq!(
            thesis_row.latest_build.as_ref().map(|b| &b.build_id),
            Some(&build.build_id)
        );
        assert_eq!(thesis_row.handle.dir, thesis.dir);
        let slides_row = listed
            .iter()
            .find(|p| p.handle.record.name == "slides")
            .unwrap();
        assert!(slides_row.handle.record.public);
        assert!(slides_row.latest_build.is_none());

        let info = svc.project_info("alice", "thesis").await.unwrap();
        assert_eq!(info.latest_build.unwrap().status, BuildStatus::Finished);
        assert!(matches!(
            svc.project_info("alice", "missing").await.unwrap_err(),
            RemotexError::NotFound(_)
        ));
        assert!(matches!(
            svc.list_projects("nobody").await.unwrap_err(),
            RemotexError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn file_lifecycle_keeps_index_in_step() {
        let (_dir, svc) = service().await;
        let p = svc.create_project("alice", "thesis", false).await.unwrap();

        svc.create_file(&p, Subdir::Src, "main.tex", b"hello".to_vec())
            .await
            .unwrap();
        svc.create_file(&p, Subdir::Src, "img/a.png", b"png".to_vec())
            .await
            .unwrap();
        assert_eq!(svc.list_files(&p, Subdir::Src).await.unwrap().len(), 2);
        assert_eq!(
            svc.read_file(&p, Subdir::Src, "main.tex").await.unwrap(),
            b"hello"
        );

        svc.delete_file(&p, Subdir::Src, "img").await.unwrap();
        let files = svc.list_files(&p, Subdir::Src).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "main.tex");
        assert!(!p.subdir(Subdir::Src).join("img").exists());
    }

    #[tokio::test]
    async fn guard_runs_before_filesystem() {
        let (_dir, svc) = service().await;
        let p = svc.create_project("alice", "thesis", false).await.unwrap();
        let err = svc
            .create_file(&p, Subdir::Src, "../escape.tex", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, RemotexError::Validation(_)));
        assert!(!p.dir.join("escape.tex").exists());

        let err = svc.delete_file(&p, Subdir::Src, "./").await.unwrap_err();
        assert!(matches!(err, RemotexError::Validation(_)));
        assert!(p.subdir(Subdir::Src).is_dir());
    }

    #[tokio::test]
    async fn oversized_upload_rejected() {
        let (_dir, svc) = service().await;
        let p = svc.create_project("alice", "thesis", false).await.unwrap();
        let err = svc
            .create_file(&p, Subdir::Src, "big.bin", vec![0u8; 2048])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RemotexError::Validation(ValidationError::FileTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, svc) = service().await;
        let p = svc.create_project("alice", "thesis", false).await.unwrap();
        let err = svc.read_file(&p, Subdir::Out, "main.pdf").await.unwrap_err();
        assert!(matches!(err, RemotexError::NotFound(_)));
    }

    #[tokio::test]
    async fn scan_replaces_index_and_delete_project_cascades() {
        let (_dir, svc) = service().await;
        let p = svc.create_project("alice", "thesis", false).await.unwrap();
        std::fs::write(p.subdir(Subdir::Out).join("main.pdf"), b"%PDF").unwrap();
        let report = svc.scan_subdir(&p, Subdir::Out).await.unwrap();
        assert_eq!(report.manifest.len(), 1);
        assert_eq!(svc.list_files(&p, Subdir::Out).await.unwrap().len(), 1);

        svc.delete_project("alice", "thesis").await.unwrap();
        assert!(!p.dir.exists());
        assert!(matches!(
            svc.project("alice", "thesis").await.unwrap_err(),
            RemotexError::NotFound(_)
        ));
    }
}
