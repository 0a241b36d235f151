//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryStore` satisfies `ProjectCatalog`, `BuildLedger` and `FileIndex`
//! without any external dependencies, so project deletion can cascade the
//! same way a real backend does.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    /// keyed by (owner, name)
    projects: HashMap<(String, String), ProjectRecord>,
    /// insertion order doubles as creation order
    builds: Vec<BuildRecord>,
    /// (project, subdir) -> path -> record
    files: HashMap<(String, Subdir), BTreeMap<String, FileRecord>>,
}

/// In-memory store backed by plain maps behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectCatalog for MemoryStore {
    async fn create_user(&self, name: &str) -> StorageResult<UserRecord> {
        let mut t = self.tables.lock().unwrap();
        if t.users.contains_key(name) {
            return Err(StorageError::UserExists {
                user: name.to_string(),
            });
        }
        let record = UserRecord {
            name: name.to_string(),
            created_at: Utc::now(),
        };
        t.users.insert(name.to_string(), record.clone());
        Ok(record)
    }

    async fn resolve_user(&self, name: &str) -> StorageResult<UserRecord> {
        let t = self.tables.lock().unwrap();
        t.users
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UserNotFound {
                user: name.to_string(),
            })
    }

    async fn create_project(
        &self,
        owner: &str,
        name: &str,
        public: bool,
    ) -> StorageResult<ProjectRecord> {
        let mut t = self.tables.lock().unwrap();
        if !t.users.contains_key(owner) {
            return Err(StorageError::UserNotFound {
                user: owner.to_string(),
            });
        }
        let key = (owner.to_string(), name.to_string());
        if t.projects.contains_key(&key) {
            return Err(StorageError::ProjectExists {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }
        let record = ProjectRecord {
            project_id: ProjectId::new(),
            owner: owner.to_string(),
            name: name.to_string(),
            public,
            created_at: Utc::now(),
        };
        t.projects.insert(key, record.clone());
        Ok(record)
    }

    async fn resolve_project(&self, owner: &str, name: &str) -> StorageResult<ProjectRecord> {
        let t = self.tables.lock().unwrap();
        t.projects
            .get(&(owner.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::ProjectNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            })
    }

    async fn list_projects(&self, owner: &str) -> StorageResult<Vec<ProjectRecord>> {
        let t = self.tables.lock().unwrap();
        if !t.users.contains_key(owner) {
            return Err(StorageError::UserNotFound {
                user: owner.to_string(),
            });
        }
        let mut projects: Vec<ProjectRecord> = t
            .projects
            .values()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn delete_project(&self, project_id: &ProjectId) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        let key = t
            .projects
            .iter()
            .find(|(_, p)| p.project_id == *project_id)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| StorageError::ProjectNotFound {
                owner: String::new(),
                name: project_id.0.clone(),
            })?;
        t.projects.remove(&key);
        t.builds.retain(|b| b.project_id != *project_id);
        t.files.retain(|(pid, _), _| *pid != project_id.0);
        Ok(())
    }
}

#[async_trait]
impl BuildLedger for MemoryStore {
    async fn begin_build(
        &self,
        project_id: &ProjectId,
        options: serde_json::Value,
    ) -> StorageResult<BuildRecord> {
        let mut t = self.tables.lock().unwrap();
        if let Some(pending) = t
            .builds
            .iter()
            .find(|b| b.project_id == *project_id && b.status == BuildStatus::Pending)
        {
            return Err(StorageError::BuildInProgress {
                project_id: project_id.0.clone(),
                build_id: pending.build_id.0.clone(),
            });
        }
        let record = BuildRecord {
            build_id: BuildId::new(),
            project_id: project_id.clone(),
            started_at: Utc::now(),
            duration_ms: 0,
            status: BuildStatus::Pending,
            options,
            output: String::new(),
        };
        t.builds.push(record.clone());
        Ok(record)
    }

    async fn finish_build(
        &self,
        build_id: &BuildId,
        outcome: BuildOutcome,
    ) -> StorageResult<BuildRecord> {
        let mut t = self.tables.lock().unwrap();
        let record = t
            .builds
            .iter_mut()
            .find(|b| b.build_id == *build_id)
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.0.clone(),
            })?;
        if record.status != BuildStatus::Pending {
            return Err(StorageError::InvalidBuildState {
                build_id: build_id.0.clone(),
                status: record.status.to_string(),
                expected: "pending".to_string(),
            });
        }
        if !outcome.status.is_terminal() {
            return Err(StorageError::InvalidBuildState {
                build_id: build_id.0.clone(),
                status: outcome.status.to_string(),
                expected: "a terminal status".to_string(),
            });
        }
        record.status = outcome.status;
        record.duration_ms = outcome.duration_ms;
        record.output = outcome.output;
        Ok(record.clone())
    }

    async fn get_build(&self, build_id: &BuildId) -> StorageResult<BuildRecord> {
        let t = self.tables.lock().unwrap();
        t.builds
            .iter()
            .find(|b| b.build_id == *build_id)
            .cloned()
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.0.clone(),
            })
    }

    async fn list_builds(&self, project_id: &ProjectId) -> StorageResult<Vec<BuildRecord>> {
        let t = self.tables.lock().unwrap();
        Ok(t.builds
            .iter()
            .rev()
            .filter(|b| b.project_id == *project_id)
            .cloned()
            .collect())
    }

    async fn pending_build(&self, project_id: &ProjectId) -> StorageResult<Option<BuildRecord>> {
        let t = self.tables.lock().unwrap();
        Ok(t.builds
            .iter()
            .find(|b| b.project_id == *project_id && b.status == BuildStatus::Pending)
            .cloned())
    }

    async fn abandon_stale_builds(
        &self,
        started_before: DateTime<Utc>,
        output: &str,
    ) -> StorageResult<Vec<BuildId>> {
        let mut t = self.tables.lock().unwrap();
        let now = Utc::now();
        let mut abandoned = Vec::new();
        for build in t
            .builds
            .iter_mut()
            .filter(|b| b.status == BuildStatus::Pending && b.started_at < started_before)
        {
            build.status = BuildStatus::Failed(FailureReason::Internal);
            build.duration_ms = (now - build.started_at).num_milliseconds().max(0) as u64;
            build.output = output.to_string();
            abandoned.push(build.build_id.clone());
        }
        Ok(abandoned)
    }
}

#[async_trait]
impl FileIndex for MemoryStore {
    async fn replace_files(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        files: Vec<FileRecord>,
    ) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        let rows = files.into_iter().map(|f| (f.path.clone(), f)).collect();
        t.files.insert((project_id.0.clone(), subdir), rows);
        Ok(())
    }

    async fn upsert_file(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        file: FileRecord,
    ) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        t.files
            .entry((project_id.0.clone(), subdir))
            .or_default()
            .insert(file.path.clone(), file);
        Ok(())
    }

    async fn remove_path(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        path: &str,
    ) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        if let Some(rows) = t.files.get_mut(&(project_id.0.clone(), subdir)) {
            rows.retain(|p, _| !path_is_within(p, path));
        }
        Ok(())
    }

    async fn list_files(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
    ) -> StorageResult<Vec<FileRecord>> {
        let t = self.tables.lock().unwrap();
        Ok(t.files
            .get(&(project_id.0.clone(), subdir))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}
