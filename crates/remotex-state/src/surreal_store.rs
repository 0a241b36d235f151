//! SurrealDB-backed persistence
//!
//! Implements `ProjectCatalog`, `BuildLedger` and `FileIndex` over one
//! connection, using `schema` rows and converting to `storage_traits` types
//! at the boundary.

use async_trait::async_trait;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::schema::{BuildRow, FileRow, ProjectRow, UserRow};
use crate::storage_traits::*;

const USER_FIELDS: &str = "name, created_at, created_us";
const PROJECT_FIELDS: &str = "project_id, owner, name, public, created_at, created_us";
const BUILD_FIELDS: &str = "build_id, project_id, started_at, started_us, duration_ms, state, \
                            exit_code, options, output, pending_key";

/// SurrealDB-backed implementation of [`Persistence`].
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Create an in-memory instance (`mem://`), mainly for tests.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`,
    /// `ws://host:port`), select `remotex/main` and initialize the schema.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url).await?;
        db.use_ns("remotex").use_db("main").await?;
        migrations::init_schema(&db).await?;
        info!(url, "SurrealStore connected");
        Ok(Self { db })
    }

    /// Open (or create) an on-disk SurrealKV database under `path`.
    pub async fn open_local(path: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Backend(format!("failed to create {}: {e}", path.display()))
        })?;
        let url = format!("surrealkv://{}", path.display());
        info!(path = %path.display(), "using local SurrealKV persistence");
        Self::connect(&url).await
    }

    // -- private helpers -----------------------------------------------------

    /// Run a single-statement query and deserialize its rows.
    async fn rows<T: DeserializeOwned>(
        &self,
        sql: String,
        binds: Vec<(&'static str, String)>,
    ) -> StorageResult<Vec<T>> {
        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut res = query.await?.check()?;
        let rows: Vec<T> = res.take(0)?;
        Ok(rows)
    }

    async fn fetch_user(&self, name: &str) -> StorageResult<Option<UserRow>> {
        let rows: Vec<UserRow> = self
            .rows(
                format!("SELECT {USER_FIELDS} FROM users WHERE name = $name"),
                vec![("name", name.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_project_by_id(&self, project_id: &ProjectId) -> StorageResult<Option<ProjectRow>> {
        let rows: Vec<ProjectRow> = self
            .rows(
                format!("SELECT {PROJECT_FIELDS} FROM projects WHERE project_id = $pid"),
                vec![("pid", project_id.0.clone())],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_build(&self, build_id: &BuildId) -> StorageResult<BuildRecord> {
        let rows: Vec<BuildRow> = self
            .rows(
                format!("SELECT {BUILD_FIELDS} FROM builds WHERE build_id = $bid"),
                vec![("bid", build_id.0.clone())],
            )
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.0.clone(),
            })?;
        Self::row_to_build(row)
    }

    fn row_to_build(row: BuildRow) -> StorageResult<BuildRecord> {
        let status = row
            .status()
            .ok_or_else(|| StorageError::Backend(format!("unknown build state: {}", row.state)))?;
        Ok(BuildRecord {
            build_id: BuildId(row.build_id),
            project_id: ProjectId(row.project_id),
            started_at: row.started_at,
            duration_ms: row.duration_ms,
            status,
            options: row.options,
            output: row.output,
        })
    }

    fn row_to_file(row: FileRow) -> StorageResult<FileRecord> {
        Ok(FileRecord::new(
            row.path,
            row.size,
            ContentDigest::try_from(row.digest)?,
        ))
    }
}

#[async_trait]
impl ProjectCatalog for SurrealStore {
    async fn create_user(&self, name: &str) -> StorageResult<UserRecord> {
        if self.fetch_user(name).await?.is_some() {
            return Err(StorageError::UserExists {
                user: name.to_string(),
            });
        }
        let record = UserRecord {
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.db
            .query("CREATE users CONTENT $row")
            .bind(("row", UserRow::from(&record)))
            .await?
            .check()?;
        debug!(user = name, "created user");
        Ok(record)
    }

    async fn resolve_user(&self, name: &str) -> StorageResult<UserRecord> {
        self.fetch_user(name)
            .await?
            .map(UserRecord::from)
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
        self.resolve_user(owner).await?;
        if self.resolve_project(owner, name).await.is_ok() {
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
        self.db
            .query("CREATE projects CONTENT $row")
            .bind(("row", ProjectRow::from(&record)))
            .await?
            .check()?;
        debug!(owner, project = name, project_id = %record.project_id, "created project");
        Ok(record)
    }

    async fn resolve_project(&self, owner: &str, name: &str) -> StorageResult<ProjectRecord> {
        let rows: Vec<ProjectRow> = self
            .rows(
                format!(
                    "SELECT {PROJECT_FIELDS} FROM projects WHERE owner = $owner AND name = $name"
                ),
                vec![("owner", owner.to_string()), ("name", name.to_string())],
            )
            .await?;
        rows.into_iter()
            .next()
            .map(ProjectRecord::from)
            .ok_or_else(|| StorageError::ProjectNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            })
    }

    async fn list_projects(&self, owner: &str) -> StorageResult<Vec<ProjectRecord>> {
        self.resolve_user(owner).await?;
        let rows: Vec<ProjectRow> = self
            .rows(
                format!(
                    "SELECT {PROJECT_FIELDS} FROM projects WHERE owner = $owner ORDER BY created_us DESC"
                ),
                vec![("owner", owner.to_string())],
            )
            .await?;
        Ok(rows.into_iter().map(ProjectRecord::from).collect())
    }

    async fn delete_project(&self, project_id: &ProjectId) -> StorageResult<()> {
        if self.fetch_project_by_id(project_id).await?.is_none() {
            return Err(StorageError::ProjectNotFound {
                owner: String::new(),
                name: project_id.0.clone(),
            });
        }
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE builds WHERE project_id = $pid;
                DELETE files WHERE project_id = $pid;
                DELETE projects WHERE project_id = $pid;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("pid", project_id.0.clone()))
            .await?
            .check()?;
        debug!(project_id = %project_id, "deleted project");
        Ok(())
    }
}

#[async_trait]
impl BuildLedger for SurrealStore {
    async fn begin_build(
        &self,
        project_id: &ProjectId,
        options: serde_json::Value,
    ) -> StorageResult<BuildRecord> {
        if let Some(pending) = self.pending_build(project_id).await? {
            return Err(StorageError::BuildInProgress {
                project_id: project_id.0.clone(),
                build_id: pending.build_id.0,
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
        let created = self
            .db
            .query("CREATE builds CONTENT $row")
            .bind(("row", BuildRow::from(&record)))
            .await
            .and_then(|res| res.check());
        match created {
            Ok(_) => {}
            // a concurrent begin won the unique pending slot
            Err(e) if e.to_string().contains("idx_build_pending") => {
                let build_id = self
                    .pending_build(project_id)
                    .await?
                    .map(|b| b.build_id.0)
                    .unwrap_or_default();
                return Err(StorageError::BuildInProgress {
                    project_id: project_id.0.clone(),
                    build_id,
                });
            }
            Err(e) => return Err(e.into()),
        }
        debug!(build_id = %record.build_id, project_id = %project_id, "build pending");
        Ok(record)
    }

    async fn finish_build(
        &self,
        build_id: &BuildId,
        outcome: BuildOutcome,
    ) -> StorageResult<BuildRecord> {
        let current = self.fetch_build(build_id).await?;
        if current.status != BuildStatus::Pending {
            return Err(StorageError::InvalidBuildState {
                build_id: build_id.0.clone(),
                status: current.status.to_string(),
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

        let (state, exit_code) = BuildRow::status_columns(&outcome.status);
        self.db
            .query(
                "UPDATE builds SET state = $state, exit_code = $code, duration_ms = $duration, \
                 output = $output, pending_key = $bid WHERE build_id = $bid AND state = 'pending'",
            )
            .bind(("state", state.to_string()))
            .bind(("code", exit_code))
            .bind(("duration", outcome.duration_ms))
            .bind(("output", outcome.output.clone()))
            .bind(("bid", build_id.0.clone()))
            .await?
            .check()?;

        debug!(build_id = %build_id, status = %outcome.status, "build finished");
        Ok(BuildRecord {
            status: outcome.status,
            duration_ms: outcome.duration_ms,
            output: outcome.output,
            ..current
        })
    }

    async fn get_build(&self, build_id: &BuildId) -> StorageResult<BuildRecord> {
        self.fetch_build(build_id).await
    }

    async fn list_builds(&self, project_id: &ProjectId) -> StorageResult<Vec<BuildRecord>> {
        let rows: Vec<BuildRow> = self
            .rows(
                format!(
                    "SELECT {BUILD_FIELDS} FROM builds WHERE project_id = $pid ORDER BY started_us DESC"
                ),
                vec![("pid", project_id.0.clone())],
            )
            .await?;
        rows.into_iter().map(Self::row_to_build).collect()
    }

    async fn pending_build(&self, project_id: &ProjectId) -> StorageResult<Option<BuildRecord>> {
        let rows: Vec<BuildRow> = self
            .rows(
                format!(
                    "SELECT {BUILD_FIELDS} FROM builds WHERE project_id = $pid AND state = 'pending'"
                ),
                vec![("pid", project_id.0.clone())],
            )
            .await?;
        rows.into_iter().next().map(Self::row_to_build).transpose()
    }

    async fn abandon_stale_builds(
        &self,
        started_before: DateTime<Utc>,
        output: &str,
    ) -> StorageResult<Vec<BuildId>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT {BUILD_FIELDS} FROM builds WHERE state = 'pending' AND started_us < $cutoff"
            ))
            .bind(("cutoff", started_before.timestamp_micros()))
            .await?
            .check()?;
        let stale: Vec<BuildRow> = res.take(0)?;

        let now = Utc::now().timestamp_micros();
        let mut abandoned = Vec::with_capacity(stale.len());
        for row in stale {
            let duration_ms = ((now - row.started_us) / 1000).max(0) as u64;
            self.db
                .query(
                    "UPDATE builds SET state = 'failed', exit_code = NONE, duration_ms = $duration, \
                     output = $output, pending_key = $bid WHERE build_id = $bid AND state = 'pending'",
                )
                .bind(("duration", duration_ms))
                .bind(("output", output.to_string()))
                .bind(("bid", row.build_id.clone()))
                .await?
                .check()?;
            info!(build_id = %row.build_id, project_id = %row.project_id, "abandoned stale build");
            abandoned.push(BuildId(row.build_id));
        }
        Ok(abandoned)
    }
}

#[async_trait]
impl FileIndex for SurrealStore {
    async fn replace_files(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        files: Vec<FileRecord>,
    ) -> StorageResult<()> {
        let rows: Vec<FileRow> = files
            .iter()
            .map(|f| FileRow::new(&project_id.0, subdir, f))
            .collect();
        let sql = if rows.is_empty() {
            "DELETE files WHERE project_id = $pid AND subdir = $subdir;"
        } else {
            r#"
            BEGIN TRANSACTION;
            DELETE files WHERE project_id = $pid AND subdir = $subdir;
            INSERT INTO files $rows;
            COMMIT TRANSACTION;
            "#
        };
        self.db
            .query(sql)
            .bind(("pid", project_id.0.clone()))
            .bind(("subdir", subdir.as_str().to_string()))
            .bind(("rows", rows))
            .await?
            .check()?;
        debug!(project_id = %project_id, %subdir, count = files.len(), "replaced file index");
        Ok(())
    }

    async fn upsert_file(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        file: FileRecord,
    ) -> StorageResult<()> {
        let row = FileRow::new(&project_id.0, subdir, &file);
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE files WHERE project_id = $pid AND subdir = $subdir AND path = $path;
                CREATE files CONTENT $row;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("pid", project_id.0.clone()))
            .bind(("subdir", subdir.as_str().to_string()))
            .bind(("path", file.path.clone()))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    async fn remove_path(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        path: &str,
    ) -> StorageResult<()> {
        self.db
            .query(
                "DELETE files WHERE project_id = $pid AND subdir = $subdir \
                 AND (path = $path OR string::starts_with(path, $prefix))",
            )
            .bind(("pid", project_id.0.clone()))
            .bind(("subdir", subdir.as_str().to_string()))
            .bind(("path", path.to_string()))
            .bind(("prefix", format!("{path}/")))
            .await?
            .check()?;
        Ok(())
    }

    async fn list_files(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
    ) -> StorageResult<Vec<FileRecord>> {
        let rows: Vec<FileRow> = self
            .rows(
                "SELECT project_id, subdir, path, size, digest FROM files \
                 WHERE project_id = $pid AND subdir = $subdir ORDER BY path ASC"
                    .to_string(),
                vec![
                    ("pid", project_id.0.clone()),
                    ("subdir", subdir.as_str().to_string()),
                ],
            )
            .await?;
        rows.into_iter().map(Self::row_to_file).collect()
    }
}
