//! Row definitions for the remotex SurrealDB tables
//!
//! Tables:
//! - users: account names
//! - projects: per-owner projects (unique `owner, name`)
//! - builds: build attempts, one row per attempt
//! - files: last scanned listing per `(project, subdir)`
//!
//! Rows carry plain strings and integers; conversion to the
//! `storage_traits` types happens in `surreal_store` at the boundary.
//! Timestamps are kept twice: RFC 3339 for display and microseconds for
//! ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{
    BuildRecord, BuildStatus, FailureReason, FileRecord, ProjectRecord, Subdir, UserRecord,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub created_us: i64,
}

impl From<&UserRecord> for UserRow {
    fn from(r: &UserRecord) -> Self {
        Self {
            name: r.name.clone(),
            created_at: r.created_at,
            created_us: r.created_at.timestamp_micros(),
        }
    }
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        Self {
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRow {
    pub project_id: String,
    pub owner: String,
    pub name: String,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub created_us: i64,
}

impl From<&ProjectRecord> for ProjectRow {
    fn from(r: &ProjectRecord) -> Self {
        Self {
            project_id: r.project_id.0.clone(),
            owner: r.owner.clone(),
            name: r.name.clone(),
            public: r.public,
            created_at: r.created_at,
            created_us: r.created_at.timestamp_micros(),
        }
    }
}

impl From<ProjectRow> for ProjectRecord {
    fn from(row: ProjectRow) -> Self {
        Self {
            project_id: crate::ProjectId(row.project_id),
            owner: row.owner,
            name: row.name,
            public: row.public,
            created_at: row.created_at,
        }
    }
}

/// Build attempt row.
///
/// `state` is one of `pending`, `finished`, `failed`. A failed row with
/// `exit_code` unset failed for internal reasons.
///
/// `pending_key` holds the project id while the row is pending and the
/// build id once it is terminal, so a unique index on it admits at most
/// one pending row per project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRow {
    pub build_id: String,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub started_us: i64,
    pub duration_ms: u64,
    pub state: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub options: serde_json::Value,
    pub output: String,
    pub pending_key: String,
}

impl BuildRow {
    /// Value of `pending_key` for a row in `status`.
    pub fn pending_key(project_id: &str, build_id: &str, status: &BuildStatus) -> String {
        if status.is_terminal() {
            build_id.to_string()
        } else {
            project_id.to_string()
        }
    }

    /// Split a status into its `(state, exit_code)` columns.
    pub fn status_columns(status: &BuildStatus) -> (&'static str, Option<i32>) {
        match status {
            BuildStatus::Pending => ("pending", None),
            BuildStatus::Finished => ("finished", None),
            BuildStatus::Failed(FailureReason::ExitCode(code)) => ("failed", Some(*code)),
            BuildStatus::Failed(FailureReason::Internal) => ("failed", None),
        }
    }

    pub fn status(&self) -> Option<BuildStatus> {
        match (self.state.as_str(), self.exit_code) {
            ("pending", _) => Some(BuildStatus::Pending),
            ("finished", _) => Some(BuildStatus::Finished),
            ("failed", Some(code)) => Some(BuildStatus::Failed(FailureReason::ExitCode(code))),
            ("failed", None) => Some(BuildStatus::Failed(FailureReason::Internal)),
            _ => None,
        }
    }
}

impl From<&BuildRecord> for BuildRow {
    fn from(r: &BuildRecord) -> Self {
        let (state, exit_code) = BuildRow::status_columns(&r.status);
        Self {
            build_id: r.build_id.0.clone(),
            project_id: r.project_id.0.clone(),
            started_at: r.started_at,
            started_us: r.started_at.timestamp_micros(),
            duration_ms: r.duration_ms,
            state: state.to_string(),
            exit_code,
            options: r.options.clone(),
            output: r.output.clone(),
            pending_key: BuildRow::pending_key(&r.project_id.0, &r.build_id.0, &r.status),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRow {
    pub project_id: String,
    pub subdir: String,
    pub path: String,
    pub size: u64,
    pub digest: String,
}

impl FileRow {
    pub fn new(project_id: &str, subdir: Subdir, file: &FileRecord) -> Self {
        Self {
            project_id: project_id.to_string(),
            subdir: subdir.as_str().to_string(),
            path: file.path.clone(),
            size: file.size,
            digest: file.digest.as_str().to_string(),
        }
    }
}
