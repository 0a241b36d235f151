//! Error types for remotex-state

use thiserror::Error;

/// Errors surfaced by persistence backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No user with that name
    #[error("user not found: {user}")]
    UserNotFound { user: String },

    /// A user with that name already exists
    #[error("user already exists: {user}")]
    UserExists { user: String },

    /// No project with that owner/name pair
    #[error("project not found: {owner}/{name}")]
    ProjectNotFound { owner: String, name: String },

    /// Project names are unique per owner
    #[error("project already exists: {owner}/{name}")]
    ProjectExists { owner: String, name: String },

    /// No build with that ID
    #[error("build not found: {build_id}")]
    BuildNotFound { build_id: String },

    /// A build is already pending for the project
    #[error("build {build_id} already pending for project {project_id}")]
    BuildInProgress { project_id: String, build_id: String },

    /// Build is not in the state the operation requires
    #[error("build {build_id} is {status}, expected {expected}")]
    InvalidBuildState {
        build_id: String,
        status: String,
        expected: String,
    },

    /// Digest string is not 64 hex characters
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// Backend (database) failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization failure
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether this error means the addressed entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::UserNotFound { .. }
                | StorageError::ProjectNotFound { .. }
                | StorageError::BuildNotFound { .. }
        )
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
