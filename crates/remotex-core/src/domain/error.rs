//! Error taxonomy shared by the sync and build layers.

use remotex_state::{StorageError, UnknownSubdir};

/// Input that fails validation before anything is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    #[error(transparent)]
    UnknownSubdir(#[from] UnknownSubdir),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid document {document:?}: {reason}")]
    InvalidDocument {
        document: String,
        reason: &'static str,
    },

    #[error("file {path} is {size} bytes, limit is {limit}")]
    FileTooLarge { path: String, size: u64, limit: u64 },
}

/// Transport-facing class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Driver,
    Internal,
    Conflict,
    NotFound,
    Unrecoverable,
}

/// remotex errors.
#[derive(Debug, thiserror::Error)]
pub enum RemotexError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The driver ran to completion and exited non-zero.
    #[error("build driver exited with status {exit_code}")]
    Driver { exit_code: i32, output: String },

    /// Infrastructure failure, timeout or cancellation.
    #[error("internal error: {reason}")]
    Internal { reason: String, output: String },

    #[error("a build is already running for project {project}")]
    Conflict { project: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Isolation can no longer be guaranteed; the process must stop.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl RemotexError {
    /// Internal error without captured output.
    pub fn internal(reason: impl Into<String>) -> Self {
        RemotexError::Internal {
            reason: reason.into(),
            output: String::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RemotexError::Validation(_) => ErrorKind::Validation,
            RemotexError::Driver { .. } => ErrorKind::Driver,
            RemotexError::Internal { .. } => ErrorKind::Internal,
            RemotexError::Conflict { .. } => ErrorKind::Conflict,
            RemotexError::NotFound(_) => ErrorKind::NotFound,
            RemotexError::Unrecoverable(_) => ErrorKind::Unrecoverable,
        }
    }

    /// Captured driver output, if the error carries any.
    pub fn output(&self) -> Option<&str> {
        match self {
            RemotexError::Driver { output, .. } | RemotexError::Internal { output, .. } => {
                Some(output.as_str())
            }
            _ => None,
        }
    }

    /// Rewrite the captured output and any internal reason (used for
    /// redaction).
    pub fn map_text(self, f: impl Fn(&str) -> String) -> Self {
        match self {
            RemotexError::Driver { exit_code, output } => RemotexError::Driver {
                exit_code,
                output: f(&output),
            },
            RemotexError::Internal { reason, output } => RemotexError::Internal {
                reason: f(&reason),
                output: f(&output),
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for RemotexError {
    fn from(err: std::io::Error) -> Self {
        RemotexError::internal(format!("io: {err}"))
    }
}

impl From<StorageError> for RemotexError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UserNotFound { user } => RemotexError::NotFound(format!("user {user}")),
            StorageError::ProjectNotFound { owner, name } if owner.is_empty() => {
                RemotexError::NotFound(format!("project {name}"))
            }
            StorageError::ProjectNotFound { owner, name } => {
                RemotexError::NotFound(format!("project {owner}/{name}"))
            }
            StorageError::BuildNotFound { build_id } => {
                RemotexError::NotFound(format!("build {build_id}"))
            }
            StorageError::BuildInProgress { project_id, .. } => RemotexError::Conflict {
                project: project_id,
            },
            other => RemotexError::internal(format!("storage: {other}")),
        }
    }
}

/// Result type for remotex operations.
pub type Result<T> = std::result::Result<T, RemotexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_kinds() {
        let err: RemotexError = StorageError::ProjectNotFound {
            owner: "alice".into(),
            name: "thesis".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("alice/thesis"));

        let err: RemotexError = StorageError::BuildInProgress {
            project_id: "p1".into(),
            build_id: "b1".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: RemotexError = StorageError::Backend("disk full".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn driver_output_is_exposed_and_mappable() {
        let err = RemotexError::Driver {
            exit_code: 1,
            output: "/srv/p/src/main.tex:3: error".into(),
        };
        let err = err.map_text(|o| o.replace("/srv/p", "<project>"));
        assert_eq!(err.output(), Some("<project>/src/main.tex:3: error"));
        assert!(RemotexError::NotFound("x".into()).output().is_none());
    }

    #[test]
    fn internal_reason_is_rewritten_too() {
        let err = RemotexError::internal("/srv/p/out: permission denied")
            .map_text(|t| t.replace("/srv/p", "<project>"));
        assert_eq!(err.to_string(), "internal error: <project>/out: permission denied");
        assert_eq!(err.output(), Some(""));
    }
}
