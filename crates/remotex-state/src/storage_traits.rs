//! Storage trait definitions for remotex
//!
//! These traits define the persistence surface the core consumes:
//! - `ProjectCatalog`: users and projects (name resolution, cascading delete)
//! - `BuildLedger`: build attempts (Pending -> terminal, append-only history)
//! - `FileIndex`: per-subdir file listings (the last scanned manifest)
//!
//! All traits are async and backend-agnostic. An in-memory fake is provided
//! for testing via the `fakes` module.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Content addressing
// ---------------------------------------------------------------------------

/// Content digest (SHA-256, lowercase hex).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes`/`from_reader` or validated via
/// `TryFrom<String>` (which is also what deserialization goes through).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        ContentDigest(hex::encode(Sha256::digest(data)))
    }

    /// Stream a reader to its end, returning the digest and the byte count.
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<(Self, u64)> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        Ok((ContentDigest(hex::encode(hasher.finalize())), total))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One file in a subdir listing.
///
/// Two records with equal `(path, digest)` describe identical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRecord {
    /// Slash-separated path relative to the subdir root
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// SHA-256 of the full file contents
    #[serde(rename = "sha256sum", alias = "hash")]
    pub digest: ContentDigest,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, size: u64, digest: ContentDigest) -> Self {
        Self {
            path: path.into(),
            size,
            digest,
        }
    }

    /// Build a record for in-memory content.
    pub fn from_content(path: impl Into<String>, data: &[u8]) -> Self {
        Self::new(path, data.len() as u64, ContentDigest::from_bytes(data))
    }
}

// ---------------------------------------------------------------------------
// Subdirs
// ---------------------------------------------------------------------------

/// The three fixed areas of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subdir {
    /// Build inputs
    Src,
    /// Intermediate artifacts
    Aux,
    /// Final outputs
    Out,
}

impl Subdir {
    pub const ALL: [Subdir; 3] = [Subdir::Src, Subdir::Aux, Subdir::Out];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subdir::Src => "src",
            Subdir::Aux => "aux",
            Subdir::Out => "out",
        }
    }
}

impl fmt::Display for Subdir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subdir name outside `src`, `aux`, `out`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown subdir: {0}")]
pub struct UnknownSubdir(pub String);

impl FromStr for Subdir {
    type Err = UnknownSubdir;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "src" => Ok(Subdir::Src),
            "aux" => Ok(Subdir::Aux),
            "out" => Ok(Subdir::Out),
            other => Err(UnknownSubdir(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectCatalog: users and projects
// ---------------------------------------------------------------------------

/// Unique identifier for a project
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new() -> Self {
        ProjectId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: ProjectId,
    pub owner: String,
    pub name: String,
    pub public: bool,
    pub created_at: DateTime<Utc>,
}

/// Users and their projects.
///
/// Guarantees:
/// - User names are unique; project names are unique per owner.
/// - `delete_project` also removes the project's builds and file rows.
#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn create_user(&self, name: &str) -> StorageResult<UserRecord>;

    async fn resolve_user(&self, name: &str) -> StorageResult<UserRecord>;

    /// Create a project owned by an existing user.
    async fn create_project(
        &self,
        owner: &str,
        name: &str,
        public: bool,
    ) -> StorageResult<ProjectRecord>;

    async fn resolve_project(&self, owner: &str, name: &str) -> StorageResult<ProjectRecord>;

    /// List an owner's projects, newest first.
    async fn list_projects(&self, owner: &str) -> StorageResult<Vec<ProjectRecord>>;

    /// Delete a project and cascade to its builds and file index rows.
    async fn delete_project(&self, project_id: &ProjectId) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// BuildLedger: build attempts
// ---------------------------------------------------------------------------

/// Unique identifier for a build attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildId(pub String);

impl BuildId {
    pub fn new() -> Self {
        BuildId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a build failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum FailureReason {
    /// The driver ran and exited with this status
    ExitCode(i32),
    /// Infrastructure failure, timeout or cancellation
    Internal,
}

/// Status of a build attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum BuildStatus {
    Pending,
    Finished,
    Failed(FailureReason),
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Pending)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Pending => f.write_str("pending"),
            BuildStatus::Finished => f.write_str("finished"),
            BuildStatus::Failed(FailureReason::ExitCode(code)) => write!(f, "failed ({code})"),
            BuildStatus::Failed(FailureReason::Internal) => f.write_str("failed (internal)"),
        }
    }
}

/// Full build record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: BuildId,
    pub project_id: ProjectId,
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration; zero while pending
    pub duration_ms: u64,
    pub status: BuildStatus,
    /// Snapshot of the options the build was started with
    pub options: serde_json::Value,
    /// Captured (redacted) driver output; empty while pending
    pub output: String,
}

/// Terminal data recorded when a build completes
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub status: BuildStatus,
    pub duration_ms: u64,
    pub output: String,
}

/// Build attempt ledger.
///
/// Guarantees:
/// - At most one `Pending` build per project; `begin_build` fails with
///   `StorageError::BuildInProgress` otherwise.
/// - A build transitions Pending → Finished | Failed exactly once.
/// - Records are never deleted except through `ProjectCatalog::delete_project`.
#[async_trait]
pub trait BuildLedger: Send + Sync {
    /// Record a new Pending build.
    async fn begin_build(
        &self,
        project_id: &ProjectId,
        options: serde_json::Value,
    ) -> StorageResult<BuildRecord>;

    /// Move a Pending build to its terminal status.
    async fn finish_build(
        &self,
        build_id: &BuildId,
        outcome: BuildOutcome,
    ) -> StorageResult<BuildRecord>;

    async fn get_build(&self, build_id: &BuildId) -> StorageResult<BuildRecord>;

    /// All builds of a project, newest first.
    async fn list_builds(&self, project_id: &ProjectId) -> StorageResult<Vec<BuildRecord>>;

    /// The project's pending build, if any.
    async fn pending_build(&self, project_id: &ProjectId) -> StorageResult<Option<BuildRecord>>;

    /// Fail every build still Pending that started before `started_before`,
    /// recording `output` as the reason. Returns the builds it failed.
    async fn abandon_stale_builds(
        &self,
        started_before: DateTime<Utc>,
        output: &str,
    ) -> StorageResult<Vec<BuildId>>;
}

// ---------------------------------------------------------------------------
// FileIndex: per-subdir listings
// ---------------------------------------------------------------------------

/// File listing rows per `(project, subdir)`.
#[async_trait]
pub trait FileIndex: Send + Sync {
    /// Replace every row of the subdir with `files` (a fresh scan).
    async fn replace_files(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        files: Vec<FileRecord>,
    ) -> StorageResult<()>;

    /// Insert or overwrite the row for `file.path`.
    async fn upsert_file(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        file: FileRecord,
    ) -> StorageResult<()>;

    /// Remove the row for `path` and every row below `path/`.
    async fn remove_path(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
        path: &str,
    ) -> StorageResult<()>;

    async fn list_files(
        &self,
        project_id: &ProjectId,
        subdir: Subdir,
    ) -> StorageResult<Vec<FileRecord>>;
}

/// Everything the core needs from persistence.
pub trait Persistence: ProjectCatalog + BuildLedger + FileIndex {}

impl<T: ProjectCatalog + BuildLedger + FileIndex> Persistence for T {}

/// Whether `candidate` equals `path` or lies below it.
pub(crate) fn path_is_within(candidate: &str, path: &str) -> bool {
    candidate == path
        || candidate
            .strip_prefix(path)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_from_reader_matches_from_bytes() {
        let data = vec![7u8; 200_000];
        let (digest, size) = ContentDigest::from_reader(data.as_slice()).unwrap();
        assert_eq!(digest, ContentDigest::from_bytes(&data));
        assert_eq!(size, 200_000);
    }

    #[test]
    fn digest_rejects_malformed_hex() {
        assert!(ContentDigest::try_from("abc".to_string()).is_err());
        assert!(ContentDigest::try_from("z".repeat(64)).is_err());
        let upper = "A".repeat(64);
        assert_eq!(
            ContentDigest::try_from(upper).unwrap().as_str(),
            "a".repeat(64)
        );
    }

    #[test]
    fn file_record_wire_shape() {
        let rec = FileRecord::from_content("a.tex", b"hello");
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["path"], "a.tex");
        assert_eq!(json["size"], 5);
        assert_eq!(json["sha256sum"], rec.digest.as_str());

        let aliased = serde_json::json!({
            "path": "a.tex",
            "size": 5,
            "hash": rec.digest.as_str(),
        });
        let back: FileRecord = serde_json::from_value(aliased).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn file_record_rejects_bad_digest_on_wire() {
        let bad = serde_json::json!({"path": "a", "size": 1, "sha256sum": "nope"});
        assert!(serde_json::from_value::<FileRecord>(bad).is_err());
    }

    #[test]
    fn subdir_parse_and_display() {
        for subdir in Subdir::ALL {
            assert_eq!(subdir.as_str().parse::<Subdir>().unwrap(), subdir);
        }
        assert!("tmp".parse::<Subdir>().is_err());
    }

    #[test]
    fn build_status_display() {
        assert_eq!(BuildStatus::Pending.to_string(), "pending");
        assert_eq!(BuildStatus::Finished.to_string(), "finished");
        assert_eq!(
            BuildStatus::Failed(FailureReason::ExitCode(12)).to_string(),
            "failed (12)"
        );
        assert_eq!(
            BuildStatus::Failed(FailureReason::Internal).to_string(),
            "failed (internal)"
        );
        assert!(!BuildStatus::Pending.is_terminal());
    }

    #[test]
    fn path_within() {
        assert!(path_is_within("img", "img"));
        assert!(path_is_within("img/a.png", "img"));
        assert!(!path_is_within("imgs/a.png", "img"));
    }
}
