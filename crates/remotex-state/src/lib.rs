//! remotex-state: persistence for the remotex build service
//!
//! ## Layer 0 - Data/Persistence
//!
//! Owns the durable records the service keeps about projects: who owns
//! them, which builds ran and how they ended, and the last scanned file
//! listing of every project subdir.
//!
//! ## Key Components
//!
//! - `storage_traits`: `ProjectCatalog`, `BuildLedger`, `FileIndex` and the
//!   content-addressing types they speak (`ContentDigest`, `FileRecord`)
//! - `SurrealStore`: SurrealDB implementation of all three traits
//! - `fakes::MemoryStore`: in-memory implementation for tests

mod error;
pub mod fakes;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use storage_traits::{
    BuildId, BuildLedger, BuildOutcome, BuildRecord, BuildStatus, ContentDigest, FailureReason,
    FileIndex, FileRecord, Persistence, ProjectCatalog, ProjectId, ProjectRecord, StorageResult,
    Subdir, UnknownSubdir, UserRecord,
};
pub use surreal_store::SurrealStore;

/// Result type for remotex-state operations
pub type Result<T> = std::result::Result<T, StorageError>;
