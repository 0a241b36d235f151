//! remotex-core: the sync engine of the remotex build service
//!
//! ## Layer 1 - Sync
//!
//! Keeps a client project tree and its server copy identical with whole-file
//! transfers, and owns everything the build layer shares with it.
//!
//! ## Key Components
//!
//! - `manifest`: streaming-hash scans of a subdir and directional diffs
//! - `path_guard`: rejection of paths that would escape a subdir
//! - `project::ProjectService`: server-side project trees plus file index
//! - `sync`: push/pull reconciliation over a `RemoteEndpoint`, and the
//!   build round trip
//! - `domain`: `RemotexError`, `BuildOptions`, `BuildPolicy`

pub mod domain;
pub mod manifest;
pub mod path_guard;
pub mod project;
pub mod sync;
pub mod telemetry;
pub mod tree;

pub use domain::{
    BuildOptions, BuildPolicy, Engine, ErrorKind, RemotexError, Result, ValidationError,
};
pub use manifest::{diff, scan_manifest, DiffResult, ScanReport, SkippedFile};
pub use path_guard::{validate_name, validate_relative_path};
pub use project::{ProjectHandle, ProjectService, ProjectSummary};
pub use sync::{
    build_and_sync, clone_into, pull, push, BuildEndpoint, BuildSyncReport, HttpRemote,
    HttpRemoteConfig, RemoteEndpoint, SyncReport,
};
