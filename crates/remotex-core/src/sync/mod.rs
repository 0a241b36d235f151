//! Client/server tree reconciliation.
//!
//! `push` makes the remote subdir match the local one, `pull` the reverse.
//! Both diff full manifests and transfer whole files only; deletions are
//! applied before additions and a failed pass is fixed by re-running it.

pub mod http;
pub mod reconcile;
pub mod remote;
pub mod workflow;

pub use http::{HttpRemote, HttpRemoteConfig, EXIT_CODE_HEADER};
pub use reconcile::{pull, push, SyncReport};
pub use remote::{BuildEndpoint, RemoteEndpoint};
pub use workflow::{build_and_sync, clone_into, BuildSyncReport};
