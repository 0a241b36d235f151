//! remotex-build: running latexmk for the remotex build service
//!
//! ## Layer 2 - Build
//!
//! Takes a project tree owned by `remotex_core::ProjectService` and runs the
//! driver against it, either as a host subprocess or inside a network-less
//! container, under a deadline and cancellation signal.
//!
//! ## Key Components
//!
//! - `tracker::BuildTracker`: single in-flight build per project, ledger
//!   transitions, output redaction and index rescans
//! - `native::NativeExecutor` / `container::ContainerExecutor`: the two
//!   `BuildExecutor` implementations
//! - `context::BuildContext`: deadline plus cancel signal
//! - `supervisor`: escalation of unconfirmed container kills

pub mod config;
pub mod container;
pub mod context;
pub mod endpoint;
pub mod executor;
pub mod flags;
pub mod native;
pub mod redact;
pub mod supervisor;
pub mod tracker;

pub use config::{BuildMode, ServerConfig, DEFAULT_IMAGE};
pub use container::{
    ContainerError, ContainerExecutor, ContainerExit, ContainerRuntime, ContainerSpec, DockerCli,
    Mount, MountSource,
};
pub use context::{BuildContext, CancelHandle, CancelReason};
pub use endpoint::InProcessRemote;
pub use executor::BuildExecutor;
pub use flags::{driver_args, BuildJob, DriverDirs};
pub use native::NativeExecutor;
pub use redact::Redactor;
pub use supervisor::{FatalError, FatalReporter, Supervisor};
pub use tracker::{BuildReport, BuildTracker};
