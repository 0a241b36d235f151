//! File manifests: scanning a subdir into records and diffing two listings.

pub mod diff;
pub mod scan;

pub use diff::{diff, DiffResult};
pub use scan::{scan_manifest, ScanReport, SkippedFile};
