use async_trait::async_trait;
use remotex_state::{FileRecord, Subdir};

use crate::domain::{BuildOptions, Result};

/// File operations on the far side of a sync.
///
/// Paths are relative to the subdir root and already validated by the
/// caller.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn list_files(&self, subdir: Subdir) -> Result<Vec<FileRecord>>;

    async fn upload(&self, subdir: Subdir, path: &str, data: Vec<u8>) -> Result<()>;

    async fn download(&self, subdir: Subdir, path: &str) -> Result<Vec<u8>>;

    async fn delete(&self, subdir: Subdir, path: &str) -> Result<()>;
}

/// Remote build trigger.
#[async_trait]
pub trait BuildEndpoint: Send + Sync {
    /// Run a build and return the driver output. A driver failure is
    /// `RemotexError::Driver` carrying the output.
    async fn build(&self, options: &BuildOptions) -> Result<String>;
}
