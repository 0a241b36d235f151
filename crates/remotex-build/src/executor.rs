use async_trait::async_trait;
use remotex_core::Result;

use crate::context::BuildContext;
use crate::flags::BuildJob;

/// Runs the driver for one build.
///
/// Returns the merged driver output on success. A non-zero exit is
/// `RemotexError::Driver` with the output; timeouts, cancellation and
/// infrastructure failures are `RemotexError::Internal`.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(&self, job: &BuildJob, ctx: &BuildContext) -> Result<String>;
}
