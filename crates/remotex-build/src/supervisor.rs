//! Escalation of conditions that leave build isolation in doubt.
//!
//! Components holding a [`FatalReporter`] report a fatal condition and keep
//! going; the binary owning the [`Supervisor`] decides to stop the process.

use tokio::sync::mpsc;
use tracing::error;

/// A condition the process cannot safely continue from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub component: &'static str,
    pub reason: String,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.component, self.reason)
    }
}

/// Sending half, cloned into components.
#[derive(Debug, Clone)]
pub struct FatalReporter {
    tx: mpsc::UnboundedSender<FatalError>,
}

impl FatalReporter {
    pub fn report(&self, component: &'static str, reason: impl Into<String>) {
        let fatal = FatalError {
            component,
            reason: reason.into(),
        };
        error!(component, reason = %fatal.reason, "fatal condition reported");
        // a closed supervisor means shutdown is already underway
        let _ = self.tx.send(fatal);
    }
}

/// Receiving half, owned by the binary.
#[derive(Debug)]
pub struct Supervisor {
    rx: mpsc::UnboundedReceiver<FatalError>,
}

impl Supervisor {
    pub fn new() -> (Self, FatalReporter) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, FatalReporter { tx })
    }

    /// Wait for the first fatal report. `None` once every reporter is gone.
    pub async fn wait(&mut self) -> Option<FatalError> {
        self.rx.recv().await
    }

    /// A report already delivered, without waiting.
    pub fn try_next(&mut self) -> Option<FatalError> {
        self.rx.try_recv().ok()
    }
}
