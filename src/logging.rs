//! Logging collaborator consumed by the rate limiter.

use tracing::{debug, info};

/// Sink for the limiter's diagnostic messages.
///
/// Implementations are expected not to fail.
pub trait Logger: Send + Sync {
    /// Diagnostic detail, e.g. how long a caller is about to wait.
    fn debug(&self, message: &str);

    /// Lifecycle events.
    fn info(&self, message: &str);
}

/// Forwards messages to the `tracing` dispatcher under the `kronos` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        debug!(target: "kronos", "{}", message);
    }

    fn info(&self, message: &str) {
        info!(target: "kronos", "{}", message);
    }
}
