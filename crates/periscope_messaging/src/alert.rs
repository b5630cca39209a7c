//! User-facing alert hook.

/// Receives messages meant for the person using the host.
pub trait AlertSink: Send + Sync {
    /// Shows `message`.
    fn alert(&self, message: &str);
}

/// Logs alerts at `warn` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlert;

impl AlertSink for TracingAlert {
    fn alert(&self, message: &str) {
        tracing::warn!(target: "periscope::alert", "{message}");
    }
}
