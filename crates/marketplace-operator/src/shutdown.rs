//! Process-wide cancellation and completion signals

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Broadcast shutdown signal shared by every long-running loop.
///
/// Clones observe the same signal. A shutdown may carry a terminal failure,
/// which the status reporter leaves visible in its final write.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    failure: Arc<OnceLock<String>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful shutdown
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Request shutdown because of a terminal error. Only the first error is kept.
    pub fn fail(&self, error: impl std::fmt::Display) {
        let _ = self.failure.set(error.to_string());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown was requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The terminal error, if the shutdown was caused by one
    pub fn failure(&self) -> Option<String> {
        self.failure.get().cloned()
    }
}

/// Single-fire completion notification with any number of waiters.
#[derive(Debug, Clone, Default)]
pub struct ReportingDone {
    token: CancellationToken,
}

impl ReportingDone {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fire the notification; later calls are no-ops
    pub(crate) fn complete(&self) {
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the reporter has performed its final write
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}
