//! Process-wide shutdown: one token shared by the serve loop and every session.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::server::ServerHandle;

/// Grace period for the serve loop to drain before giving up on it.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token to hand to [`crate::server::start`].
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve on Ctrl-C, or when shutdown was triggered some other way.
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
                info!("interrupt received");
            }
            () = self.token.cancelled() => {}
        }
    }

    /// Cancel the token and wait up to `timeout` for the server to stop.
    ///
    /// Returns `false` if the serve loop was still running at the deadline.
    pub async fn drain(&self, server: ServerHandle, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(
            parties = server.state().registry.len(),
            timeout_ms = timeout.as_millis() as u64,
            "draining server"
        );

        match tokio::time::timeout(timeout, server.wait()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "server exited with error");
                true
            }
            Err(_) => {
                warn!("shutdown timed out after {timeout:?}");
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
