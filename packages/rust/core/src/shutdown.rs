//! Signal-driven cancellation.
//!
//! The first Ctrl-C (or SIGTERM) cancels the shared token: pools stop
//! spawning, drain, and the pipeline performs its final save. A second
//! Ctrl-C exits immediately.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the run-wide cancellation token.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token threaded through scheduler and pools.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn request(&self, reason: &str) {
        if !self.token.is_cancelled() {
            info!(reason, "shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Listen for Ctrl-C / SIGTERM in the background.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = wait_for_signal() => {}
                () = coordinator.token.cancelled() => return,
            }
            coordinator.request("signal");
            eprintln!("\nShutting down: finishing in-flight work and saving state.");
            eprintln!("Press Ctrl+C again to force quit.");

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second interrupt, exiting without final save");
                std::process::exit(130);
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
