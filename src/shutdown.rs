//! Graceful shutdown on SIGTERM/SIGINT.

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Listens for termination signals and cancels a shared token when one
/// arrives, letting the HTTP server drain in-flight requests.
pub struct Shutdown {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Shutdown {
    pub fn install() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let signal_token = token.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received"),
                _ = sigint.recv() => tracing::info!("SIGINT received"),
            }
            signal_token.cancel();
        });
        tracker.close();

        Ok(Shutdown { tracker, token })
    }

    /// Token to hand to subsystems that should stop on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits until a signal has been handled.
    pub async fn finished(&self) {
        self.token.cancelled().await;
        self.tracker.wait().await;
    }
}
