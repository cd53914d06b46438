//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is shared by the HTTP server and the config watcher.
//! [`ShutdownSignal::wait`] resolves on SIGINT, SIGTERM or a programmatic
//! [`ShutdownSignal::trigger`] and notifies every subscriber.
//!
//! # Example
//!
//! ```rust,ignore
//! use event_reactor::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let mut stop = shutdown.subscribe();
//!
//! tokio::spawn(async move {
//!     loop {
//!         tokio::select! {
//!             _ = stop.recv() => break,
//!             // ... work
//!         }
//!     }
//! });
//!
//! axum::serve(listener, app)
//!     .with_graceful_shutdown(async move { shutdown.wait().await })
//!     .await?;
//! ```

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Default time granted to background tasks after the server stops.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender, timeout }
    }

    /// Time background tasks get to finish once shutdown starts
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT, SIGTERM or [`trigger`](Self::trigger), then notify
    /// all subscribers.
    ///
    /// A signal handler that cannot be installed is logged and ignored; the
    /// remaining sources still work.
    pub async fn wait(&self) {
        let mut triggered = self.sender.subscribe();

        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = triggered.recv() => {
                return;
            }
        }

        let _ = self.sender.send(());
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));

        let signal = ShutdownSignal::with_timeout(Duration::from_secs(5));
        assert_eq!(signal.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        let mut receiver = signal.subscribe();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), receiver.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_returns_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.trigger();

        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_clone_receives_signal() {
        let signal = ShutdownSignal::new();
        let signal2 = signal.clone();

        let mut receiver1 = signal.subscribe();
        let mut receiver2 = signal2.subscribe();

        signal.trigger();

        assert!(receiver1.recv().await.is_ok());
        assert!(receiver2.recv().await.is_ok());
    }
}
