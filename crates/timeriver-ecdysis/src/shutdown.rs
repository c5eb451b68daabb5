//! Shutdown signals and connection draining.
//!
//! - `SIGTERM` / `SIGINT` → stop accepting, drain, exit
//! - `SIGQUIT` → hand sockets to a successor, stop accepting, drain, exit
//!
//! Stopping is per socket (see [`GracefulSocket::stop`](crate::GracefulSocket::stop));
//! [`DrainTracker`] counts in-flight connections across all of them via
//! [`ConnectionGuard`]s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Signal indicating why shutdown was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM or SIGINT: graceful stop (drain and exit).
    Terminate,
    /// SIGQUIT: graceful restart (hand off sockets, drain old, exit).
    Restart,
}

/// Wait for a shutdown signal (SIGTERM, SIGINT or SIGQUIT).
pub async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
            ShutdownSignal::Terminate
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, initiating graceful shutdown");
            ShutdownSignal::Terminate
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT, initiating graceful restart");
            ShutdownSignal::Restart
        }
    };

    Ok(received)
}

/// Tracks one in-flight connection. Dropping it decrements the count.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Counts active connections so shutdown can wait for them to finish.
#[derive(Debug, Clone, Default)]
pub struct DrainTracker {
    connection_count: Arc<AtomicUsize>,
    drain_notify: Arc<Notify>,
}

impl DrainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `ConnectionGuard` for a new connection.
    ///
    /// Increments the counter on creation, decrements on drop.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: Arc::clone(&self.connection_count),
            notify: Arc::clone(&self.drain_notify),
        }
    }

    /// Get the current number of active connections.
    pub fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Wait for all connections to complete or for `timeout` to pass.
    ///
    /// Returns `true` if all connections drained, `false` if timed out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return true;
        }

        info!(
            active_connections = active,
            timeout_secs = timeout.as_secs(),
            "Draining active connections"
        );

        tokio::select! {
            _ = self.wait_for_drain() => {
                info!("All connections drained cleanly");
                true
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    remaining_connections = self.active_connections(),
                    timeout_secs = timeout.as_secs(),
                    "Drain timeout expired"
                );
                false
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drain_notify.notified();
            if self.connection_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
