//! Graceful shutdown handling
//!
//! One coordinator is shared by the acceptor, the request processor, the
//! transaction executor, and the governor ticker; each selects on
//! [`ShutdownCoordinator::wait`]. The durable queue makes a hard stop safe
//! (unapplied mutations replay on restart), so the loops exit after their
//! current item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shutdown coordinator for graceful termination
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("requested", &self.requested.load(Ordering::SeqCst))
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent; every waiter wakes once.
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
            self.notify.notify_waiters();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve when shutdown has been requested, immediately if it already
    /// was. Safe to use inside `select!`.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Install SIGINT/SIGTERM handlers that request shutdown.
    pub fn install_signal_handlers(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                let mut sigint =
                    signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
                let mut sigterm =
                    signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

                tokio::select! {
                    _ = sigint.recv() => {
                        warn!("received SIGINT, shutting down");
                        coordinator.request();
                    }
                    _ = sigterm.recv() => {
                        warn!("received SIGTERM, shutting down");
                        coordinator.request();
                    }
                }
            }

            #[cfg(not(unix))]
            {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
                warn!("received Ctrl+C, shutting down");
                coordinator.request();
            }
        })
    }
}
