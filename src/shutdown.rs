//! Cooperative cancellation for jobs and the scheduler
//!
//! One [`ShutdownCoordinator`] is shared by the Ctrl+C listener, the
//! scheduler loop and every chunk loop. Chunk loops poll it between chunks,
//! so a shutdown never lands in the middle of a chunk write or a cursor
//! update. The scheduler awaits it instead of sleeping out its interval.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shared handle to a shutdown coordinator
pub type SharedShutdown = Arc<ShutdownCoordinator>;

static PROCESS_SHUTDOWN: OnceCell<SharedShutdown> = OnceCell::new();

/// Make `handle` the process-wide coordinator
///
/// Returns `false` if one was already installed; the first one stays.
pub fn install_global(handle: SharedShutdown) -> bool {
    PROCESS_SHUTDOWN.set(handle).is_ok()
}

/// The process-wide coordinator, if [`install_global`] was called
pub fn global() -> Option<SharedShutdown> {
    PROCESS_SHUTDOWN.get().cloned()
}

/// Request shutdown on `handle` when the process receives Ctrl+C
pub fn listen_for_ctrl_c(handle: SharedShutdown) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl+C received, stopping after the current chunk");
                handle.request_shutdown();
            }
            Err(e) => warn!(error = %e, "Could not listen for Ctrl+C"),
        }
    });
}

/// Latching shutdown flag that async tasks can wait on
///
/// Once requested it stays requested. Waiters that subscribe after the
/// request return immediately.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    requested: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Coordinator with no shutdown requested
    pub fn new() -> Self {
        let (requested, _) = watch::channel(false);
        Self { requested }
    }

    /// New coordinator behind an [`Arc`]
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Latch the flag and wake every waiter
    ///
    /// Returns `true` for the call that flipped the flag.
    pub fn request_shutdown(&self) -> bool {
        let flipped = self.requested.send_if_modified(|requested| !std::mem::replace(requested, true));
        if flipped {
            info!("Shutdown requested");
        }
        flipped
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Resolve once shutdown is requested
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.requested.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|requested| *requested).await;
    }
}
