//! Process signals and the ordered graceful shutdown.

use std::sync::Arc;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::channel::CloseReason;
use super::server::Server;
use crate::discovery::Discovery;

/// What a shutdown achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Registered channels asked to close gracefully.
    pub closed: usize,
    /// Whether every connection task finished within the grace period.
    pub drained: bool,
    /// Channels torn down after the grace period ran out.
    pub force_closed: usize,
}

pub struct Lifecycle {
    server: Arc<Server>,
    control: CancellationToken,
    discovery: Option<(Arc<dyn Discovery>, CancellationToken)>,
}

impl Lifecycle {
    /// `control` stops the control-plane server once channels are drained.
    pub fn new(server: Arc<Server>, control: CancellationToken) -> Self {
        Self {
            server,
            control,
            discovery: None,
        }
    }

    /// Deregister from the service directory on shutdown and stop the
    /// renewal loop behind `renewal`.
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>, renewal: CancellationToken) -> Self {
        self.discovery = Some((discovery, renewal));
        self
    }

    /// Stop accepting, close every channel, wait up to the configured grace
    /// for connection tasks, force-close the rest, then stop the control
    /// plane and release the directory registration.
    pub async fn shutdown(&self) -> ShutdownReport {
        let grace = self.server.config().shutdown_grace;

        self.server.listener_token().cancel();
        let closed = self.server.close_all(CloseReason::Shutdown);
        tracing::info!(closed, grace_ms = grace.as_millis() as u64, "draining channels");

        let tasks = self.server.tasks();
        tasks.close();
        let drained = time::timeout(grace, tasks.wait()).await.is_ok();
        if !drained {
            tracing::warn!(remaining = tasks.len(), "grace period elapsed, forcing close");
        }
        // Anything still indexed has no task left to clean it up.
        let force_closed = self.server.force_close_all();

        self.control.cancel();
        if let Some((discovery, renewal)) = &self.discovery {
            renewal.cancel();
            if let Err(e) = discovery.cancel().await {
                tracing::warn!(error = %e, "failed to cancel discovery registration");
            }
        }

        let report = ShutdownReport {
            closed,
            drained,
            force_closed,
        };
        tracing::info!(?report, "shutdown complete");
        report
    }
}

/// Block until SIGINT, SIGTERM or SIGQUIT. SIGHUP is logged and ignored.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = sigquit.recv() => tracing::info!("received SIGQUIT"),
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, ignoring");
                continue;
            }
        }
        return Ok(());
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c");
    Ok(())
}
