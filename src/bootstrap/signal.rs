//! Process termination signals

use tokio::signal;
use tracing::{error, info};

const TAG: &str = "xserver.bootstrap.signal";

/// SIGINT and SIGTERM handlers, registered when created.
///
/// A signal delivered after [`ShutdownSignals::install`] returns is kept
/// until [`ShutdownSignals::recv`] is polled, so it can be installed before
/// a slow startup and awaited afterwards.
#[derive(Debug)]
pub struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: Option<signal::unix::Signal>,
    #[cfg(unix)]
    terminate: Option<signal::unix::Signal>,
}

impl ShutdownSignals {
    /// Register the handlers now. Must be called inside a tokio runtime.
    ///
    /// A handler that cannot be registered is logged and never fires, so the
    /// other signal still works.
    pub fn install() -> Self {
        #[cfg(unix)]
        {
            Self {
                interrupt: register(signal::unix::SignalKind::interrupt(), "SIGINT"),
                terminate: register(signal::unix::SignalKind::terminate(), "SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    /// Wait for the first SIGINT or SIGTERM
    #[cfg(unix)]
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = next(&mut self.interrupt) => {
                info!(target: TAG, "received SIGINT, initiating graceful shutdown");
            }
            _ = next(&mut self.terminate) => {
                info!(target: TAG, "received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    /// Wait for Ctrl+C
    #[cfg(not(unix))]
    pub async fn recv(&mut self) {
        match signal::ctrl_c().await {
            Ok(()) => info!(target: TAG, "received Ctrl+C, initiating graceful shutdown"),
            Err(err) => {
                error!(target: TAG, "failed to install Ctrl+C handler: {}", err);
                std::future::pending::<()>().await
            }
        }
    }
}

#[cfg(unix)]
fn register(kind: signal::unix::SignalKind, name: &str) -> Option<signal::unix::Signal> {
    match signal::unix::signal(kind) {
        Ok(sig) => Some(sig),
        Err(err) => {
            error!(target: TAG, "failed to install {} handler: {}", name, err);
            None
        }
    }
}

#[cfg(unix)]
async fn next(sig: &mut Option<signal::unix::Signal>) {
    if let Some(sig) = sig {
        if sig.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}
