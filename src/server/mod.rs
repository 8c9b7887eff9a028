//! Long-running server variants sharing one lifecycle
//!
//! Both variants run their start hooks, do their work until it finishes or a
//! shutdown is requested, drain, run their stop hooks, wait out a grace
//! period and return from `serve()`.

pub mod consumer;
pub mod error;
pub mod job;

pub use consumer::ConsumerServer;
pub use error::{ServerError, ServerResult};
pub use job::{Job, JobSelector, JobServer, NamedJobSelector};

use crate::bootstrap::signal::ShutdownSignals;
use crate::shutdown::ExitSignal;
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Pause between the stop hooks and the return of `serve()`
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// A server with start/stop hooks
#[async_trait]
pub trait Server: Send {
    /// Register a hook run, in order, before serving; a failure aborts `serve()`
    fn add_start_hook<F>(&mut self, hook: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static;

    /// Register a hook run, in order, after the work drained
    fn add_stop_hook<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static;

    /// Run until the work finishes or shutdown is requested
    async fn serve(self) -> ServerResult<()>;
}

/// Requests shutdown of a running server, like SIGINT or SIGTERM would
#[derive(Debug, Clone, Default)]
pub struct ShutdownTrigger {
    signal: ExitSignal,
}

impl ShutdownTrigger {
    /// Request shutdown; repeated calls have no further effect
    pub fn fire(&self) {
        self.signal.fire();
    }

    /// Whether shutdown was requested
    pub fn is_fired(&self) -> bool {
        self.signal.is_fired()
    }

    pub(crate) async fn fired(&self) {
        self.signal.fired().await
    }
}

/// Fires a trigger on SIGINT or SIGTERM until dropped
pub(crate) struct SignalListener {
    task: JoinHandle<()>,
}

impl SignalListener {
    /// Register the process signal handlers and forward the first signal to
    /// `trigger`. Handlers are registered before this returns, so a signal
    /// arriving during startup still requests shutdown.
    pub(crate) fn spawn(trigger: &ShutdownTrigger) -> Self {
        let mut signals = ShutdownSignals::install();
        let trigger = trigger.clone();
        let task = tokio::spawn(async move {
            signals.recv().await;
            trigger.fire();
        });
        Self { task }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wait until shutdown is requested by a signal or the trigger
pub(crate) async fn wait_for_shutdown(trigger: &ShutdownTrigger) {
    trigger.fired().await;
    tracing::info!(target: "xserver.server", "shutdown requested");
}
