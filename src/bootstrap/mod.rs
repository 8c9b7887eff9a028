//! Ordered start and stop hooks shared by every server variant

pub mod hooks;
pub mod signal;

use crate::server::error::{ServerError, ServerResult};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, info};

const TAG: &str = "xserver.bootstrap";

/// A hook run before a server starts serving; an error aborts the start
pub type StartHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A hook run after a server drained its work
pub type StopHook = Box<dyn FnOnce() + Send>;

/// Ordered start and stop hooks.
///
/// Start hooks run in registration order and stop at the first failure. Stop
/// hooks run in registration order, all of them, exactly once.
#[derive(Default)]
pub struct LifecycleCoordinator {
    start_hooks: Vec<StartHook>,
    stop_hooks: Vec<StopHook>,
}

impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("start_hooks", &self.start_hooks.len())
            .field("stop_hooks", &self.stop_hooks.len())
            .finish()
    }
}

impl LifecycleCoordinator {
    /// Create a coordinator without hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a start hook
    pub fn add_start_hook<F>(&mut self, hook: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.start_hooks.push(Box::new(hook));
    }

    /// Register a stop hook
    pub fn add_stop_hook<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop_hooks.push(Box::new(hook));
    }

    /// Number of start hooks not yet run
    pub fn pending_start_hooks(&self) -> usize {
        self.start_hooks.len()
    }

    /// Number of stop hooks not yet run
    pub fn pending_stop_hooks(&self) -> usize {
        self.stop_hooks.len()
    }

    /// Run start hooks in order, stopping at the first failure.
    ///
    /// Hooks after the failing one never run.
    pub fn run_start(&mut self) -> ServerResult<()> {
        for (index, hook) in std::mem::take(&mut self.start_hooks).into_iter().enumerate() {
            if let Err(source) = hook() {
                return Err(ServerError::StartHook { index, source });
            }
        }
        Ok(())
    }

    /// Run every stop hook in order.
    ///
    /// A panicking hook is logged and the remaining hooks still run.
    pub fn run_stop(&mut self) {
        let hooks = std::mem::take(&mut self.stop_hooks);
        info!(target: TAG, "running {} stop hooks", hooks.len());
        for (index, hook) in hooks.into_iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                error!(target: TAG, "stop hook {} panicked", index);
            }
        }
    }
}
