//! Server and lifecycle errors

use crate::consumer::error::ConsumerError;
use thiserror::Error;

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that end `serve()`
#[derive(Error, Debug)]
pub enum ServerError {
    /// A start hook failed; later hooks did not run and nothing was started
    #[error("start hook {index} failed: {source}")]
    StartHook {
        /// Position of the hook in registration order
        index: usize,
        /// Error returned by the hook
        source: anyhow::Error,
    },

    /// Consumer configuration or construction failed
    #[error("consumer startup failed: {0}")]
    Consumer(#[from] ConsumerError),

    /// No job could be selected
    #[error("job selection failed: {0}")]
    JobSelection(String),
}
