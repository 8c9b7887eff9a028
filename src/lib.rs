//! Broker-backed message consumption server
//!
//! This library runs named message handlers against Kafka and RocketMQ
//! topics with per-topic local retry, dead-letter forwarding, at-least-once
//! offset commits and a coordinated, bounded graceful shutdown. A second
//! server variant runs named one-shot jobs under the same lifecycle.
//!
//! # Example
//!
//! ```no_run
//! use xserver_rs::bootstrap::hooks::{flush_tracing, init_tracing, LogSettings};
//! use xserver_rs::consumer::handler_fn;
//! use xserver_rs::server::{ConsumerServer, Server};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut server = ConsumerServer::new(None);
//! server.add_start_hook(init_tracing(LogSettings::default()));
//! server.add_stop_hook(flush_tracing());
//! server.add_handler("orders", handler_fn(|_topic, payload, _extra| {
//!     tracing::info!("order of {} bytes", payload.len());
//!     Ok(())
//! }));
//!
//! // Returns after SIGINT/SIGTERM, once consumers drained and stop hooks ran
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

/// Start/stop hooks, signals and logging install
pub mod bootstrap;

/// Broker consumers, handlers, retry and dead-letter forwarding
pub mod consumer;

/// Consumer and job servers
pub mod server;

/// Exit signal and bounded waits
pub mod shutdown;

/// OpenTelemetry integration for distributed tracing
#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use bootstrap::hooks::{init_tracing, LogSettings};
pub use bootstrap::LifecycleCoordinator;
pub use consumer::{ConsumerError, ConsumerManager, ConsumerResult, ConsumerSettings, HandlerRegistry};
pub use server::{ConsumerServer, JobServer, Server, ServerError, ServerResult, ShutdownTrigger};
pub use shutdown::{DrainOutcome, ExitSignal};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
