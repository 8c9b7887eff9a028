//! Broker-backed message consumption
//!
//! This module runs one or more broker families side by side:
//! - Named handlers bound to topics through a [`HandlerRegistry`]
//! - Per-topic local retry with dead-letter forwarding or drop
//! - Offsets committed exactly once per unit, after its terminal outcome
//! - One process-wide dead-letter publisher built on first demand
//! - Periodic success/failure stats per family
//! - Bounded, parallel drain of every family on close
//!
//! # Example
//!
//! ```no_run
//! use xserver_rs::consumer::{handler_fn, ConsumerManager, ConsumerSettings, HandlerRegistry};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = HandlerRegistry::builder()
//!     .register("orders", handler_fn(|topic, payload, _extra| {
//!         tracing::info!("{}: {} bytes", topic, payload.len());
//!         Ok(())
//!     }))
//!     .build();
//!
//! let settings = ConsumerSettings::load(None)?;
//! let manager = ConsumerManager::builder(settings, registry).build().await?;
//!
//! // ... until shutdown is requested
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod handler;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod manager;
pub mod memory;
pub mod retry;
pub mod rocketmq;
pub mod stats;
pub mod unit;
pub mod worker;

pub use broker::{BrokerConsumer, BrokerFamily, BrokerKind, ConsumerState, TopicPlan};
pub use config::{
    ConsumeFromWhere, ConsumerMode, ConsumerOptions, ConsumerSettings, EnabledFamilies, KafkaTopicConfig,
    RocketMqCredentials, RocketMqTopicConfig, SaslConfig,
};
pub use dead_letter::{DeadLetterForwarder, PublishReceipt, Publisher, SharedPublisher};
pub use error::{ConsumerError, ConsumerResult};
pub use handler::{async_handler_fn, handler_fn, BoundHandler, HandlerError, HandlerRegistry, MessageHandler};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaFamily, KafkaPublisher, KafkaSource};
pub use manager::{ConsumerManager, ConsumerManagerBuilder};
pub use memory::{MemoryFamily, MemoryFeeder, MemoryProbe, MemorySource};
pub use retry::{RetryDecision, RetryPolicy};
pub use rocketmq::{RocketMqClient, RocketMqConsumerOptions, RocketMqMessage, RocketMqSubscription};
pub use stats::{StatCounters, StatSnapshot};
pub use unit::{CommitToken, ConsumptionUnit, Delivery, UnitSource};
pub use worker::UnitOutcome;
