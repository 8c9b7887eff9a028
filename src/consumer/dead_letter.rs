//! Dead-letter forwarding over a single process-wide publisher

use crate::consumer::error::ConsumerResult;
use crate::consumer::retry::retry_bounded;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error};

const TAG: &str = "xserver.consumer.deadletter";

/// Publish attempts per forwarded unit
pub const DEFAULT_FORWARD_ATTEMPTS: u32 = 3;

/// Where a published record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Partition chosen by the key hash
    pub partition: i32,
    /// Offset assigned by the broker
    pub offset: i64,
}

/// Outbound connection used to publish dead letters.
///
/// Implementations must route records with equal keys to the same partition.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Publish one record and wait for the broker acknowledgement
    async fn publish(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> ConsumerResult<PublishReceipt>;
}

/// Lazily constructed publisher shared by every consumer that forwards dead letters.
///
/// Construction happens at most once, on first demand. Clones share the same
/// slot; no consumer owns or closes the publisher, it lives as long as the
/// last clone.
#[derive(Clone, Default)]
pub struct SharedPublisher {
    slot: Arc<OnceCell<Arc<dyn Publisher>>>,
}

impl fmt::Debug for SharedPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPublisher")
            .field("initialized", &self.slot.initialized())
            .finish()
    }
}

impl SharedPublisher {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot already holding a publisher
    pub fn with_publisher(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            slot: Arc::new(OnceCell::new_with(Some(publisher))),
        }
    }

    /// Return the publisher, constructing it with `init` if the slot is empty.
    ///
    /// Concurrent callers wait for the single in-flight construction. A failed
    /// construction leaves the slot empty.
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> ConsumerResult<Arc<dyn Publisher>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConsumerResult<Arc<dyn Publisher>>>,
    {
        self.slot.get_or_try_init(init).await.cloned()
    }

    /// The publisher, if constructed
    pub fn get(&self) -> Option<Arc<dyn Publisher>> {
        self.slot.get().cloned()
    }

    /// Whether construction already happened
    pub fn is_initialized(&self) -> bool {
        self.slot.initialized()
    }
}

/// Forwards units that exhausted their retries to a dead-letter topic
#[derive(Clone)]
pub struct DeadLetterForwarder {
    publisher: Arc<dyn Publisher>,
    max_attempts: u32,
}

impl fmt::Debug for DeadLetterForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterForwarder")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl DeadLetterForwarder {
    /// Create a forwarder with the default attempt bound
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            max_attempts: DEFAULT_FORWARD_ATTEMPTS,
        }
    }

    /// Set the publish attempt bound
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Publish a record to the dead-letter topic, retrying up to the bound.
    ///
    /// The final error is returned to the caller, which logs it and commits the
    /// original unit anyway.
    pub async fn forward(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> ConsumerResult<()> {
        let publisher = &self.publisher;
        let result = retry_bounded(self.max_attempts, |attempt| async move {
            publisher.publish(topic, key, value).await.map_err(|e| {
                error!(
                    target: TAG,
                    "[Fail Topic] send failed, topic:{}, attempt:{}, err:{}",
                    topic, attempt, e
                );
                e
            })
        })
        .await;

        match result {
            Ok(receipt) => {
                debug!(
                    target: TAG,
                    "[Fail Topic] sent, topic:{}, partition:{}, offset:{}",
                    topic, receipt.partition, receipt.offset
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
