//! Units of work pulled from a partition and the source seam that yields them

use crate::consumer::error::ConsumerResult;
use async_trait::async_trait;
use std::fmt;

/// Position to acknowledge once a unit reaches a terminal outcome.
///
/// Tokens are deliberately not `Clone`: committing consumes the token, so a
/// position can be signaled at most once.
#[derive(PartialEq, Eq, Hash)]
pub struct CommitToken {
    topic: String,
    partition: i32,
    offset: i64,
}

impl CommitToken {
    /// Create a token for a broker position
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Topic of the position
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition (or queue) of the position
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset of the position
    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl fmt::Debug for CommitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Message content handed to handlers and to the dead-letter forwarder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the message was read from
    pub topic: String,
    /// Message key, if any
    pub key: Option<Vec<u8>>,
    /// Message payload
    pub value: Vec<u8>,
    /// Partition (or queue) id
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Auxiliary keys passed to the handler (Kafka key, RocketMQ tags)
    pub extra: Vec<String>,
}

impl Delivery {
    /// Key rendered for logs
    pub fn key_lossy(&self) -> String {
        self.key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default()
    }
}

/// One message pulled from one partition, with its per-unit attempt counter
#[derive(Debug)]
pub struct ConsumptionUnit {
    delivery: Delivery,
    token: CommitToken,
    attempt: u32,
}

impl ConsumptionUnit {
    /// Wrap a delivery and the token acknowledging it
    pub fn new(delivery: Delivery, token: CommitToken) -> Self {
        Self {
            delivery,
            token,
            attempt: 0,
        }
    }

    /// Build a unit whose token points at the delivery's own position
    pub fn at_position(delivery: Delivery) -> Self {
        let token = CommitToken::new(delivery.topic.clone(), delivery.partition, delivery.offset);
        Self::new(delivery, token)
    }

    /// The message content
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Number of failed handler invocations so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record one more failed invocation
    pub fn record_failure(&mut self) {
        self.attempt += 1;
    }

    /// Release the commit token; the unit is consumed
    pub fn into_token(self) -> CommitToken {
        self.token
    }
}

/// Ordered stream of units for one partition worker.
///
/// Implementations wrap a broker client. `next_unit` returns `None` when the
/// underlying stream is closed for good; transport errors are returned as
/// `Some(Err(_))` and the worker keeps polling.
#[async_trait]
pub trait UnitSource: Send + 'static {
    /// Pull the next unit
    async fn next_unit(&mut self) -> Option<ConsumerResult<ConsumptionUnit>>;

    /// Acknowledge a unit that reached a terminal outcome
    async fn commit(&mut self, token: CommitToken) -> ConsumerResult<()>;

    /// Best-effort commit of every acknowledged position, called once on exit
    async fn flush(&mut self) -> ConsumerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery() -> Delivery {
        Delivery {
            topic: "orders".to_string(),
            key: Some(b"user-1".to_vec()),
            value: b"{}".to_vec(),
            partition: 3,
            offset: 42,
            extra: vec!["user-1".to_string()],
        }
    }

    #[test]
    fn test_unit_tracks_attempts() {
        let mut unit = ConsumptionUnit::at_position(delivery());
        assert_eq!(unit.attempt(), 0);
        unit.record_failure();
        unit.record_failure();
        assert_eq!(unit.attempt(), 2);

        let token = unit.into_token();
        assert_eq!(token.topic(), "orders");
        assert_eq!(token.partition(), 3);
        assert_eq!(token.offset(), 42);
        assert_eq!(format!("{:?}", token), "orders/3@42");
    }

    #[test]
    fn test_key_lossy() {
        assert_eq!(delivery().key_lossy(), "user-1");
        let mut d = delivery();
        d.key = None;
        assert_eq!(d.key_lossy(), "");
    }
}
