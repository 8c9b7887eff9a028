//! RocketMQ broker family.
//!
//! The broker connection itself is provided by the embedding application
//! through [`RocketMqClient`]; this module turns its subscriptions into unit
//! sources and derives per-topic consumer options from the configuration.

use crate::consumer::broker::{BrokerFamily, BrokerKind, TopicPlan};
use crate::consumer::config::{ConsumeFromWhere, ConsumerMode, RocketMqCredentials, RocketMqTopicConfig};
use crate::consumer::dead_letter::{Publisher, SharedPublisher};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::retry::RetryPolicy;
use crate::consumer::unit::{CommitToken, ConsumptionUnit, Delivery, UnitSource};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const TAG: &str = "xserver.consumer.rocketmq";

/// Options for one RocketMQ consumer instance
#[derive(Debug, Clone, PartialEq)]
pub struct RocketMqConsumerOptions {
    /// Push or pull
    pub mode: ConsumerMode,
    /// Client instance name; unique per group and namespace (or topic)
    pub instance_name: String,
    /// Consumer group
    pub group: String,
    /// Name server addresses
    pub name_servers: Vec<String>,
    /// Broker-side redelivery count
    pub retry: i32,
    /// Start position for a new group
    pub consume_from: ConsumeFromWhere,
    /// Access credentials
    pub credentials: RocketMqCredentials,
    /// Namespace
    pub namespace: String,
    /// Topic
    pub topic: String,
    /// Tag selector expression; empty selects every tag
    pub tag_expression: String,
}

impl From<&RocketMqTopicConfig> for RocketMqConsumerOptions {
    fn from(config: &RocketMqTopicConfig) -> Self {
        Self {
            mode: config.consumer_mode,
            instance_name: config.instance_name(),
            group: config.consumer_group.clone(),
            name_servers: config.name_server.clone(),
            retry: config.retry,
            consume_from: config.offset,
            credentials: config.credentials.clone(),
            namespace: config.namespace.clone(),
            topic: config.topic.clone(),
            tag_expression: config.tags.clone(),
        }
    }
}

/// A message received from RocketMQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RocketMqMessage {
    /// Topic the message was read from
    pub topic: String,
    /// Message tags
    pub tags: String,
    /// Message keys, if any
    pub keys: Option<String>,
    /// Payload
    pub body: Vec<u8>,
    /// Queue the message came from
    pub queue_id: i32,
    /// Offset within the queue
    pub queue_offset: i64,
}

/// An active subscription of one consumer instance
#[async_trait]
pub trait RocketMqSubscription: Send + 'static {
    /// Next message; `None` once the subscription is shut down
    async fn next_message(&mut self) -> Option<ConsumerResult<RocketMqMessage>>;

    /// Report a message as consumed
    async fn ack(&mut self, topic: &str, queue_id: i32, queue_offset: i64) -> ConsumerResult<()>;

    /// Stop the consumer instance
    async fn shutdown(&mut self) -> ConsumerResult<()>;
}

/// Broker connection factory supplied by the application
#[async_trait]
pub trait RocketMqClient: Send + Sync + 'static {
    /// Start a consumer instance and subscribe it
    async fn subscribe(&self, options: &RocketMqConsumerOptions) -> ConsumerResult<Box<dyn RocketMqSubscription>>;
}

/// Unit source over one subscription; tags are handed to handlers as the
/// auxiliary key
pub struct RocketMqSource {
    subscription: Box<dyn RocketMqSubscription>,
}

impl RocketMqSource {
    /// Wrap a subscription
    pub fn new(subscription: Box<dyn RocketMqSubscription>) -> Self {
        Self { subscription }
    }
}

impl fmt::Debug for RocketMqSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocketMqSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl UnitSource for RocketMqSource {
    async fn next_unit(&mut self) -> Option<ConsumerResult<ConsumptionUnit>> {
        let message = match self.subscription.next_message().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e)),
        };
        let delivery = Delivery {
            topic: message.topic,
            key: message.keys.map(String::into_bytes),
            value: message.body,
            partition: message.queue_id,
            offset: message.queue_offset,
            extra: vec![message.tags],
        };
        Some(Ok(ConsumptionUnit::at_position(delivery)))
    }

    async fn commit(&mut self, token: CommitToken) -> ConsumerResult<()> {
        self.subscription
            .ack(token.topic(), token.partition(), token.offset())
            .await
    }

    async fn flush(&mut self) -> ConsumerResult<()> {
        warn!(target: TAG, "[Push Consumer] accept quit signal");
        self.subscription.shutdown().await
    }
}

/// The RocketMQ family
pub struct RocketMqFamily {
    configs: Vec<RocketMqTopicConfig>,
    client: Arc<dyn RocketMqClient>,
}

impl RocketMqFamily {
    /// Create the family from the `rocketmq` section of the configuration
    pub fn new(configs: Vec<RocketMqTopicConfig>, client: Arc<dyn RocketMqClient>) -> Self {
        Self { configs, client }
    }
}

#[async_trait]
impl BrokerFamily for RocketMqFamily {
    fn kind(&self) -> BrokerKind {
        BrokerKind::RocketMq
    }

    fn plans(&self) -> ConsumerResult<Vec<TopicPlan>> {
        self.configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                config.validate()?;
                // Redelivery is left to the broker (`retry`).
                Ok(TopicPlan {
                    index,
                    topic: config.topic.clone(),
                    handler: config.handler.clone(),
                    workers: config.consumer_count,
                    policy: RetryPolicy::no_retry(),
                })
            })
            .collect()
    }

    async fn open(&self, plan: &TopicPlan, worker_id: usize) -> ConsumerResult<Box<dyn UnitSource>> {
        let config = self
            .configs
            .get(plan.index)
            .ok_or_else(|| ConsumerError::ConfigError(format!("no RocketMQ config at index {}", plan.index)))?;
        let options = RocketMqConsumerOptions::from(config);
        debug!(
            target: TAG,
            "[{:?} Consumer] starting worker {} as {}",
            options.mode, worker_id, options.instance_name
        );
        let subscription = self.client.subscribe(&options).await?;
        Ok(Box::new(RocketMqSource::new(subscription)))
    }

    async fn dead_letter_publisher(
        &self,
        plan: &TopicPlan,
        _shared: &SharedPublisher,
    ) -> ConsumerResult<Arc<dyn Publisher>> {
        Err(ConsumerError::DeadLetterError(format!(
            "topic {}: RocketMQ topics have no dead-letter topic",
            plan.topic
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedClient {
        subscribed: Mutex<Vec<RocketMqConsumerOptions>>,
        acked: Arc<Mutex<Vec<(String, i32, i64)>>>,
        messages: Mutex<VecDeque<RocketMqMessage>>,
    }

    struct ScriptedSubscription {
        messages: VecDeque<RocketMqMessage>,
        acked: Arc<Mutex<Vec<(String, i32, i64)>>>,
    }

    #[async_trait]
    impl RocketMqSubscription for ScriptedSubscription {
        async fn next_message(&mut self) -> Option<ConsumerResult<RocketMqMessage>> {
            self.messages.pop_front().map(Ok)
        }

        async fn ack(&mut self, topic: &str, queue_id: i32, queue_offset: i64) -> ConsumerResult<()> {
            self.acked
                .lock()
                .unwrap()
                .push((topic.to_string(), queue_id, queue_offset));
            Ok(())
        }

        async fn shutdown(&mut self) -> ConsumerResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl RocketMqClient for ScriptedClient {
        async fn subscribe(&self, options: &RocketMqConsumerOptions) -> ConsumerResult<Box<dyn RocketMqSubscription>> {
            self.subscribed.lock().unwrap().push(options.clone());
            Ok(Box::new(ScriptedSubscription {
                messages: std::mem::take(&mut *self.messages.lock().unwrap()),
                acked: self.acked.clone(),
            }))
        }
    }

    fn config() -> RocketMqTopicConfig {
        RocketMqTopicConfig {
            consumer_group: "GID_audit".to_string(),
            consumer_count: 2,
            name_server: vec!["ns:9876".to_string()],
            topic: "audit".to_string(),
            tags: "create||delete".to_string(),
            retry: 3,
            handler: "audit".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_options_from_config() {
        let options = RocketMqConsumerOptions::from(&config());
        assert_eq!(options.instance_name, "GID_audit@audit");
        assert_eq!(options.tag_expression, "create||delete");
        assert_eq!(options.retry, 3);
        assert_eq!(options.mode, ConsumerMode::Push);
    }

    #[test]
    fn test_plans_never_retry_locally() {
        let family = RocketMqFamily::new(vec![config()], Arc::new(ScriptedClient::default()));
        let plans = family.plans().unwrap();
        assert_eq!(plans[0].workers, 2);
        assert_eq!(plans[0].policy, RetryPolicy::no_retry());
    }

    #[tokio::test]
    async fn test_source_passes_tags_and_acks() {
        let client = Arc::new(ScriptedClient::default());
        client.messages.lock().unwrap().push_back(RocketMqMessage {
            topic: "audit".to_string(),
            tags: "create".to_string(),
            keys: Some("order-1".to_string()),
            body: b"{}".to_vec(),
            queue_id: 2,
            queue_offset: 40,
        });
        let family = RocketMqFamily::new(vec![config()], client.clone());
        let plan = family.plans().unwrap().remove(0);

        let mut source = family.open(&plan, 0).await.unwrap();
        let unit = source.next_unit().await.unwrap().unwrap();
        assert_eq!(unit.delivery().extra, vec!["create".to_string()]);
        assert_eq!(unit.delivery().key.as_deref(), Some(b"order-1".as_slice()));

        source.commit(unit.into_token()).await.unwrap();
        assert!(source.next_unit().await.is_none());
        source.flush().await.unwrap();

        assert_eq!(
            client.acked.lock().unwrap().clone(),
            vec![("audit".to_string(), 2, 40)]
        );
        assert_eq!(client.subscribed.lock().unwrap()[0].instance_name, "GID_audit@audit");
    }
}
