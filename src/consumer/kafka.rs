//! Kafka broker family over rdkafka
//!
//! Every worker is its own member of the topic group's consumer group, so
//! partitions are spread across workers by the group coordinator. Offsets are
//! stored only after a unit reaches a terminal outcome and are committed by
//! the client's auto-commit, plus one synchronous commit on exit.

use crate::consumer::broker::{BrokerFamily, BrokerKind, TopicPlan};
use crate::consumer::config::{KafkaTopicConfig, SaslConfig};
use crate::consumer::dead_letter::{PublishReceipt, Publisher, SharedPublisher};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::retry::RetryPolicy;
use crate::consumer::unit::{CommitToken, ConsumptionUnit, Delivery, UnitSource};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientContext, Message, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const TAG: &str = "xserver.consumer.kafka";

/// Client id of consumer group members
pub const CONSUMER_CLIENT_ID: &str = "xconsumer.kafkaWorker";

/// Client id of the dead-letter publisher
pub const PRODUCER_CLIENT_ID: &str = "xconsumer.kafkaFailProducer";

const AUTO_COMMIT_INTERVAL_MS: &str = "350";
const SESSION_TIMEOUT_MS: &str = "10000";
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Client callbacks: group membership changes, client errors and commit results
pub struct KafkaContext {
    group: String,
}

impl ClientContext for KafkaContext {
    fn error(&self, error: KafkaError, reason: &str) {
        error!(target: TAG, group = %self.group, "consumer errors, err:{}, reason:{}", error, reason);
    }
}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => info!(target: TAG, group = %self.group, "[Setup] assigned {} partitions", tpl.count()),
            Rebalance::Revoke(tpl) => info!(target: TAG, group = %self.group, "[Cleanup] revoking {} partitions", tpl.count()),
            Rebalance::Error(e) => error!(target: TAG, group = %self.group, "rebalance error: {}", e),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(target: TAG, group = %self.group, "committed {} partitions", offsets.count()),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => error!(target: TAG, group = %self.group, "commit offset error:{}", e),
        }
    }
}

type GroupConsumer = StreamConsumer<KafkaContext>;

fn apply_sasl(client_config: &mut ClientConfig, sasl: &SaslConfig) {
    if sasl.enabled {
        client_config
            .set("security.protocol", "SASL_PLAINTEXT")
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", &sasl.user)
            .set("sasl.password", &sasl.password);
    }
}

/// Build the client configuration of one consumer group member
pub fn consumer_client_config(config: &KafkaTopicConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.host.join(","))
        .set("group.id", &config.consumer_group)
        .set("client.id", CONSUMER_CLIENT_ID)
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", AUTO_COMMIT_INTERVAL_MS)
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "latest")
        .set("session.timeout.ms", SESSION_TIMEOUT_MS);
    apply_sasl(&mut client_config, &config.sasl);
    client_config
}

/// Build the client configuration of the dead-letter publisher
pub fn producer_client_config(config: &KafkaTopicConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.dead_letter_hosts().join(","))
        .set("client.id", PRODUCER_CLIENT_ID)
        .set("acks", "all")
        .set("partitioner", "murmur2_random")
        .set("message.timeout.ms", PUBLISH_TIMEOUT.as_millis().to_string());
    apply_sasl(&mut client_config, &config.sasl);
    client_config
}

/// One consumer group member feeding one worker
pub struct KafkaSource {
    consumer: GroupConsumer,
}

impl KafkaSource {
    /// Create the member and subscribe it to every topic of the group
    pub fn connect(config: &KafkaTopicConfig) -> ConsumerResult<Self> {
        let consumer: GroupConsumer = consumer_client_config(config)
            .create_with_context(KafkaContext {
                group: config.consumer_group.clone(),
            })
            .map_err(|e| ConsumerError::ConnectionError(format!("Failed to create consumer: {}", e)))?;

        let topics = config.topics();
        consumer
            .subscribe(&topics)
            .map_err(|e| ConsumerError::ConnectionError(format!("Failed to subscribe: {}", e)))?;
        info!(target: TAG, "Subscribed to topics: {:?}", topics);

        Ok(Self { consumer })
    }
}

#[async_trait]
impl UnitSource for KafkaSource {
    async fn next_unit(&mut self) -> Option<ConsumerResult<ConsumptionUnit>> {
        let unit = match self.consumer.recv().await {
            Ok(message) => {
                let key = message.key().map(<[u8]>::to_vec);
                let extra = vec![key
                    .as_deref()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .unwrap_or_default()];
                let delivery = Delivery {
                    topic: message.topic().to_string(),
                    key,
                    value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    partition: message.partition(),
                    offset: message.offset(),
                    extra,
                };
                Ok(ConsumptionUnit::at_position(delivery))
            }
            Err(e) => Err(ConsumerError::KafkaError(e)),
        };
        Some(unit)
    }

    async fn commit(&mut self, token: CommitToken) -> ConsumerResult<()> {
        // The stored offset is the next one to read.
        self.consumer
            .store_offset(token.topic(), token.partition(), token.offset() + 1)
            .map_err(|e| ConsumerError::OffsetError(format!("store offset {:?}: {}", token, e)))
    }

    async fn flush(&mut self) -> ConsumerResult<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(ConsumerError::OffsetError(format!("final commit: {}", e))),
        }
    }
}

/// Dead-letter publisher over a Kafka producer
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Create the producer for a topic group's dead-letter brokers
    pub fn connect(config: &KafkaTopicConfig) -> ConsumerResult<Self> {
        let producer: FutureProducer = producer_client_config(config)
            .create()
            .map_err(|e| ConsumerError::ConnectionError(format!("Failed to create fail producer: {}", e)))?;
        info!(
            target: TAG,
            "Created fail producer for brokers: {:?}",
            config.dead_letter_hosts()
        );
        Ok(Self {
            producer,
            timeout: PUBLISH_TIMEOUT,
        })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> ConsumerResult<PublishReceipt> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(value);
        if let Some(key) = key {
            record = record.key(key);
        }

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => Ok(PublishReceipt { partition, offset }),
            Err((e, _)) => Err(ConsumerError::KafkaError(e)),
        }
    }
}

/// The Kafka family: one consumer group member per configured worker
pub struct KafkaFamily {
    configs: Vec<KafkaTopicConfig>,
}

impl KafkaFamily {
    /// Create the family from the `kafka` section of the configuration
    pub fn new(configs: Vec<KafkaTopicConfig>) -> Self {
        Self { configs }
    }

    fn config(&self, plan: &TopicPlan) -> ConsumerResult<&KafkaTopicConfig> {
        self.configs
            .get(plan.index)
            .ok_or_else(|| ConsumerError::ConfigError(format!("no Kafka config at index {}", plan.index)))
    }
}

#[async_trait]
impl BrokerFamily for KafkaFamily {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }

    fn plans(&self) -> ConsumerResult<Vec<TopicPlan>> {
        self.configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                config.validate()?;
                Ok(TopicPlan {
                    index,
                    topic: config.topic.clone(),
                    handler: config.handler.clone(),
                    workers: config.consumer_count,
                    policy: RetryPolicy::new(config.fail_count, config.dead_letter_topic().map(str::to_string)),
                })
            })
            .collect()
    }

    async fn open(&self, plan: &TopicPlan, worker_id: usize) -> ConsumerResult<Box<dyn UnitSource>> {
        let config = self.config(plan)?;
        debug!(target: TAG, "opening worker {} of topic {}", worker_id, config.topic);
        Ok(Box::new(KafkaSource::connect(config)?))
    }

    async fn dead_letter_publisher(
        &self,
        _plan: &TopicPlan,
        shared: &SharedPublisher,
    ) -> ConsumerResult<Arc<dyn Publisher>> {
        // The process-wide publisher is built from the first group that
        // declares a dead-letter topic.
        let Some(config) = self.configs.iter().find(|c| c.dead_letter_topic().is_some()) else {
            warn!(target: TAG, "no Kafka config declares a fail topic");
            return Err(ConsumerError::DeadLetterError("no fail topic configured".to_string()));
        };
        shared
            .get_or_try_init(|| async move {
                KafkaPublisher::connect(config).map(|publisher| Arc::new(publisher) as Arc<dyn Publisher>)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KafkaTopicConfig {
        KafkaTopicConfig {
            host: vec!["a:9092".to_string(), "b:9092".to_string()],
            fail_host: vec![],
            topic: "orders,refunds".to_string(),
            sasl: SaslConfig {
                enabled: true,
                user: "svc".to_string(),
                password: "secret".to_string(),
            },
            fail_topic: "orders-failed".to_string(),
            fail_count: 2,
            consumer_group: "billing".to_string(),
            consumer_count: 3,
            handler: "billing".to_string(),
        }
    }

    #[test]
    fn test_consumer_client_config() {
        let client_config = consumer_client_config(&config());
        assert_eq!(client_config.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(client_config.get("group.id"), Some("billing"));
        assert_eq!(client_config.get("client.id"), Some(CONSUMER_CLIENT_ID));
        assert_eq!(client_config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client_config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(client_config.get("sasl.mechanisms"), Some("PLAIN"));
        assert_eq!(client_config.get("sasl.username"), Some("svc"));
    }

    #[test]
    fn test_producer_prefers_fail_host() {
        let mut cfg = config();
        cfg.sasl.enabled = false;
        assert_eq!(producer_client_config(&cfg).get("bootstrap.servers"), Some("a:9092,b:9092"));

        cfg.fail_host = vec!["dlq:9092".to_string()];
        let client_config = producer_client_config(&cfg);
        assert_eq!(client_config.get("bootstrap.servers"), Some("dlq:9092"));
        assert_eq!(client_config.get("acks"), Some("all"));
        assert_eq!(client_config.get("security.protocol"), None);
    }

    #[test]
    fn test_plans_carry_policy() {
        let mut no_dlq = config();
        no_dlq.fail_topic.clear();
        no_dlq.fail_count = 0;
        let family = KafkaFamily::new(vec![config(), no_dlq]);

        let plans = family.plans().unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].workers, 3);
        assert_eq!(plans[0].policy, RetryPolicy::new(2, Some("orders-failed".to_string())));
        assert_eq!(plans[1].index, 1);
        assert_eq!(plans[1].policy, RetryPolicy::no_retry());
    }

    #[test]
    fn test_plans_reject_invalid_group() {
        let mut bad = config();
        bad.consumer_group.clear();
        let family = KafkaFamily::new(vec![bad]);
        assert!(family.plans().unwrap_err().is_config());
    }
}
