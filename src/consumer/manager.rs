//! Supervises the enabled broker families of the process

use crate::consumer::broker::{BrokerConsumer, BrokerFamily, BrokerKind};
use crate::consumer::config::{ConsumerOptions, ConsumerSettings};
use crate::consumer::dead_letter::SharedPublisher;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::handler::HandlerRegistry;
use crate::consumer::rocketmq::{RocketMqClient, RocketMqFamily};
use crate::shutdown::DrainOutcome;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

const TAG: &str = "xserver.consumer.manager";

/// Builder for [`ConsumerManager`]
pub struct ConsumerManagerBuilder {
    settings: ConsumerSettings,
    registry: HandlerRegistry,
    options: ConsumerOptions,
    publisher: SharedPublisher,
    rocketmq_client: Option<Arc<dyn RocketMqClient>>,
    families: BTreeMap<BrokerKind, Arc<dyn BrokerFamily>>,
}

impl ConsumerManagerBuilder {
    /// Engine tuning
    pub fn options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Dead-letter publisher slot; useful to pre-install a publisher
    pub fn publisher(mut self, publisher: SharedPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// Client used by the RocketMQ family
    pub fn rocketmq_client(mut self, client: Arc<dyn RocketMqClient>) -> Self {
        self.rocketmq_client = Some(client);
        self
    }

    /// Replace the built-in implementation of a family.
    ///
    /// The family still runs only when enabled in the settings.
    pub fn family(mut self, family: Arc<dyn BrokerFamily>) -> Self {
        self.families.insert(family.kind(), family);
        self
    }

    fn resolve(&mut self, kind: BrokerKind) -> ConsumerResult<Arc<dyn BrokerFamily>> {
        if let Some(family) = self.families.remove(&kind) {
            return Ok(family);
        }
        match kind {
            BrokerKind::Kafka => kafka_family(&self.settings),
            BrokerKind::RocketMq => match &self.rocketmq_client {
                Some(client) => Ok(Arc::new(RocketMqFamily::new(
                    self.settings.rocketmq.clone(),
                    client.clone(),
                ))),
                None => Err(ConsumerError::ConfigError(
                    "RocketMQ is enabled but no RocketMQ client was supplied".to_string(),
                )),
            },
        }
    }

    /// Start every enabled family.
    ///
    /// A family that fails to start aborts construction; families already
    /// started are closed first.
    pub async fn build(mut self) -> ConsumerResult<ConsumerManager> {
        let mut enabled = Vec::new();
        if self.settings.enabled.kafka {
            enabled.push(BrokerKind::Kafka);
        }
        if self.settings.enabled.rocketmq {
            enabled.push(BrokerKind::RocketMq);
        }
        if enabled.is_empty() {
            warn!(target: TAG, "no broker family is enabled");
        }

        let mut consumers: Vec<BrokerConsumer> = Vec::new();
        for kind in enabled {
            let started = match self.resolve(kind) {
                Ok(family) => {
                    BrokerConsumer::start(family.as_ref(), &self.registry, &self.publisher, &self.options).await
                }
                Err(e) => Err(e),
            };
            match started {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => {
                    error!(target: TAG, "new {} consumer error:{}", kind, e);
                    join_all(consumers.iter().map(|c| c.close())).await;
                    return Err(e);
                }
            }
        }

        info!(
            target: TAG,
            "consumer manager started {} families",
            consumers.len()
        );
        Ok(ConsumerManager {
            consumers,
            publisher: self.publisher,
        })
    }
}

#[cfg(feature = "kafka")]
fn kafka_family(settings: &ConsumerSettings) -> ConsumerResult<Arc<dyn BrokerFamily>> {
    Ok(Arc::new(crate::consumer::kafka::KafkaFamily::new(settings.kafka.clone())))
}

#[cfg(not(feature = "kafka"))]
fn kafka_family(_settings: &ConsumerSettings) -> ConsumerResult<Arc<dyn BrokerFamily>> {
    Err(ConsumerError::ConfigError(
        "Kafka is enabled but this build has no Kafka support".to_string(),
    ))
}

/// Every running broker family plus the process-wide dead-letter publisher
#[derive(Debug)]
pub struct ConsumerManager {
    consumers: Vec<BrokerConsumer>,
    publisher: SharedPublisher,
}

impl ConsumerManager {
    /// Start building a manager over `settings` and `registry`
    pub fn builder(settings: ConsumerSettings, registry: HandlerRegistry) -> ConsumerManagerBuilder {
        ConsumerManagerBuilder {
            settings,
            registry,
            options: ConsumerOptions::default(),
            publisher: SharedPublisher::new(),
            rocketmq_client: None,
            families: BTreeMap::new(),
        }
    }

    /// Running families
    pub fn consumers(&self) -> &[BrokerConsumer] {
        &self.consumers
    }

    /// The running consumer of a family, if enabled and started
    pub fn consumer(&self, kind: BrokerKind) -> Option<&BrokerConsumer> {
        self.consumers.iter().find(|c| c.kind() == kind)
    }

    /// The dead-letter publisher slot
    pub fn publisher(&self) -> &SharedPublisher {
        &self.publisher
    }

    /// Close every family in parallel; each drain is bounded on its own.
    ///
    /// The combined outcome times out if any family timed out.
    pub async fn close(&self) -> DrainOutcome {
        warn!(target: TAG, "starting close consumers");
        let outcomes = join_all(self.consumers.iter().map(|c| c.close())).await;
        let outcome = outcomes
            .into_iter()
            .reduce(DrainOutcome::merge)
            .unwrap_or(DrainOutcome::Completed {
                elapsed: std::time::Duration::ZERO,
            });
        warn!(target: TAG, "close consumers done, completed:{}", outcome.is_completed());
        outcome
    }
}
