//! Consumer configuration structures

use crate::consumer::dead_letter::DEFAULT_FORWARD_ATTEMPTS;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::stats::DEFAULT_STAT_INTERVAL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const TAG: &str = "xserver.consumer.config";

/// File name of the consumer configuration document
pub const CONFIG_FILE_NAME: &str = "mq.json";

/// Directory searched, relative to the working directory, when none is given
pub const DEFAULT_CONFIG_DIR: &str = "conf/consumer";

/// Default bound on a broker consumer's drain
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The consumer configuration document (`mq.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Which broker families run
    #[serde(default)]
    pub enabled: EnabledFamilies,

    /// Kafka topics
    #[serde(default)]
    pub kafka: Vec<KafkaTopicConfig>,

    /// RocketMQ topics
    #[serde(default)]
    pub rocketmq: Vec<RocketMqTopicConfig>,
}

/// Per-family switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledFamilies {
    /// Run the Kafka family
    #[serde(default)]
    pub kafka: bool,

    /// Run the RocketMQ family
    #[serde(default)]
    pub rocketmq: bool,
}

/// One Kafka topic group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaTopicConfig {
    /// Bootstrap brokers
    pub host: Vec<String>,

    /// Brokers for the dead-letter publisher; `host` is used when empty
    #[serde(default)]
    pub fail_host: Vec<String>,

    /// Topic, or several topics separated by commas
    pub topic: String,

    /// SASL/PLAIN credentials
    #[serde(default)]
    pub sasl: SaslConfig,

    /// Dead-letter topic; empty means none
    #[serde(default)]
    pub fail_topic: String,

    /// Local retries after the first failure
    #[serde(default)]
    pub fail_count: u32,

    /// Consumer group id
    pub consumer_group: String,

    /// Number of workers
    #[serde(default)]
    pub consumer_count: usize,

    /// Registered handler name
    pub handler: String,
}

/// SASL settings for a Kafka topic group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslConfig {
    /// Whether SASL is used
    #[serde(default)]
    pub enabled: bool,

    /// User name
    #[serde(default)]
    pub user: String,

    /// Password
    #[serde(default)]
    pub password: String,
}

impl KafkaTopicConfig {
    /// Topics this group subscribes to
    pub fn topics(&self) -> Vec<&str> {
        self.topic
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Dead-letter topic, if configured
    pub fn dead_letter_topic(&self) -> Option<&str> {
        Some(self.fail_topic.as_str()).filter(|t| !t.is_empty())
    }

    /// Brokers used by the dead-letter publisher
    pub fn dead_letter_hosts(&self) -> &[String] {
        if self.fail_host.is_empty() {
            &self.host
        } else {
            &self.fail_host
        }
    }

    /// Check the fields a consumer cannot start without
    pub fn validate(&self) -> ConsumerResult<()> {
        if self.topics().is_empty() {
            return Err(ConsumerError::ConfigError("Kafka topic cannot be empty".to_string()));
        }
        if self.host.is_empty() {
            return Err(ConsumerError::ConfigError(format!(
                "Kafka topic {}: host cannot be empty",
                self.topic
            )));
        }
        if self.consumer_group.is_empty() {
            return Err(ConsumerError::ConfigError(format!(
                "Kafka topic {}: consumerGroup cannot be empty",
                self.topic
            )));
        }
        Ok(())
    }
}

/// Push or pull consumption for RocketMQ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "NumberOrName")]
pub enum ConsumerMode {
    /// Broker pushes messages (0)
    #[default]
    Push,
    /// Client pulls messages (1)
    Pull,
}

/// Where a new RocketMQ consumer group starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "NumberOrName")]
pub enum ConsumeFromWhere {
    /// Latest offset (0)
    #[default]
    LastOffset,
    /// Earliest offset (1)
    FirstOffset,
    /// Offset at a timestamp (2)
    Timestamp,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrName {
    Number(u8),
    Name(String),
}

impl TryFrom<NumberOrName> for ConsumerMode {
    type Error = String;

    fn try_from(value: NumberOrName) -> Result<Self, Self::Error> {
        match value {
            NumberOrName::Number(0) => Ok(ConsumerMode::Push),
            NumberOrName::Number(1) => Ok(ConsumerMode::Pull),
            NumberOrName::Name(name) if name.eq_ignore_ascii_case("push") => Ok(ConsumerMode::Push),
            NumberOrName::Name(name) if name.eq_ignore_ascii_case("pull") => Ok(ConsumerMode::Pull),
            NumberOrName::Number(n) => Err(format!("unknown consumerMode {}", n)),
            NumberOrName::Name(name) => Err(format!("unknown consumerMode {:?}", name)),
        }
    }
}

impl TryFrom<NumberOrName> for ConsumeFromWhere {
    type Error = String;

    fn try_from(value: NumberOrName) -> Result<Self, Self::Error> {
        match value {
            NumberOrName::Number(0) => Ok(ConsumeFromWhere::LastOffset),
            NumberOrName::Number(1) => Ok(ConsumeFromWhere::FirstOffset),
            NumberOrName::Number(2) => Ok(ConsumeFromWhere::Timestamp),
            NumberOrName::Name(name) => match name.as_str() {
                "lastOffset" => Ok(ConsumeFromWhere::LastOffset),
                "firstOffset" => Ok(ConsumeFromWhere::FirstOffset),
                "timestamp" => Ok(ConsumeFromWhere::Timestamp),
                _ => Err(format!("unknown offset {:?}", name)),
            },
            NumberOrName::Number(n) => Err(format!("unknown offset {}", n)),
        }
    }
}

/// One RocketMQ topic group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RocketMqTopicConfig {
    /// Push or pull
    #[serde(default)]
    pub consumer_mode: ConsumerMode,

    /// Consumer group
    pub consumer_group: String,

    /// Number of workers
    #[serde(default)]
    pub consumer_count: usize,

    /// Name server addresses
    pub name_server: Vec<String>,

    /// Namespace
    #[serde(default)]
    pub namespace: String,

    /// Access credentials
    #[serde(default)]
    pub credentials: RocketMqCredentials,

    /// Topic
    pub topic: String,

    /// Tag selector expression
    #[serde(default)]
    pub tags: String,

    /// Broker-side redelivery count
    #[serde(default)]
    pub retry: i32,

    /// Start position for a new group
    #[serde(default)]
    pub offset: ConsumeFromWhere,

    /// Registered handler name
    pub handler: String,
}

/// RocketMQ credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RocketMqCredentials {
    /// Access key
    #[serde(default)]
    pub access_key: String,
    /// Secret key
    #[serde(default)]
    pub secret_key: String,
    /// Security token
    #[serde(default)]
    pub security_token: String,
}

impl RocketMqTopicConfig {
    /// Client instance name, unique per group and namespace (or topic)
    pub fn instance_name(&self) -> String {
        let suffix = if self.namespace.is_empty() {
            &self.topic
        } else {
            &self.namespace
        };
        format!("{}@{}", self.consumer_group, suffix)
    }

    /// Check the fields a consumer cannot start without
    pub fn validate(&self) -> ConsumerResult<()> {
        if self.topic.is_empty() {
            return Err(ConsumerError::ConfigError("RocketMQ topic cannot be empty".to_string()));
        }
        if self.name_server.is_empty() {
            return Err(ConsumerError::ConfigError(format!(
                "RocketMQ topic {}: nameServer cannot be empty",
                self.topic
            )));
        }
        if self.consumer_group.is_empty() {
            return Err(ConsumerError::ConfigError(format!(
                "RocketMQ topic {}: consumerGroup cannot be empty",
                self.topic
            )));
        }
        Ok(())
    }
}

impl ConsumerSettings {
    /// Parse a configuration document
    pub fn from_json_str(json: &str) -> ConsumerResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Path of the configuration file for a directory, or the default location
    pub fn resolve_path(dir: Option<&Path>) -> ConsumerResult<PathBuf> {
        match dir {
            Some(dir) => Ok(dir.join(CONFIG_FILE_NAME)),
            None => {
                let cwd = std::env::current_dir().map_err(|source| ConsumerError::ConfigRead {
                    path: PathBuf::from("."),
                    source,
                })?;
                Ok(cwd.join(DEFAULT_CONFIG_DIR).join(CONFIG_FILE_NAME))
            }
        }
    }

    /// Load `mq.json` from `dir`, or from `conf/consumer/` under the working
    /// directory when `dir` is `None`
    pub fn load(dir: Option<&Path>) -> ConsumerResult<Self> {
        let path = Self::resolve_path(dir)?;
        debug!(target: TAG, "Loading consumer config from {}", path.display());
        let json = std::fs::read_to_string(&path)
            .map_err(|source| ConsumerError::ConfigRead { path: path.clone(), source })?;
        Self::from_json_str(&json)
    }
}

/// Engine tuning shared by every broker family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Bound on waiting for workers after the exit signal fires
    pub drain_timeout: Duration,
    /// Interval between stat reports
    pub stat_interval: Duration,
    /// Publish attempts per dead-lettered unit
    pub forward_attempts: u32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            stat_interval: DEFAULT_STAT_INTERVAL,
            forward_attempts: DEFAULT_FORWARD_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const DOCUMENT: &str = r#"{
        "enabled": { "kafka": true, "rocketmq": false },
        "kafka": [
            {
                "host": ["10.0.0.1:9092", "10.0.0.2:9092"],
                "failHost": [],
                "topic": "orders,refunds",
                "sasl": { "enabled": true, "user": "svc", "password": "secret" },
                "failTopic": "orders-failed",
                "failCount": 2,
                "consumerGroup": "billing",
                "consumerCount": 3,
                "handler": "billing"
            }
        ],
        "rocketmq": [
            {
                "consumerMode": 0,
                "consumerGroup": "GID_audit",
                "consumerCount": 1,
                "nameServer": ["10.0.1.1:9876"],
                "namespace": "",
                "credentials": { "accessKey": "ak", "secretKey": "sk", "securityToken": "" },
                "topic": "audit",
                "tags": "create||delete",
                "retry": 2,
                "offset": 1,
                "handler": "audit"
            }
        ]
    }"#;

    #[test]
    fn test_parse_document() {
        let settings = ConsumerSettings::from_json_str(DOCUMENT).unwrap();

        assert_eq!(settings.enabled, EnabledFamilies { kafka: true, rocketmq: false });

        let kafka = &settings.kafka[0];
        assert_eq!(kafka.topics(), vec!["orders", "refunds"]);
        assert_eq!(kafka.dead_letter_topic(), Some("orders-failed"));
        assert_eq!(kafka.dead_letter_hosts(), kafka.host.as_slice());
        assert_eq!(kafka.fail_count, 2);
        assert_eq!(kafka.consumer_count, 3);
        assert!(kafka.sasl.enabled);
        kafka.validate().unwrap();

        let rocket = &settings.rocketmq[0];
        assert_eq!(rocket.consumer_mode, ConsumerMode::Push);
        assert_eq!(rocket.offset, ConsumeFromWhere::FirstOffset);
        assert_eq!(rocket.credentials.access_key, "ak");
        assert_eq!(rocket.instance_name(), "GID_audit@audit");
        rocket.validate().unwrap();
    }

    #[test]
    fn test_defaults_for_missing_sections() {
        let settings = ConsumerSettings::from_json_str(
            r#"{"enabled": {"kafka": true}, "kafka": [{"host": ["h:9092"], "topic": "t", "consumerGroup": "g", "handler": "h"}]}"#,
        )
        .unwrap();

        assert!(!settings.enabled.rocketmq);
        assert!(settings.rocketmq.is_empty());
        let kafka = &settings.kafka[0];
        assert_eq!(kafka.sasl, SaslConfig::default());
        assert_eq!(kafka.dead_letter_topic(), None);
        assert_eq!(kafka.consumer_count, 0);
    }

    #[test]
    fn test_enum_names_and_errors() {
        let mode: ConsumerMode = serde_json::from_str(r#""pull""#).unwrap();
        assert_eq!(mode, ConsumerMode::Pull);
        let offset: ConsumeFromWhere = serde_json::from_str(r#""timestamp""#).unwrap();
        assert_eq!(offset, ConsumeFromWhere::Timestamp);

        assert!(serde_json::from_str::<ConsumerMode>("7").is_err());
        assert!(serde_json::from_str::<ConsumeFromWhere>(r#""yesterday""#).is_err());
    }

    #[test]
    fn test_fail_host_and_namespace_preference() {
        let kafka = KafkaTopicConfig {
            host: vec!["a:9092".to_string()],
            fail_host: vec!["dlq:9092".to_string()],
            ..Default::default()
        };
        assert_eq!(kafka.dead_letter_hosts(), &["dlq:9092".to_string()]);

        let rocket = RocketMqTopicConfig {
            consumer_group: "GID".to_string(),
            namespace: "prod".to_string(),
            topic: "audit".to_string(),
            ..Default::default()
        };
        assert_eq!(rocket.instance_name(), "GID@prod");
    }

    #[test]
    fn test_validation_errors() {
        let kafka = KafkaTopicConfig {
            host: vec!["a:9092".to_string()],
            topic: " , ".to_string(),
            consumer_group: "g".to_string(),
            ..Default::default()
        };
        assert!(kafka.validate().unwrap_err().is_config());

        let rocket = RocketMqTopicConfig {
            topic: "audit".to_string(),
            consumer_group: "GID".to_string(),
            ..Default::default()
        };
        assert!(rocket.validate().is_err());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        file.write_all(DOCUMENT.as_bytes()).unwrap();

        let settings = ConsumerSettings::load(Some(dir.path())).unwrap();
        assert_eq!(settings.kafka.len(), 1);

        let missing = tempfile::tempdir().unwrap();
        let err = ConsumerSettings::load(Some(missing.path())).unwrap_err();
        assert!(matches!(err, ConsumerError::ConfigRead { .. }));
    }

    #[test]
    fn test_malformed_document_is_config_error() {
        let err = ConsumerSettings::from_json_str("{ not json").unwrap_err();
        assert!(err.is_config());
    }
}
