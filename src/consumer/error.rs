//! Consumer error types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Kafka client errors
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The configuration file could not be read
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        /// Path that was read
        path: PathBuf,
        /// Underlying IO error
        source: io::Error,
    },

    /// The configuration document is not valid JSON for the expected shape
    #[error("failed to parse consumer config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A topic names a handler that is not registered; only that topic is skipped
    #[error("topic {topic}: handler {handler:?} is not registered")]
    HandlerNotFound {
        /// Configured topic
        topic: String,
        /// Handler name looked up in the registry
        handler: String,
    },

    /// Connection errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Offset management errors
    #[error("Offset error: {0}")]
    OffsetError(String),

    /// Dead-letter publish errors
    #[error("Dead-letter error: {0}")]
    DeadLetterError(String),
}

impl ConsumerError {
    /// Configuration problems are startup preconditions and are never retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ConsumerError::ConfigError(_)
                | ConsumerError::ConfigRead { .. }
                | ConsumerError::ConfigParse(_)
                | ConsumerError::HandlerNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_classified() {
        let err = ConsumerError::HandlerNotFound {
            topic: "orders".to_string(),
            handler: "missing".to_string(),
        };
        assert!(err.is_config());
        assert_eq!(
            err.to_string(),
            "topic orders: handler \"missing\" is not registered"
        );

        assert!(!ConsumerError::DeadLetterError("broker down".to_string()).is_config());
    }
}
