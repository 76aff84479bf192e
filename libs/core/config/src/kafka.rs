use crate::{env_or_default, ConfigError, FromEnv};

/// Broker connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KafkaConfig {
    /// Bootstrap servers
    pub brokers: Vec<String>,
    pub client_id: String,
}

impl KafkaConfig {
    pub fn new(brokers: Vec<String>, client_id: impl Into<String>) -> Self {
        Self {
            brokers,
            client_id: client_id.into(),
        }
    }

    /// Comma separated list, the form librdkafka expects for `bootstrap.servers`
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

impl FromEnv for KafkaConfig {
    /// Reads from environment variables with defaults:
    /// - KAFKA_BROKERS: defaults to "localhost:9092"
    /// - KAFKA_CLIENT_ID: defaults to "code-manage-service"
    fn from_env() -> Result<Self, ConfigError> {
        let raw = env_or_default("KAFKA_BROKERS", "localhost:9092");
        let brokers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();

        if brokers.is_empty() {
            return Err(ConfigError::ParseError {
                key: "KAFKA_BROKERS".to_string(),
                details: "no broker addresses given".to_string(),
            });
        }

        Ok(Self {
            brokers,
            client_id: env_or_default("KAFKA_CLIENT_ID", "code-manage-service"),
        })
    }
}
