use core_config::{env_parse_or, ConfigError, FromEnv};

/// Process-level settings; retry behaviour comes from `RetryConfig`
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub health_port: u16,
    /// Used only when the DLQ topic has to be created
    pub dlq_partitions: i32,
    pub dlq_replication_factor: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            health_port: 8083,
            dlq_partitions: 1,
            dlq_replication_factor: 1,
        }
    }
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        // RETRY_WORKER_HEALTH_PORT wins over the shared HEALTH_PORT
        let health_port = match std::env::var("RETRY_WORKER_HEALTH_PORT") {
            Ok(_) => env_parse_or("RETRY_WORKER_HEALTH_PORT", defaults.health_port)?,
            Err(_) => env_parse_or("HEALTH_PORT", defaults.health_port)?,
        };

        Ok(Self {
            health_port,
            dlq_partitions: env_parse_or("TOPIC_PARTITIONS", defaults.dlq_partitions)?,
            dlq_replication_factor: env_parse_or(
                "TOPIC_REPLICATION_FACTOR",
                defaults.dlq_replication_factor,
            )?,
        })
    }
}
