//! Idempotent topic provisioning, safe to run at every startup.

use crate::error::AdminError;
use async_trait::async_trait;
use core_config::kafka::KafkaConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicProvision {
    Created,
    AlreadyExists,
}

/// Topic to provision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Create the topic if absent. "Already exists" is success; anything else propagates.
    async fn ensure_topic(
        &self,
        name: &str,
        partitions: i32,
        replication_factor: i32,
    ) -> Result<TopicProvision, AdminError>;
}

/// Ensure every topic in `specs`, stopping at the first failure
pub async fn ensure_topics(
    admin: &dyn BrokerAdmin,
    specs: &[TopicSpec],
) -> Result<(), AdminError> {
    for spec in specs {
        admin
            .ensure_topic(&spec.name, spec.partitions, spec.replication_factor)
            .await?;
    }
    Ok(())
}

pub struct KafkaAdmin {
    client: AdminClient<DefaultClientContext>,
    options: AdminOptions,
}

impl KafkaAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let client: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", format!("{}-admin", config.client_id))
            .create()?;

        Ok(Self {
            client,
            options: AdminOptions::new().operation_timeout(Some(Duration::from_secs(30))),
        })
    }
}

#[async_trait]
impl BrokerAdmin for KafkaAdmin {
    async fn ensure_topic(
        &self,
        name: &str,
        partitions: i32,
        replication_factor: i32,
    ) -> Result<TopicProvision, AdminError> {
        let topic = NewTopic::new(name, partitions, TopicReplication::Fixed(replication_factor));
        let results = self.client.create_topics(&[topic], &self.options).await?;

        match results.into_iter().next() {
            Some(Ok(_)) => {
                info!(topic = %name, partitions, replication_factor, "Created topic");
                Ok(TopicProvision::Created)
            }
            Some(Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => {
                debug!(topic = %name, "Topic already exists");
                Ok(TopicProvision::AlreadyExists)
            }
            Some(Err((_, code))) => Err(AdminError::CreateTopic {
                topic: name.to_string(),
                reason: code.to_string(),
            }),
            None => Err(AdminError::CreateTopic {
                topic: name.to_string(),
                reason: "broker returned no result".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryAdmin;

    #[tokio::test]
    async fn test_ensure_topics_is_repeatable() {
        let admin = InMemoryAdmin::new();
        let specs = vec![
            TopicSpec::new("submission.jobs", 3, 1),
            TopicSpec::new("dlq-queue", 1, 1),
        ];

        ensure_topics(&admin, &specs).await.unwrap();
        ensure_topics(&admin, &specs).await.unwrap();

        assert_eq!(admin.topics().await.len(), 2);
        assert_eq!(
            admin.ensure_topic("dlq-queue", 1, 1).await.unwrap(),
            TopicProvision::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let admin = InMemoryAdmin::new();
        let err = admin.ensure_topic("bad", 0, 1).await.unwrap_err();
        assert!(err.to_string().contains("bad"));
    }
}
