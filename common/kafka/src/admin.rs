use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;
use tracing::info;

use crate::config::KafkaConfig;

#[derive(Error, Debug)]
pub enum AdminErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("topic {0} already exists")]
    AlreadyExists(String),
    #[error("failed to create topic {topic}: {code}")]
    Create { topic: String, code: RDKafkaErrorCode },
}

#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn list_topics(&self) -> Result<HashSet<String>, AdminErr>;

    /// Must report a topic that already exists as `AdminErr::AlreadyExists`.
    async fn create_topic(
        &self,
        name: &str,
        partitions: i32,
        replication: i32,
    ) -> Result<(), AdminErr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStatus {
    Existing,
    Created,
}

/// Creates `name` unless it is already there. Losing a creation race to another
/// process counts as success; any other admin error is returned.
pub async fn ensure_topic(
    admin: &dyn TopicAdmin,
    name: &str,
    partitions: i32,
    replication: i32,
) -> Result<TopicStatus, AdminErr> {
    if admin.list_topics().await?.contains(name) {
        info!(topic = name, "topic already exists");
        return Ok(TopicStatus::Existing);
    }

    match admin.create_topic(name, partitions, replication).await {
        Ok(()) => {
            info!(topic = name, partitions, replication, "topic created");
            Ok(TopicStatus::Created)
        }
        Err(AdminErr::AlreadyExists(_)) => {
            info!(topic = name, "topic created concurrently by another process");
            Ok(TopicStatus::Existing)
        }
        Err(e) => Err(e),
    }
}

pub struct KafkaTopicAdmin {
    client: AdminClient<DefaultClientContext>,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig, timeout: Duration) -> Result<Self, KafkaError> {
        let client: AdminClient<DefaultClientContext> = config.client_config().create()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn list_topics(&self) -> Result<HashSet<String>, AdminErr> {
        let metadata = self.client.inner().fetch_metadata(None, self.timeout)?;
        Ok(metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect())
    }

    async fn create_topic(
        &self,
        name: &str,
        partitions: i32,
        replication: i32,
    ) -> Result<(), AdminErr> {
        let options = AdminOptions::new().operation_timeout(Some(self.timeout));
        let results = self
            .client
            .create_topics(
                &[NewTopic::new(
                    name,
                    partitions,
                    TopicReplication::Fixed(replication),
                )],
                &options,
            )
            .await?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(AdminErr::AlreadyExists(topic))
                }
                Err((topic, code)) => return Err(AdminErr::Create { topic, code }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    enum Behaviour {
        Normal,
        LoseRace,
        Fail,
    }

    struct FakeAdmin {
        topics: Mutex<HashSet<String>>,
        behaviour: Behaviour,
        create_calls: Mutex<u32>,
    }

    impl FakeAdmin {
        fn new(existing: &[&str], behaviour: Behaviour) -> Self {
            Self {
                topics: Mutex::new(existing.iter().map(|t| t.to_string()).collect()),
                behaviour,
                create_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TopicAdmin for FakeAdmin {
        async fn list_topics(&self) -> Result<HashSet<String>, AdminErr> {
            Ok(self.topics.lock().unwrap().clone())
        }

        async fn create_topic(&self, name: &str, _: i32, _: i32) -> Result<(), AdminErr> {
            *self.create_calls.lock().unwrap() += 1;
            match self.behaviour {
                Behaviour::Normal => {
                    if !self.topics.lock().unwrap().insert(name.to_string()) {
                        return Err(AdminErr::AlreadyExists(name.to_string()));
                    }
                    Ok(())
                }
                Behaviour::LoseRace => Err(AdminErr::AlreadyExists(name.to_string())),
                Behaviour::Fail => Err(AdminErr::Create {
                    topic: name.to_string(),
                    code: RDKafkaErrorCode::TopicAuthorizationFailed,
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_existing_topic_is_noop() {
        let admin = FakeAdmin::new(&["appeals"], Behaviour::Normal);
        let status = ensure_topic(&admin, "appeals", 3, 1).await.unwrap();
        assert_eq!(status, TopicStatus::Existing);
        assert_eq!(*admin.create_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_topic_is_created_once() {
        let admin = FakeAdmin::new(&[], Behaviour::Normal);
        assert_eq!(
            ensure_topic(&admin, "appeals", 3, 1).await.unwrap(),
            TopicStatus::Created
        );
        assert_eq!(
            ensure_topic(&admin, "appeals", 3, 1).await.unwrap(),
            TopicStatus::Existing
        );
        assert_eq!(*admin.create_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_creation_race_is_success() {
        let admin = FakeAdmin::new(&[], Behaviour::LoseRace);
        let status = ensure_topic(&admin, "appeals", 3, 1).await.unwrap();
        assert_eq!(status, TopicStatus::Existing);
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let admin = FakeAdmin::new(&[], Behaviour::Fail);
        let result = ensure_topic(&admin, "appeals", 3, 1).await;
        assert!(matches!(result, Err(AdminErr::Create { .. })));
    }
}
