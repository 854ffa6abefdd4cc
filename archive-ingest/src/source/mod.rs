use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::{
    config::ConfigError,
    types::{Message, Metadata},
};

pub mod broker_url;
pub mod kafka;
pub mod mock;
pub mod topics;

pub use broker_url::BrokerUrl;
pub use kafka::KafkaSource;
pub use mock::{MockScenario, MockSource};
pub use topics::{TopicDiscovery, TopicRefresher, TopicSelection};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Source is not connected")]
    NotConnected,
    #[error("Offset token for {topic}/{partition} does not belong to this session")]
    ForeignToken { topic: String, partition: i32 },
    #[error("Session lost: {0}")]
    Disconnected(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Topic discovery task failed: {0}")]
    Discovery(String),
}

/// Where a message sits in its stream. Handed back to `mark_done`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OffsetToken {
    topic: String,
    partition: i32,
    offset: i64,
}

impl OffsetToken {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    pub metadata: Metadata,
    pub token: OffsetToken,
}

/// A consumer-group session over a set of topics, with explicit acknowledgement.
#[async_trait]
pub trait StreamSource: Send {
    /// Opens a session; reading resumes from the group's committed offsets.
    async fn connect(&mut self) -> Result<(), SourceError>;

    /// Waits for the next message. `None` means a bounded read reached end of stream.
    async fn next_message(&mut self) -> Result<Option<ReceivedMessage>, SourceError>;

    /// Durably commits the offset just past `token`.
    async fn mark_done(&mut self, token: &OffsetToken) -> Result<(), SourceError>;

    /// Re-reads the broker's topics and resubscribes, keeping committed offsets.
    async fn refresh_topics(&mut self) -> Result<Vec<String>, SourceError>;

    async fn close(&mut self) -> Result<(), SourceError>;
}
