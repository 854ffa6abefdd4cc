use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use rdkafka::{
    admin::AdminClient,
    client::DefaultClientContext,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::Headers,
    util::Timeout,
    ClientConfig, Message as KafkaMessage, Offset, TopicPartitionList,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    BrokerUrl, OffsetToken, ReceivedMessage, SourceError, StreamSource, TopicDiscovery,
    TopicRefresher, TopicSelection,
};
use crate::{
    config::SourceConfig,
    metrics_const::{MESSAGES_RECEIVED, OFFSETS_COMMITTED, SOURCE_CONNECTS},
    types::{Header, HeaderValue, Message, Metadata},
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka client settings for the archiver's consumer group.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Connection settings shared by the consumer and the metadata client.
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("socket.timeout.ms", "10000")
            .set("statistics.interval.ms", "10000");
        Self { config }
    }

    /// Enable TLS and, when a password is supplied, SCRAM authentication as `principal`.
    pub fn with_security(
        mut self,
        tls: bool,
        principal: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        match (principal, password) {
            (Some(principal), Some(password)) => {
                self.config
                    .set(
                        "security.protocol",
                        if tls { "sasl_ssl" } else { "sasl_plaintext" },
                    )
                    .set("sasl.mechanisms", "SCRAM-SHA-512")
                    .set("sasl.username", principal)
                    .set("sasl.password", password);
            }
            _ if tls => {
                self.config
                    .set("security.protocol", "ssl")
                    .set("enable.ssl.certificate.verification", "false");
            }
            _ => {}
        }
        self
    }

    /// Group membership with manual, synchronous commits.
    pub fn for_group(mut self, group_id: &str) -> Self {
        self.config
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Report partition end-of-stream so bounded reads can stop.
    pub fn with_partition_eof(mut self, enabled: bool) -> Self {
        self.config
            .set("enable.partition.eof", if enabled { "true" } else { "false" });
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Lists broker topics through an admin client.
pub struct KafkaTopicDiscovery {
    admin: Arc<AdminClient<DefaultClientContext>>,
}

impl KafkaTopicDiscovery {
    pub fn new(config: &ClientConfig) -> Result<Self, SourceError> {
        let admin: AdminClient<DefaultClientContext> = config.create()?;
        Ok(Self {
            admin: Arc::new(admin),
        })
    }
}

#[async_trait]
impl TopicDiscovery for KafkaTopicDiscovery {
    async fn list_topics(&self) -> Result<Vec<String>, SourceError> {
        let admin = self.admin.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, SourceError> {
            let metadata = admin
                .inner()
                .fetch_metadata(None, Timeout::from(METADATA_TIMEOUT))?;
            Ok(metadata
                .topics()
                .iter()
                .map(|t| t.name().to_string())
                .collect())
        })
        .await
        .map_err(|e| SourceError::Discovery(e.to_string()))?
    }
}

/// Caps messages per topic in test mode. Only committed messages count, so
/// redeliveries after a lost session are not charged twice.
#[derive(Debug, Default)]
pub struct TopicBudget {
    limit: Option<u64>,
    counts: HashMap<String, u64>,
}

impl TopicBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
        }
    }

    /// Whether the topic still has room for another message.
    pub fn admits(&self, topic: &str) -> bool {
        match self.limit {
            Some(limit) => self.counts.get(topic).copied().unwrap_or(0) < limit,
            None => true,
        }
    }

    /// Charges a committed message to its topic.
    pub fn record(&mut self, topic: &str) {
        if self.limit.is_some() {
            *self.counts.entry(topic.to_string()).or_default() += 1;
        }
    }

    pub fn exhausted(&self, topics: &[String]) -> bool {
        match self.limit {
            Some(limit) => {
                !topics.is_empty()
                    && topics
                        .iter()
                        .all(|t| self.counts.get(t).copied().unwrap_or(0) >= limit)
            }
            None => false,
        }
    }
}

struct Session {
    consumer: Arc<StreamConsumer>,
    topic_updates: watch::Receiver<Vec<String>>,
    updates_open: bool,
    refresh_task: JoinHandle<()>,
    subscribed: Vec<String>,
    // partition numbers that reported end of stream since their last message
    eof_partitions: HashSet<i32>,
}

impl Session {
    fn resubscribe(&mut self, topics: Vec<String>) -> Result<(), SourceError> {
        if topics == self.subscribed {
            return Ok(());
        }
        subscribe(&self.consumer, &topics)?;
        info!(from = ?self.subscribed, to = ?topics, "Resubscribed");
        self.subscribed = topics;
        self.eof_partitions.clear();
        Ok(())
    }

    /// Every assigned partition reported EOF and its position is at the high watermark.
    async fn reached_end(&self) -> Result<bool, SourceError> {
        let consumer = self.consumer.clone();
        let eof_partitions = self.eof_partitions.clone();
        tokio::task::spawn_blocking(move || -> Result<bool, SourceError> {
            let positions = consumer.position()?;
            if positions.count() == 0 {
                return Ok(false);
            }
            for elem in positions.elements() {
                if !eof_partitions.contains(&elem.partition()) {
                    return Ok(false);
                }
                if let Offset::Offset(position) = elem.offset() {
                    let (_, high) = consumer.fetch_watermarks(
                        elem.topic(),
                        elem.partition(),
                        Timeout::from(METADATA_TIMEOUT),
                    )?;
                    if position < high {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        })
        .await
        .map_err(|e| SourceError::Disconnected(format!("end of stream check failed: {e}")))?
    }
}

fn subscribe(consumer: &StreamConsumer, topics: &[String]) -> Result<(), SourceError> {
    if topics.is_empty() {
        consumer.unsubscribe();
        return Ok(());
    }
    let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer.subscribe(&topics)?;
    Ok(())
}

/// Converts a broker message into the archive's owned representation.
pub fn to_received<M: KafkaMessage>(msg: &M) -> ReceivedMessage {
    let headers: Vec<Header> = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| Header {
                    key: h.key.to_string(),
                    value: HeaderValue::from_wire(h.value),
                })
                .collect()
        })
        .unwrap_or_default();

    let timestamp = msg.timestamp().to_millis().unwrap_or_else(|| {
        warn!(
            topic = msg.topic(),
            partition = msg.partition(),
            offset = msg.offset(),
            "Message has no broker timestamp, using 0"
        );
        0
    });

    let message = Message::from_headers(&headers, msg.payload().unwrap_or_default());
    ReceivedMessage {
        message,
        metadata: Metadata {
            topic: msg.topic().to_string(),
            timestamp,
            headers,
        },
        token: OffsetToken::new(msg.topic(), msg.partition(), msg.offset()),
    }
}

pub struct KafkaSource {
    url: BrokerUrl,
    group_id: String,
    until_eos: bool,
    consumer_config: ClientConfig,
    refresher: TopicRefresher,
    budget: TopicBudget,
    session: Option<Session>,
}

impl KafkaSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let url: BrokerUrl = config.source_broker_url.parse()?;
        let group_id = url.group_id(&config.source_group_id);

        let common = ConsumerConfigBuilder::new(&url.bootstrap_servers()).with_security(
            config.source_tls,
            url.principal.as_deref(),
            config.source_sasl_password.as_deref(),
        );
        let discovery = KafkaTopicDiscovery::new(&common.build())?;

        let consumer_config = ConsumerConfigBuilder::new(&url.bootstrap_servers())
            .with_security(
                config.source_tls,
                url.principal.as_deref(),
                config.source_sasl_password.as_deref(),
            )
            .for_group(&group_id)
            .with_offset_reset(&config.source_offset_reset)
            .with_partition_eof(config.source_until_eos)
            .build();

        let refresher = TopicRefresher::new(
            Arc::new(discovery),
            TopicSelection::from_config(config, &url),
            config.topic_refresh_interval(),
        );
        let budget = TopicBudget::new(if config.source_test_mode {
            config.test_max_messages()
        } else {
            None
        });

        Ok(Self {
            url,
            group_id,
            until_eos: config.source_until_eos,
            consumer_config,
            refresher,
            budget,
            session: None,
        })
    }
}

#[async_trait]
impl StreamSource for KafkaSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        if self.session.is_some() {
            self.close().await?;
        }

        let consumer: Arc<StreamConsumer> = Arc::new(self.consumer_config.create()?);
        let topics = self.refresher.current_topics().await?;
        subscribe(&consumer, &topics)?;
        let (topic_updates, refresh_task) = self.refresher.clone().spawn(topics.clone());

        metrics::counter!(SOURCE_CONNECTS).increment(1);
        info!(
            hosts = %self.url.bootstrap_servers(),
            group_id = %self.group_id,
            topics = ?topics,
            vetoed = ?self.refresher.selection().vetoed().collect::<Vec<_>>(),
            "Opened stream session"
        );

        self.session = Some(Session {
            consumer,
            topic_updates,
            updates_open: true,
            refresh_task,
            subscribed: topics,
            eof_partitions: HashSet::new(),
        });
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<ReceivedMessage>, SourceError> {
        loop {
            let session = self.session.as_mut().ok_or(SourceError::NotConnected)?;
            if self.until_eos && session.subscribed.is_empty() {
                return Ok(None);
            }
            if self.budget.exhausted(&session.subscribed) {
                info!(topics = ?session.subscribed, "Test message budget spent");
                return Ok(None);
            }

            tokio::select! {
                changed = session.topic_updates.changed(), if session.updates_open => {
                    match changed {
                        Ok(()) => {
                            let topics = session.topic_updates.borrow_and_update().clone();
                            session.resubscribe(topics)?;
                        }
                        Err(_) => {
                            warn!("Topic refresh task ended, subscription is now fixed");
                            session.updates_open = false;
                        }
                    }
                }
                received = session.consumer.recv() => {
                    match received {
                        Ok(msg) => {
                            session.eof_partitions.remove(&msg.partition());
                            if !self.budget.admits(msg.topic()) {
                                debug!(topic = msg.topic(), "Skipping message over test budget");
                                continue;
                            }
                            metrics::counter!(MESSAGES_RECEIVED).increment(1);
                            return Ok(Some(to_received(&msg)));
                        }
                        Err(KafkaError::PartitionEOF(partition)) => {
                            session.eof_partitions.insert(partition);
                            if self.until_eos && session.reached_end().await? {
                                info!(topics = ?session.subscribed, "Reached end of stream");
                                return Ok(None);
                            }
                        }
                        Err(e) => return Err(SourceError::Kafka(e)),
                    }
                }
            }
        }
    }

    async fn mark_done(&mut self, token: &OffsetToken) -> Result<(), SourceError> {
        let session = self.session.as_ref().ok_or(SourceError::NotConnected)?;
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            token.topic(),
            token.partition(),
            Offset::Offset(token.offset() + 1),
        )?;
        session.consumer.commit(&offsets, CommitMode::Sync)?;
        self.budget.record(token.topic());
        metrics::counter!(OFFSETS_COMMITTED).increment(1);
        Ok(())
    }

    async fn refresh_topics(&mut self) -> Result<Vec<String>, SourceError> {
        let topics = self.refresher.current_topics().await?;
        let session = self.session.as_mut().ok_or(SourceError::NotConnected)?;
        session.resubscribe(topics.clone())?;
        Ok(topics)
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if let Some(session) = self.session.take() {
            session.refresh_task.abort();
            session.consumer.unsubscribe();
            info!(group_id = %self.group_id, "Closed stream session");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::{
        message::{Header as KafkaHeader, OwnedHeaders, OwnedMessage},
        Timestamp,
    };
    use uuid::Uuid;

    use super::*;
    use crate::types::IDENTITY_HEADER;

    #[test]
    fn test_to_received_copies_headers_and_timestamp() {
        let uuid = Uuid::new_v4();
        let headers = OwnedHeaders::new()
            .insert(KafkaHeader {
                key: IDENTITY_HEADER,
                value: Some(uuid.as_bytes().as_slice()),
            })
            .insert(KafkaHeader {
                key: "_format",
                value: Some("json".as_bytes()),
            })
            .insert(KafkaHeader::<&[u8]> {
                key: "empty",
                value: None,
            });
        let msg = OwnedMessage::new(
            Some(b"{}".to_vec()),
            None,
            "t1".to_string(),
            Timestamp::CreateTime(1000),
            3,
            42,
            Some(headers),
        );

        let received = to_received(&msg);
        assert_eq!(received.message, Message::new("json", b"{}".to_vec()));
        assert_eq!(received.metadata.topic, "t1");
        assert_eq!(received.metadata.timestamp, 1000);
        assert_eq!(received.metadata.headers.len(), 3);
        assert_eq!(
            received.metadata.headers[0].value.as_bytes(),
            uuid.as_bytes().as_slice()
        );
        assert_eq!(
            received.metadata.headers[2].value,
            HeaderValue::Text(String::new())
        );
        assert_eq!(received.token, OffsetToken::new("t1", 3, 42));
    }

    #[test]
    fn test_to_received_without_payload_or_timestamp() {
        let msg = OwnedMessage::new(
            None,
            None,
            "t1".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            None,
        );
        let received = to_received(&msg);
        assert!(received.message.content.is_empty());
        assert_eq!(received.message.format, "blob");
        assert_eq!(received.metadata.timestamp, 0);
        assert!(received.metadata.headers.is_empty());
    }

    #[test]
    fn test_topic_budget() {
        let mut budget = TopicBudget::new(Some(2));
        let topics = vec!["t1".to_string()];
        assert!(budget.admits("t1"));
        budget.record("t1");
        assert!(!budget.exhausted(&topics));
        budget.record("t1");
        assert!(!budget.admits("t1"));
        assert!(budget.admits("t2"));
        assert!(budget.exhausted(&topics));

        let mut unlimited = TopicBudget::new(None);
        (0..100).for_each(|_| unlimited.record("t1"));
        assert!(unlimited.admits("t1"));
        assert!(!unlimited.exhausted(&topics));
    }

    #[test]
    fn test_topic_budget_ignores_uncommitted_reads() {
        let mut budget = TopicBudget::new(Some(1));
        // read but never committed, as when a session fails mid-message
        assert!(budget.admits("t1"));
        // redelivered after reconnecting, still admitted
        assert!(budget.admits("t1"));
        budget.record("t1");
        assert!(!budget.admits("t1"));
    }

    #[tokio::test]
    async fn test_no_assignment_is_not_end_of_stream() {
        // nothing listens here; an unassigned consumer never reaches the network
        let consumer: StreamConsumer = ConsumerConfigBuilder::new("localhost:1")
            .for_group("archive-test")
            .with_partition_eof(true)
            .build()
            .create()
            .unwrap();
        let (_updates, topic_updates) = watch::channel(Vec::new());
        let session = Session {
            consumer: Arc::new(consumer),
            topic_updates,
            updates_open: true,
            refresh_task: tokio::spawn(async {}),
            subscribed: Vec::new(),
            eof_partitions: HashSet::from([0]),
        };
        assert!(!session.reached_end().await.unwrap());
    }

    #[test]
    fn test_consumer_config() {
        let config = ConsumerConfigBuilder::new("b1:9092")
            .with_security(true, Some("archiver"), Some("secret"))
            .for_group("archiver-archive")
            .with_offset_reset("earliest")
            .with_partition_eof(true)
            .build();
        assert_eq!(config.get("group.id"), Some("archiver-archive"));
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.partition.eof"), Some("true"));

        let plain = ConsumerConfigBuilder::new("b1:9092")
            .with_security(false, Some("archiver"), None)
            .build();
        assert_eq!(plain.get("security.protocol"), None);
    }
}
