use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::{OffsetToken, ReceivedMessage, SourceError, StreamSource};
use crate::{
    config::{split_list, ConfigError},
    metrics_const::{MESSAGES_RECEIVED, OFFSETS_COMMITTED},
    types::{Header, Message, Metadata, IDENTITY_HEADER},
};

pub const MOCK_TOPIC: &str = "mock.topic";
pub const MOCK_USE_CASE_HEADER: &str = "_mock_use_case";
const MOCK_PAYLOAD_SIZE: usize = 50_000;
const TEN_DAYS_MS: i64 = 10 * 24 * 60 * 60 * 1000;

/// Delivery patterns the real broker produces only under failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockScenario {
    /// Client uuid, delivered twice in quick succession.
    ClientUuidRecent,
    /// Client uuid, delivered again after a cursor reset ten days later.
    ClientUuidReplayed,
    /// No client uuid (old publisher), delivered twice in quick succession.
    ServerUuidRecent,
    /// No client uuid, delivered again after a cursor reset.
    ServerUuidReplayed,
}

impl MockScenario {
    pub const ALL: [MockScenario; 4] = [
        MockScenario::ClientUuidRecent,
        MockScenario::ClientUuidReplayed,
        MockScenario::ServerUuidRecent,
        MockScenario::ServerUuidReplayed,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MockScenario::ClientUuidRecent => "client-uuid-recent",
            MockScenario::ClientUuidReplayed => "client-uuid-replayed",
            MockScenario::ServerUuidRecent => "server-uuid-recent",
            MockScenario::ServerUuidReplayed => "server-uuid-replayed",
        }
    }

    /// Both deliveries of the scenario's message.
    pub fn deliveries(&self, now_ms: i64) -> [(Message, Metadata); 2] {
        let timestamp = match self {
            MockScenario::ClientUuidRecent | MockScenario::ServerUuidRecent => now_ms,
            MockScenario::ClientUuidReplayed | MockScenario::ServerUuidReplayed => {
                now_ms - TEN_DAYS_MS
            }
        };
        let mut headers = vec![Header::text(MOCK_USE_CASE_HEADER, self.label())];
        if matches!(
            self,
            MockScenario::ClientUuidRecent | MockScenario::ClientUuidReplayed
        ) {
            headers.push(Header::bytes(IDENTITY_HEADER, Uuid::new_v4().as_bytes().to_vec()));
        }

        let mut content = format!("{} received twice", self.label()).into_bytes();
        content.resize(MOCK_PAYLOAD_SIZE, b'.');
        let delivery = (
            Message::from_headers(&headers, content),
            Metadata {
                topic: MOCK_TOPIC.to_string(),
                timestamp,
                headers,
            },
        );
        [delivery.clone(), delivery]
    }
}

impl FromStr for MockScenario {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MockScenario::ALL
            .into_iter()
            .find(|scenario| scenario.label() == s.trim())
            .ok_or_else(|| ConfigError::UnknownBackend {
                kind: "mock scenario",
                value: s.to_string(),
            })
    }
}

/// Parses `all` or a comma separated list of scenario labels.
pub fn parse_scenarios(value: &str) -> Result<Vec<MockScenario>, ConfigError> {
    if value.trim() == "all" {
        return Ok(MockScenario::ALL.to_vec());
    }
    split_list(value).iter().map(|s| s.parse()).collect()
}

#[derive(Default)]
struct MockLog {
    messages: Vec<(Message, Metadata)>,
    // next offset a fresh session starts from
    committed: usize,
    // None while disconnected
    position: Option<usize>,
    commits: usize,
    connects: usize,
    failures_pending: usize,
}

/// In-memory single-partition stream with a committed offset, so reconnecting
/// replays everything not yet marked done. Clones share the same log.
#[derive(Clone)]
pub struct MockSource {
    log: Arc<Mutex<MockLog>>,
    until_eos: bool,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSource {
    /// A bounded, empty stream.
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(MockLog::default())),
            until_eos: true,
        }
    }

    pub fn with_messages(messages: Vec<(Message, Metadata)>) -> Self {
        Self {
            log: Arc::new(Mutex::new(MockLog {
                messages,
                ..Default::default()
            })),
            until_eos: true,
        }
    }

    pub fn with_scenarios(scenarios: &[MockScenario], now_ms: i64) -> Self {
        Self::with_messages(
            scenarios
                .iter()
                .flat_map(|s| s.deliveries(now_ms))
                .collect(),
        )
    }

    /// Keep waiting at the end of the log instead of reporting end of stream.
    pub fn unbounded(mut self) -> Self {
        self.until_eos = false;
        self
    }

    pub async fn push(&self, message: Message, metadata: Metadata) {
        self.log.lock().await.messages.push((message, metadata));
    }

    /// Next `n` reads fail as a lost session.
    pub async fn fail_next_reads(&self, n: usize) {
        self.log.lock().await.failures_pending = n;
    }

    pub async fn committed(&self) -> usize {
        self.log.lock().await.committed
    }

    pub async fn commits(&self) -> usize {
        self.log.lock().await.commits
    }

    pub async fn connects(&self) -> usize {
        self.log.lock().await.connects
    }
}

#[async_trait]
impl StreamSource for MockSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        let mut log = self.log.lock().await;
        log.position = Some(log.committed);
        log.connects += 1;
        info!(offset = log.committed, "Mock source connected");
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<ReceivedMessage>, SourceError> {
        let mut log = self.log.lock().await;
        let position = log.position.ok_or(SourceError::NotConnected)?;
        if log.failures_pending > 0 {
            log.failures_pending -= 1;
            log.position = None;
            return Err(SourceError::Disconnected("injected mock failure".to_string()));
        }

        let Some((message, metadata)) = log.messages.get(position).cloned() else {
            if self.until_eos {
                return Ok(None);
            }
            drop(log);
            std::future::pending::<()>().await;
            return Ok(None);
        };
        log.position = Some(position + 1);
        metrics::counter!(MESSAGES_RECEIVED).increment(1);

        let token = OffsetToken::new(metadata.topic.clone(), 0, position as i64);
        Ok(Some(ReceivedMessage {
            message,
            metadata,
            token,
        }))
    }

    async fn mark_done(&mut self, token: &OffsetToken) -> Result<(), SourceError> {
        let mut log = self.log.lock().await;
        if log.position.is_none() {
            return Err(SourceError::NotConnected);
        }
        let next = usize::try_from(token.offset() + 1)
            .ok()
            .filter(|next| *next <= log.messages.len())
            .ok_or_else(|| SourceError::ForeignToken {
                topic: token.topic().to_string(),
                partition: token.partition(),
            })?;
        log.committed = log.committed.max(next);
        log.commits += 1;
        metrics::counter!(OFFSETS_COMMITTED).increment(1);
        Ok(())
    }

    async fn refresh_topics(&mut self) -> Result<Vec<String>, SourceError> {
        let log = self.log.lock().await;
        let mut topics: Vec<String> = log.messages.iter().map(|(_, m)| m.topic.clone()).collect();
        topics.sort();
        topics.dedup();
        Ok(topics)
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.log.lock().await.position = None;
        Ok(())
    }
}
