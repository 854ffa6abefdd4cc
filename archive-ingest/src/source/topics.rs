use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use super::{BrokerUrl, SourceError};
use crate::{
    config::SourceConfig,
    metrics_const::{SUBSCRIBED_TOPICS, TOPIC_REFRESHES},
};

/// Lists the topics the broker lets us read.
#[async_trait]
pub trait TopicDiscovery: Send + Sync {
    async fn list_topics(&self) -> Result<Vec<String>, SourceError>;
}

/// Decides which topics to subscribe to from what the broker offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSelection {
    explicit: Vec<String>,
    vetoed: BTreeSet<String>,
    test_topic: String,
    test_mode: bool,
}

impl TopicSelection {
    pub fn new(
        explicit: Vec<String>,
        vetoed: impl IntoIterator<Item = String>,
        test_topic: impl Into<String>,
        test_mode: bool,
    ) -> Self {
        let test_topic = test_topic.into();
        let mut vetoed: BTreeSet<String> = vetoed.into_iter().collect();
        // the archiver never archives its own test traffic outside of test mode
        if !test_mode {
            vetoed.insert(test_topic.clone());
        }
        Self {
            explicit,
            vetoed,
            test_topic,
            test_mode,
        }
    }

    pub fn from_config(config: &SourceConfig, url: &BrokerUrl) -> Self {
        Self::new(
            url.topics.clone(),
            config.vetoed_topics(),
            config.source_test_topic.clone(),
            config.source_test_mode,
        )
    }

    pub fn vetoed(&self) -> impl Iterator<Item = &str> {
        self.vetoed.iter().map(String::as_str)
    }

    /// Whether the broker needs to be asked at all.
    pub fn needs_discovery(&self) -> bool {
        !self.test_mode && self.explicit.is_empty()
    }

    /// Sorted, deduplicated topic set to subscribe to.
    pub fn select(&self, available: &[String]) -> Vec<String> {
        if self.test_mode {
            return vec![self.test_topic.clone()];
        }
        let candidates = if self.explicit.is_empty() {
            available
        } else {
            self.explicit.as_slice()
        };
        let selected: BTreeSet<&String> = candidates
            .iter()
            .filter(|t| !self.vetoed.contains(*t))
            .collect();
        selected.into_iter().cloned().collect()
    }
}

/// Periodically recomputes the topic set and publishes changes on a watch channel.
#[derive(Clone)]
pub struct TopicRefresher {
    discovery: Arc<dyn TopicDiscovery>,
    selection: TopicSelection,
    interval: Duration,
}

impl TopicRefresher {
    pub fn new(
        discovery: Arc<dyn TopicDiscovery>,
        selection: TopicSelection,
        interval: Duration,
    ) -> Self {
        Self {
            discovery,
            selection,
            interval,
        }
    }

    pub fn selection(&self) -> &TopicSelection {
        &self.selection
    }

    /// One discovery round.
    pub async fn current_topics(&self) -> Result<Vec<String>, SourceError> {
        let available = if self.selection.needs_discovery() {
            self.discovery.list_topics().await?
        } else {
            Vec::new()
        };
        let topics = self.selection.select(&available);
        metrics::gauge!(SUBSCRIBED_TOPICS).set(topics.len() as f64);
        Ok(topics)
    }

    /// Starts the background refresh task. It ends when every receiver is dropped.
    pub fn spawn(self, initial: Vec<String>) -> (watch::Receiver<Vec<String>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(initial);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately and the caller already has the initial set
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                match self.current_topics().await {
                    Ok(topics) => {
                        let changed = tx.send_if_modified(|current| {
                            if *current == topics {
                                false
                            } else {
                                *current = topics.clone();
                                true
                            }
                        });
                        let outcome = if changed { "changed" } else { "unchanged" };
                        metrics::counter!(TOPIC_REFRESHES, "outcome" => outcome).increment(1);
                        if changed {
                            info!(
                                topics = ?topics,
                                vetoed = ?self.selection.vetoed().collect::<Vec<_>>(),
                                "Topic set changed"
                            );
                        }
                    }
                    Err(e) => {
                        metrics::counter!(TOPIC_REFRESHES, "outcome" => "error").increment(1);
                        warn!("Topic refresh failed, keeping current subscription: {e:#}");
                    }
                }
            }
        });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct StaticDiscovery(Mutex<Vec<String>>);

    #[async_trait]
    impl TopicDiscovery for StaticDiscovery {
        async fn list_topics(&self) -> Result<Vec<String>, SourceError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_subtracts_vetoes_and_test_topic() {
        let selection = TopicSelection::new(vec![], names(&["_schemas"]), "archive.test", false);
        let selected = selection.select(&names(&["t2", "archive.test", "_schemas", "t1", "t1"]));
        assert_eq!(selected, names(&["t1", "t2"]));
        assert!(selection.vetoed().any(|t| t == "archive.test"));
    }

    #[test]
    fn test_select_test_mode_uses_only_test_topic() {
        let selection = TopicSelection::new(vec![], names(&["_schemas"]), "archive.test", true);
        assert_eq!(selection.select(&names(&["t1", "t2"])), names(&["archive.test"]));
        assert!(!selection.needs_discovery());
    }

    #[test]
    fn test_select_explicit_topics_skip_discovery() {
        let selection = TopicSelection::new(
            names(&["t9", "_schemas"]),
            names(&["_schemas"]),
            "archive.test",
            false,
        );
        assert!(!selection.needs_discovery());
        assert_eq!(selection.select(&names(&["t1"])), names(&["t9"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_publishes_changes() {
        let discovery = Arc::new(StaticDiscovery(Mutex::new(names(&["t1"]))));
        let refresher = TopicRefresher::new(
            discovery.clone(),
            TopicSelection::new(vec![], vec![], "archive.test", false),
            Duration::from_secs(60),
        );
        let initial = refresher.current_topics().await.unwrap();
        assert_eq!(initial, names(&["t1"]));

        let (mut rx, handle) = refresher.spawn(initial);
        *discovery.0.lock().unwrap() = names(&["t1", "t2", "archive.test"]);

        tokio::time::timeout(Duration::from_secs(120), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow_and_update(), names(&["t1", "t2"]));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(120), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
