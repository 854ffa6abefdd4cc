use serde::Serialize;

use super::{AuditError, Auditor};
use crate::catalog::TopicStats;

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSection {
    pub label: &'static str,
    pub since_ms: i64,
    pub topics: Vec<TopicStats>,
}

impl Auditor {
    /// Per-topic totals since archiving began, over the last day and over the last hour.
    pub async fn status(&self, now_ms: i64) -> Result<Vec<StatusSection>, AuditError> {
        let windows = [
            ("since start of archiving", 0),
            ("last 24 hours", now_ms - DAY_MS),
            ("last hour", now_ms - HOUR_MS),
        ];
        let mut sections = Vec::with_capacity(windows.len());
        for (label, since_ms) in windows {
            sections.push(StatusSection {
                label,
                since_ms,
                topics: self.catalog.topic_stats(since_ms).await?,
            });
        }
        Ok(sections)
    }
}
