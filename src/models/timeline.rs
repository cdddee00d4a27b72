//! Timeline records emitted by sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable entry of the session timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    /// Label of the session that produced the event.
    pub session_label: String,
    /// Statement text or lifecycle message.
    pub content: String,
    /// Creation time, serialized as epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl TimelineEvent {
    /// Stamp a new event with the current time.
    #[must_use]
    pub fn new(session_label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_label: session_label.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Timestamp as milliseconds since the Unix epoch.
    #[must_use]
    pub fn epoch_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
