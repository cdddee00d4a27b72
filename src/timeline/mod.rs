//! Ordered session timeline.
//!
//! Sessions report through the [`EventSink`] trait. The primary sink,
//! [`Timeline`], keeps an append-only list, fans events out to live
//! subscribers, and optionally mirrors them to a [`JsonlTimelineWriter`].

pub mod writer;

use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::warn;

pub use writer::JsonlTimelineWriter;

use crate::models::TimelineEvent;

/// Consumer of timeline events. Recording never blocks on acknowledgement.
pub trait EventSink: Send + Sync {
    /// Append one event.
    fn record(&self, event: TimelineEvent);
}

const FEED_CAPACITY: usize = 256;

/// Append-only timeline shared by all sessions.
pub struct Timeline {
    entries: Mutex<Vec<TimelineEvent>>,
    feed: broadcast::Sender<TimelineEvent>,
    writer: Option<JsonlTimelineWriter>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    /// In-memory timeline.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            entries: Mutex::new(Vec::new()),
            feed,
            writer: None,
        }
    }

    /// Timeline that also appends every event to a JSONL file.
    #[must_use]
    pub fn with_writer(writer: JsonlTimelineWriter) -> Self {
        Self {
            writer: Some(writer),
            ..Self::new()
        }
    }

    /// Copy of all events recorded so far, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<TimelineEvent> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live feed of events recorded from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.feed.subscribe()
    }
}

impl EventSink for Timeline {
    fn record(&self, event: TimelineEvent) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = &self.writer {
            if let Err(err) = writer.append(&event) {
                warn!(%err, "failed to mirror timeline event");
            }
        }
        // Sent under the entries lock so the feed order matches the list.
        let _ = self.feed.send(event.clone());
        entries.push(event);
    }
}
