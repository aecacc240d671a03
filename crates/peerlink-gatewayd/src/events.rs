//! Human-readable events attached to connection descriptors.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use peerlink_types::ClusterIdentity;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{info, warn};

/// Events kept per identity by [`LoggingRecorder`].
pub const DEFAULT_EVENT_HISTORY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Normal => f.write_str("Normal"),
            EventKind::Warning => f.write_str("Warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, id: &ClusterIdentity, kind: EventKind, reason: &str, message: &str);

    fn normal(&self, id: &ClusterIdentity, reason: &str, message: &str) {
        self.record(id, EventKind::Normal, reason, message);
    }

    fn warning(&self, id: &ClusterIdentity, reason: &str, message: &str) {
        self.record(id, EventKind::Warning, reason, message);
    }
}

/// Logs every event and keeps the most recent ones per identity.
pub struct LoggingRecorder {
    history: usize,
    events: Mutex<BTreeMap<ClusterIdentity, VecDeque<Event>>>,
}

impl Default for LoggingRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_HISTORY)
    }
}

impl LoggingRecorder {
    pub fn new(history: usize) -> Self {
        Self {
            history: history.max(1),
            events: Mutex::new(BTreeMap::new()),
        }
    }

    /// Oldest first.
    pub fn events(&self, id: &ClusterIdentity) -> Vec<Event> {
        self.events
            .lock()
            .get(id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reasons(&self, id: &ClusterIdentity) -> Vec<String> {
        self.events(id).into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for LoggingRecorder {
    fn record(&self, id: &ClusterIdentity, kind: EventKind, reason: &str, message: &str) {
        match kind {
            EventKind::Normal => info!(cluster = %id, reason, "{}", message),
            EventKind::Warning => warn!(cluster = %id, reason, "{}", message),
        }

        let mut events = self.events.lock();
        let queue = events.entry(id.clone()).or_default();
        if queue.len() == self.history {
            queue.pop_front();
        }
        queue.push_back(Event {
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}
