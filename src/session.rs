use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// A finalized conversation, persisted when its session ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub items: Vec<Value>,
    pub total_items: usize,
    pub duration_seconds: f64,
    pub metadata: Map<String, Value>,
}

impl SessionRecord {
    /// Builds the session document; times are the min/max of item timestamps.
    pub fn assemble(session_id: impl Into<String>, items: Vec<Value>, metadata: Map<String, Value>) -> Self {
        let stamps: Vec<DateTime<Utc>> = items
            .iter()
            .filter_map(|item| item.get("timestamp").and_then(Value::as_str))
            .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .collect();
        let start_time = stamps.iter().min().copied();
        let end_time = stamps.iter().max().copied();
        let duration_seconds = match (start_time, end_time) {
            (Some(s), Some(e)) => (e - s).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        Self {
            session_id: session_id.into(),
            start_time,
            end_time,
            total_items: items.len(),
            items,
            duration_seconds,
            metadata,
        }
    }
}

/// In-process record of the lines that reached the sinks, per open session.
///
/// A session is closed by [`SessionLedger::take`]; lines that arrive for a closed session are
/// already in the sinks and are not kept again.
#[derive(Debug, Default)]
pub struct SessionLedger {
    sessions: Mutex<HashMap<String, Vec<Value>>>,
    metadata: Mutex<HashMap<String, Map<String, Value>>>,
    closed: Mutex<HashSet<String>>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session_id: &str, line: Value) {
        if self.closed.lock().unwrap_or_else(|p| p.into_inner()).contains(session_id) {
            debug!(session_id, "line for an already finalized session; kept in sinks only");
            return;
        }
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.entry(session_id.to_string()).or_default().push(line);
    }

    pub fn items(&self, session_id: &str) -> Vec<Value> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    pub fn len(&self, session_id: &str) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        sessions.get(session_id).map(Vec::len).unwrap_or(0)
    }

    /// Sessions that still hold lines, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remembers the metadata a session had when it stopped being active.
    pub fn pin_metadata(&self, session_id: &str, metadata: Map<String, Value>) {
        self.metadata.lock().unwrap_or_else(|p| p.into_inner()).insert(session_id.to_string(), metadata);
    }

    /// Removes and returns a session's lines and pinned metadata, closing the session.
    pub fn take(&self, session_id: &str) -> (Vec<Value>, Option<Map<String, Value>>) {
        self.closed.lock().unwrap_or_else(|p| p.into_inner()).insert(session_id.to_string());
        let items = self.sessions.lock().unwrap_or_else(|p| p.into_inner()).remove(session_id);
        let metadata = self.metadata.lock().unwrap_or_else(|p| p.into_inner()).remove(session_id);
        (items.unwrap_or_default(), metadata)
    }

    /// Opens a session id again, e.g. when it becomes active after an earlier finalization.
    pub fn reopen(&self, session_id: &str) {
        self.closed.lock().unwrap_or_else(|p| p.into_inner()).remove(session_id);
    }
}
