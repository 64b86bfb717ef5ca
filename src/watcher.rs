use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::ExportError;
use crate::event::{EventSource, Role, TranscriptEvent, join_content};
use crate::payload::{Exportable, Payload};
use crate::queue::EventQueue;
use crate::sanitize::{PLACEHOLDER, guarded, sanitize};

/// Externally owned, mutable conversation history.
///
/// Implementors expose whichever shapes they have; the watcher tries `items`, then
/// `to_dict`, then `to_json`. Spawned watchers poll on tokio's blocking pool, so these calls
/// may do file or lock I/O.
pub trait HistorySource: Exportable {
    fn items(&self) -> Result<Vec<Payload>, ExportError> {
        Err(ExportError::Unsupported)
    }
}

type Reader = fn(&dyn HistorySource) -> Result<Vec<Payload>, ExportError>;

const READERS: &[(&str, Reader)] = &[
    ("items", read_items),
    ("to_dict", read_dict),
    ("to_json", read_json),
];

fn read_items(source: &dyn HistorySource) -> Result<Vec<Payload>, ExportError> {
    guarded(|| source.items())
}

fn read_dict(source: &dyn HistorySource) -> Result<Vec<Payload>, ExportError> {
    items_of(guarded(|| source.to_dict())?)
}

fn read_json(source: &dyn HistorySource) -> Result<Vec<Payload>, ExportError> {
    let raw = guarded(|| source.to_json())?;
    let parsed: Value = serde_json::from_str(&raw)?;
    items_of(Payload::from(parsed))
}

fn items_of(export: Payload) -> Result<Vec<Payload>, ExportError> {
    match export {
        Payload::List(items) => Ok(items),
        map @ Payload::Map(_) => match map.get("items") {
            Some(Payload::List(items)) => Ok(items.clone()),
            _ => Err(ExportError::failed("export has no items list")),
        },
        _ => Err(ExportError::failed("export is neither a list nor a mapping")),
    }
}

/// Current items of `source`, from the first reader that works.
pub fn snapshot_items(source: &dyn HistorySource) -> Result<Vec<Payload>, ExportError> {
    let mut last = ExportError::Unsupported;
    for (name, read) in READERS {
        match read(source) {
            Ok(items) => return Ok(items),
            Err(e) => {
                debug!(reader = *name, error = %e, "history reader failed");
                last = e;
            }
        }
    }
    Err(last)
}

/// Full structured export of `source`; falls back to its textual rendering.
pub fn export_history(source: &dyn HistorySource) -> Value {
    if let Ok(items) = guarded(|| source.items()) {
        return json!({ "items": items.iter().map(sanitize).collect::<Vec<_>>() });
    }
    if let Ok(dict) = guarded(|| source.to_dict()) {
        return sanitize(&dict);
    }
    if let Ok(parsed) = guarded(|| source.to_json()).and_then(|raw| Ok(serde_json::from_str::<Value>(&raw)?)) {
        return parsed;
    }
    let text = guarded(|| source.render()).unwrap_or_else(|_| PLACEHOLDER.to_string());
    json!({ "value": text })
}

/// Explicit `id` when present, otherwise the compact rendering of the whole item.
pub fn item_identity(item: &Value) -> String {
    match item.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => item.to_string(),
    }
}

/// Turns one sanitized history item into an event stamped with the current time.
pub fn history_event(item: Value) -> Result<TranscriptEvent, ExportError> {
    if !item.is_object() {
        return Err(ExportError::failed("history item is not a mapping"));
    }
    let item_type = item.get("type").and_then(Value::as_str).map(str::to_string);
    let role = item.get("role").and_then(Value::as_str).map(Role::parse);
    let mut content = item.get("content").map(join_content).unwrap_or_default();

    let role = match item_type.as_deref() {
        Some("function_call") => {
            if content.is_empty() {
                let name = item.get("name").and_then(Value::as_str).unwrap_or("unknown");
                let args = item.get("arguments").map(join_content).unwrap_or_default();
                content = format!("{}({})", name, args);
            }
            role.unwrap_or(Role::Agent)
        }
        Some("function_call_output") => {
            if content.is_empty() {
                content = item.get("output").map(join_content).unwrap_or_default();
            }
            role.unwrap_or(Role::System)
        }
        _ => role.unwrap_or(Role::Unknown),
    };

    Ok(TranscriptEvent {
        role,
        content,
        timestamp: Utc::now(),
        source: EventSource::SessionHistory,
        item_type,
        raw: Payload::from(item),
    })
}

/// Polls a history source and enqueues items it has not seen before.
pub struct HistoryWatcher {
    source: Arc<dyn HistorySource>,
    queue: EventQueue,
    seen: HashSet<String>,
    poll_interval: Duration,
}

impl HistoryWatcher {
    pub fn new(source: Arc<dyn HistorySource>, queue: EventQueue, poll_interval: Duration) -> Self {
        Self { source, queue, seen: HashSet::new(), poll_interval }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// One snapshot-diff-enqueue cycle. Returns how many events were enqueued.
    pub fn poll_once(&mut self) -> usize {
        let items = match snapshot_items(self.source.as_ref()) {
            Ok(items) => items,
            Err(e) => {
                debug!(error = %e, "history snapshot unavailable; treating poll as empty");
                return 0;
            }
        };

        let mut enqueued = 0usize;
        for item in &items {
            let value = sanitize(item);
            if !self.seen.insert(item_identity(&value)) {
                continue;
            }
            match history_event(value) {
                Ok(event) => {
                    self.queue.enqueue(event);
                    enqueued += 1;
                }
                Err(e) => debug!(error = %e, "skipping uninterpretable history item"),
            }
        }
        if enqueued > 0 {
            counter!("transcript_history_items_total").increment(enqueued as u64);
        }
        enqueued
    }

    pub fn spawn(self) -> WatcherHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(stop_rx));
        WatcherHandle { stop_tx, join }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watcher = self;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
            watcher = match tokio::task::spawn_blocking(move || {
                watcher.poll_once();
                watcher
            })
            .await
            {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!(error = %e, "history poll task failed; watcher stopped");
                    return;
                }
            };
        }
        debug!(seen = watcher.seen.len(), "history watcher stopped");
    }
}

pub struct WatcherHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WatcherHandle {
    /// Signals the loop and waits for it to reach its next interval boundary.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "history watcher task ended abnormally");
        }
    }
}

/// History exposed by an orchestrator as a JSON file, re-read on every poll.
#[derive(Debug, Clone)]
pub struct JsonFileHistory {
    path: PathBuf,
}

impl JsonFileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Exportable for JsonFileHistory {
    fn to_json(&self) -> Result<String, ExportError> {
        std::fs::read_to_string(&self.path)
            .map_err(|e| ExportError::failed(format!("{}: {}", self.path.display(), e)))
    }

    fn render(&self) -> Result<String, ExportError> {
        Ok(format!("JsonFileHistory({})", self.path.display()))
    }
}

impl HistorySource for JsonFileHistory {}
