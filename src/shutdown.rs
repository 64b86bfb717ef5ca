use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::file_sink::{FileAppender, JsonlAppender};
use crate::queue::EventQueue;
use crate::registry::SessionRegistry;
use crate::router::PersistenceRouter;
use crate::session::{SessionLedger, SessionRecord};
use crate::settings::EffectiveConfig;
use crate::storage::{DurableStore, SqliteTranscriptStore};
use crate::watcher::{HistorySource, HistoryWatcher, WatcherHandle, export_history};

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub session_id: String,
    /// False when the drain timeout elapsed before the worker finished.
    pub drained: bool,
    pub history_artifact: Option<PathBuf>,
    pub session_artifact: Option<PathBuf>,
    pub stored_session_id: Option<String>,
    pub total_items: usize,
    /// Every session finalized during shutdown, the active one first.
    pub finalized_sessions: Vec<String>,
}

/// Result of finalizing one session.
#[derive(Debug, Clone, Default)]
pub struct FinalizedSession {
    pub artifact: Option<PathBuf>,
    pub stored_id: Option<String>,
    pub total_items: usize,
}

/// Writes `session_<id>.json` and hands the document to the durable store.
pub struct SessionFinalizer {
    artifact_dir: PathBuf,
    store: Option<Arc<dyn DurableStore>>,
    store_timeout: Duration,
}

impl SessionFinalizer {
    pub fn new(artifact_dir: PathBuf, store: Option<Arc<dyn DurableStore>>, store_timeout: Duration) -> Self {
        Self { artifact_dir, store, store_timeout }
    }

    pub async fn finalize(&self, record: &SessionRecord) -> FinalizedSession {
        let session_id = record.session_id.as_str();
        let path = self.artifact_dir.join(format!("session_{}.json", file_safe(session_id)));
        let artifact = match write_json(&path, record) {
            Ok(()) => Some(path),
            Err(e) => {
                error!(session_id, error = %e, "failed to write session document");
                None
            }
        };

        let stored_id = match &self.store {
            Some(store) => match tokio::time::timeout(self.store_timeout, store.create_session(record)).await {
                Ok(Ok(id)) => Some(id),
                Ok(Err(e)) => {
                    warn!(session_id, error = %e, "durable store rejected session document");
                    None
                }
                Err(_) => {
                    warn!(session_id, "durable store timed out storing session document");
                    None
                }
            },
            None => None,
        };

        counter!("transcript_sessions_finalized_total").increment(1);
        info!(session_id, total_items = record.total_items, "transcript session finalized");
        FinalizedSession { artifact, stored_id, total_items: record.total_items }
    }

    /// Closes `session_id` in the ledger and finalizes what it held. `metadata` is used when
    /// none was pinned at rotation.
    pub async fn finalize_from_ledger(
        &self,
        ledger: &SessionLedger,
        session_id: &str,
        metadata: Map<String, Value>,
    ) -> FinalizedSession {
        let (items, pinned) = ledger.take(session_id);
        let record = SessionRecord::assemble(session_id, items, pinned.unwrap_or(metadata));
        self.finalize(&record).await
    }
}

/// A running capture pipeline: queue, worker, optional history watcher.
pub struct TranscriptPipeline {
    queue: EventQueue,
    worker: JoinHandle<()>,
    finalizer: Arc<SessionFinalizer>,
    watcher: Option<WatcherHandle>,
    artifact_dir: PathBuf,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl TranscriptPipeline {
    pub fn start(
        config: &EffectiveConfig,
        registry: Arc<SessionRegistry>,
        store: Option<Arc<dyn DurableStore>>,
        appender: Arc<dyn FileAppender>,
    ) -> Self {
        let finalizer = Arc::new(SessionFinalizer::new(config.artifact_dir.clone(), store.clone(), config.drain_timeout));
        let router = PersistenceRouter::new(store, appender);
        let (queue, worker) = EventQueue::start(
            config.queue_capacity,
            registry,
            router,
            Arc::new(SessionLedger::new()),
            Some(finalizer.clone()),
        );
        Self {
            queue,
            worker,
            finalizer,
            watcher: None,
            artifact_dir: config.artifact_dir.clone(),
            poll_interval: config.poll_interval,
            drain_timeout: config.drain_timeout,
        }
    }

    /// Opens the configured sinks. Misconfiguration here is returned to the caller.
    pub async fn from_config(config: &EffectiveConfig, registry: Arc<SessionRegistry>) -> anyhow::Result<Self> {
        let store: Option<Arc<dyn DurableStore>> = if config.durable_store_enabled {
            Some(Arc::new(SqliteTranscriptStore::initialize(config.database_url.clone()).await?))
        } else {
            None
        };
        std::fs::create_dir_all(&config.artifact_dir)?;
        info!(
            log_path = %config.log_path.display(),
            durable_store = store.is_some(),
            "transcript pipeline started"
        );
        let appender = Arc::new(JsonlAppender::new(&config.log_path));
        Ok(Self::start(config, registry, store, appender))
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.queue.registry()
    }

    /// Switches to `next` (or a generated id); the outgoing session is finalized by the worker.
    pub fn rotate_session(&self, next: Option<String>) -> String {
        self.queue.rotate_session(next)
    }

    /// Registers `source` as the session's history and starts polling it.
    pub fn watch_history(&mut self, source: Arc<dyn HistorySource>) {
        self.registry().set_history_source(source.clone());
        let watcher = HistoryWatcher::new(source, self.queue.clone(), self.poll_interval);
        if let Some(previous) = self.watcher.replace(watcher.spawn()) {
            tokio::spawn(previous.stop());
        }
    }

    /// Saves the full history export, drains the queue within the drain timeout, then
    /// finalizes the active session and any other session still open in the ledger.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self { queue, worker, finalizer, watcher, artifact_dir, drain_timeout, .. } = self;
        let registry = queue.registry().clone();
        let session_id = registry.session_id_or_default();

        if let Some(watcher) = watcher {
            watcher.stop().await;
        }

        let history_artifact = match registry.history_source() {
            Some(source) => {
                let (dir, id) = (artifact_dir.clone(), session_id.clone());
                let saved = tokio::task::spawn_blocking(move || save_history_export(&dir, &id, source.as_ref()))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|r| r);
                match saved {
                    Ok(path) => Some(path),
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "shutdown_save_failed");
                        queue.log_system("shutdown_save_failed", json!({ "error": e.to_string() }));
                        None
                    }
                }
            }
            None => {
                debug!(session_id = %session_id, "no history source registered; skipping export");
                None
            }
        };

        let drained = match tokio::time::timeout(drain_timeout, async {
            queue.stop().await;
            worker.await
        })
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "transcript worker failed during drain");
                false
            }
            Err(_) => {
                warn!(timeout_ms = drain_timeout.as_millis() as u64, "transcript drain timed out; continuing shutdown");
                false
            }
        };

        let ledger = queue.ledger();
        let active = finalizer.finalize_from_ledger(ledger, &session_id, registry.metadata()).await;
        let mut finalized_sessions = vec![session_id.clone()];
        for other in ledger.session_ids() {
            if other == session_id {
                continue;
            }
            finalizer.finalize_from_ledger(ledger, &other, Map::new()).await;
            finalized_sessions.push(other);
        }

        ShutdownReport {
            session_id,
            drained,
            history_artifact,
            session_artifact: active.artifact,
            stored_session_id: active.stored_id,
            total_items: active.total_items,
            finalized_sessions,
        }
    }
}

fn save_history_export(dir: &Path, session_id: &str, source: &dyn HistorySource) -> anyhow::Result<PathBuf> {
    let captured_at = Utc::now();
    let doc = json!({
        "session_id": session_id,
        "captured_at": captured_at.to_rfc3339(),
        "history": export_history(source),
    });
    let path = dir.join(format!(
        "history_{}_{}.json",
        file_safe(session_id),
        captured_at.format("%Y%m%d_%H%M%S")
    ));
    write_json(&path, &doc)?;
    Ok(path)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

fn file_safe(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
