use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tracing::{error, warn};

use crate::file_sink::FileAppender;
use crate::storage::DurableStore;

/// What happened to one record at each sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistOutcome {
    /// `None` when no durable store is configured.
    pub durable: Option<bool>,
    pub file: bool,
}

/// Durable store first when configured, file sink always.
#[derive(Clone)]
pub struct PersistenceRouter {
    store: Option<Arc<dyn DurableStore>>,
    appender: Arc<dyn FileAppender>,
}

impl PersistenceRouter {
    pub fn new(store: Option<Arc<dyn DurableStore>>, appender: Arc<dyn FileAppender>) -> Self {
        Self { store, appender }
    }

    pub fn appender(&self) -> Arc<dyn FileAppender> {
        self.appender.clone()
    }

    pub async fn persist(&self, record: &Value, session_id: &str) -> PersistOutcome {
        let durable = match &self.store {
            Some(store) => Some(match store.log_event(record, session_id).await {
                Ok(()) => {
                    counter!("transcript_events_persisted_total", "sink" => "durable").increment(1);
                    true
                }
                Err(e) => {
                    counter!("transcript_sink_failures_total", "sink" => "durable").increment(1);
                    warn!(session_id, error = %e, "durable store write failed; file sink still receives the event");
                    false
                }
            }),
            None => None,
        };

        let file = match self.appender.append(record) {
            Ok(()) => {
                counter!("transcript_events_persisted_total", "sink" => "file").increment(1);
                true
            }
            Err(e) => {
                counter!("transcript_sink_failures_total", "sink" => "file").increment(1);
                error!(session_id, error = %e, "file sink write failed; event lost");
                false
            }
        };

        PersistOutcome { durable, file }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::error::SinkError;
    use crate::file_sink::FileAppender;
    use crate::session::SessionRecord;
    use crate::storage::DurableStore;

    #[derive(Default)]
    pub struct MemoryAppender {
        pub lines: Mutex<Vec<Value>>,
    }

    impl MemoryAppender {
        pub fn contents(&self) -> Vec<String> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .map(|v| v["content"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    impl FileAppender for MemoryAppender {
        fn append(&self, record: &Value) -> Result<(), SinkError> {
            self.lines.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    pub struct BrokenAppender;

    impl FileAppender for BrokenAppender {
        fn append(&self, _record: &Value) -> Result<(), SinkError> {
            Err(SinkError::io("/dev/full", std::io::Error::other("disk full")))
        }
    }

    #[derive(Default)]
    pub struct MemoryStore {
        pub events: Mutex<Vec<(String, Value)>>,
        pub sessions: Mutex<Vec<SessionRecord>>,
    }

    #[async_trait]
    impl DurableStore for MemoryStore {
        async fn log_event(&self, event: &Value, session_id: &str) -> anyhow::Result<()> {
            self.events.lock().unwrap().push((session_id.to_string(), event.clone()));
            Ok(())
        }

        async fn create_session(&self, session: &SessionRecord) -> anyhow::Result<String> {
            self.sessions.lock().unwrap().push(session.clone());
            Ok(format!("stored-{}", session.session_id))
        }
    }

    pub struct DownStore;

    #[async_trait]
    impl DurableStore for DownStore {
        async fn log_event(&self, _event: &Value, _session_id: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }

        async fn create_session(&self, _session: &SessionRecord) -> anyhow::Result<String> {
            anyhow::bail!("connection refused")
        }
    }

    /// Takes `delay` per event, to outpace the worker.
    pub struct SlowStore {
        pub delay: Duration,
    }

    #[async_trait]
    impl DurableStore for SlowStore {
        async fn log_event(&self, _event: &Value, _session_id: &str) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn create_session(&self, session: &SessionRecord) -> anyhow::Result<String> {
            Ok(session.session_id.clone())
        }
    }
}
