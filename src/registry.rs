use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::watcher::HistorySource;

/// Session id used for events queued before any session id was set.
pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Default)]
struct RegistryState {
    session_id: Option<String>,
    dialed_number: Option<String>,
    history: Option<Arc<dyn HistorySource>>,
    metadata: Map<String, Value>,
}

/// Process-wide view of the active session, passed around as `Arc<SessionRegistry>`.
///
/// Writers are expected to be serialized by the caller: a new `set_session_id` logically
/// happens after the previous session's producers are done.
#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        info!(session_id = %session_id, "transcript session id set");
        self.write().session_id = Some(session_id);
    }

    pub fn set_dialed_number(&self, dialed_number: impl Into<String>) {
        self.write().dialed_number = Some(dialed_number.into());
    }

    pub fn set_history_source(&self, history: Arc<dyn HistorySource>) {
        self.write().history = Some(history);
    }

    pub fn insert_metadata(&self, key: impl Into<String>, value: Value) {
        self.write().metadata.insert(key.into(), value);
    }

    /// Clears the dialed number and metadata so the next session starts clean.
    pub fn reset_details(&self) {
        let mut state = self.write();
        state.dialed_number = None;
        state.metadata.clear();
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.read().session_id.clone()
    }

    pub fn session_id_or_default(&self) -> String {
        self.current_session_id().unwrap_or_else(|| DEFAULT_SESSION_ID.to_string())
    }

    pub fn dialed_number(&self) -> Option<String> {
        self.read().dialed_number.clone()
    }

    pub fn history_source(&self) -> Option<Arc<dyn HistorySource>> {
        self.read().history.clone()
    }

    pub fn metadata(&self) -> Map<String, Value> {
        let state = self.read();
        let mut out = state.metadata.clone();
        if let Some(number) = &state.dialed_number {
            out.insert("dialed_number".into(), Value::String(number.clone()));
        }
        out
    }

    /// Creates `session_<YYYYMMDD>_<HHMMSS>_<8 hex>`, installs it as active and returns it.
    pub fn generate_session_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        let session_id = format!("session_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8]);
        self.set_session_id(session_id.clone());
        session_id
    }
}
