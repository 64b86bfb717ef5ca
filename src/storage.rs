use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}, Row};
use uuid::Uuid;

use crate::session::SessionRecord;

/// Queryable event store. Best-effort from the pipeline's point of view: every error is
/// logged by the caller and the file sink still gets the record.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn log_event(&self, event: &Value, session_id: &str) -> anyhow::Result<()>;
    async fn create_session(&self, session: &SessionRecord) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct SqliteTranscriptStore {
    pool: Pool<Sqlite>,
}

impl SqliteTranscriptStore {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }

    /// Stored events for a session in insertion order.
    pub async fn events_for_session(&self, session_id: &str) -> anyhow::Result<Vec<Value>> {
        let rows = sqlx::query("SELECT event_json FROM transcript_events WHERE session_id = ?1 ORDER BY rowid ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        let mut events = Vec::with_capacity(rows.len());
        for r in rows {
            let json: String = r.get("event_json");
            events.push(serde_json::from_str(&json)?);
        }
        Ok(events)
    }

    /// Most recent finalized document for a session.
    pub async fn get_session_document(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT document_json FROM transcript_sessions WHERE session_id = ?1 ORDER BY rowid DESC LIMIT 1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let json: String = r.get("document_json");
        Ok(Some(serde_json::from_str(&json)?))
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("transcript_keeper");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("transcripts.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn str_field(event: &Value, key: &str) -> Option<String> {
    event.get(key).and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl DurableStore for SqliteTranscriptStore {
    async fn log_event(&self, event: &Value, session_id: &str) -> anyhow::Result<()> {
        let now: DateTime<Utc> = Utc::now();
        sqlx::query("INSERT INTO transcript_events (id, session_id, role, source, item_type, content, event_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)")
            .bind(Uuid::new_v4().to_string())
            .bind(session_id)
            .bind(str_field(event, "role"))
            .bind(str_field(event, "source"))
            .bind(str_field(event, "item_type"))
            .bind(str_field(event, "content"))
            .bind(serde_json::to_string(event)?)
            .bind(now.to_rfc3339())
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn create_session(&self, session: &SessionRecord) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO transcript_sessions (id, session_id, start_time, end_time, total_items, duration_seconds, metadata_json, document_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)")
            .bind(&id)
            .bind(&session.session_id)
            .bind(session.start_time.map(|t| t.to_rfc3339()))
            .bind(session.end_time.map(|t| t.to_rfc3339()))
            .bind(session.total_items as i64)
            .bind(session.duration_seconds)
            .bind(serde_json::to_string(&session.metadata)?)
            .bind(serde_json::to_string(session)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool).await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteTranscriptStore {
        let path = dir.path().join("test.db");
        let url = format!("sqlite://{}", path.to_string_lossy());
        SqliteTranscriptStore::initialize(Some(url)).await.unwrap()
    }

    #[tokio::test]
    async fn log_event_and_read_back_in_order() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        for i in 0..5 {
            let ev = json!({"role": "user", "content": format!("m{}", i), "source": "manual", "item_type": null});
            store.log_event(&ev, "s1").await.unwrap();
        }
        store.log_event(&json!({"value": "other"}), "s2").await.unwrap();

        let got = store.events_for_session("s1").await.unwrap();
        let contents: Vec<&str> = got.iter().map(|e| e["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(store.events_for_session("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_session_stores_full_document() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let items = vec![json!({"content": "hi", "timestamp": "2024-01-01T00:00:00+00:00"})];
        let mut meta = Map::new();
        meta.insert("dialed_number".into(), json!("+1"));
        let rec = SessionRecord::assemble("s1", items, meta);
        let id = store.create_session(&rec).await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());

        let got = store.get_session_document("s1").await.unwrap().unwrap();
        assert_eq!(got, rec);
        assert!(store.get_session_document("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pragmas_and_migrations_applied() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let row = sqlx::query("PRAGMA journal_mode;").fetch_one(store.pool()).await.unwrap();
        let mode: String = row.get(0);
        assert!(mode.eq_ignore_ascii_case("wal"), "journal_mode should be WAL, got {}", mode);

        let row = sqlx::query("PRAGMA busy_timeout;").fetch_one(store.pool()).await.unwrap();
        let timeout: i64 = row.get(0);
        assert!(timeout >= 5000, "busy_timeout should be at least 5000, got {}", timeout);

        // re-running migrations on the same file is a no-op
        let _again = open_store(&dir).await;
    }
}
