use axum::{routing::{get, post}, Json, Router};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;

use crate::event::{Role, TranscriptEvent};
use crate::queue::EventQueue;

#[derive(Clone)]
pub struct AppState {
    pub queue: EventQueue,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionBody {
    pub dialed_number: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
}

async fn start_session(
    axum::extract::State(state): axum::extract::State<AppState>,
    body: Option<Json<StartSessionBody>>,
) -> Json<StartSessionResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session_id = state.queue.rotate_session(None);
    let registry = state.queue.registry();
    if let Some(number) = body.dialed_number {
        registry.set_dialed_number(number);
    }
    for (k, v) in body.metadata.unwrap_or_default() {
        registry.insert_metadata(k, v);
    }
    state.queue.log_system("session_started", Value::Object(registry.metadata()));
    Json(StartSessionResponse { session_id })
}

#[derive(Debug, Serialize)]
pub struct CurrentSessionResponse {
    pub session_id: Option<String>,
    pub dialed_number: Option<String>,
}

async fn current_session(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<CurrentSessionResponse> {
    let registry = state.queue.registry();
    Json(CurrentSessionResponse {
        session_id: registry.current_session_id(),
        dialed_number: registry.dialed_number(),
    })
}

/// Objects with a `content` field become manual transcript events; anything else is queued raw.
fn ingest_body(body: Value) -> crate::payload::Payload {
    let content = body.get("content").and_then(Value::as_str).map(str::to_string);
    match content {
        Some(content) => {
            let role = body.get("role").and_then(Value::as_str).map(Role::parse).unwrap_or(Role::Unknown);
            let item_type = body.get("item_type").and_then(Value::as_str).unwrap_or("message").to_string();
            TranscriptEvent::manual(role, content)
                .with_item_type(item_type)
                .with_raw(body)
                .into()
        }
        None => body.into(),
    }
}

async fn post_event(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.queue.enqueue(ingest_body(body));
    StatusCode::ACCEPTED
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(start_session))
        .route("/v1/sessions/current", get(current_session))
        .route("/v1/events", post(post_event))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "transcript ingestion listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::router::PersistenceRouter;
    use crate::router::testing::MemoryAppender;
    use crate::session::SessionLedger;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn sessions_and_events_over_http() {
        let file = Arc::new(MemoryAppender::default());
        let (queue, worker) = EventQueue::start(
            None,
            Arc::new(SessionRegistry::new()),
            PersistenceRouter::new(None, file.clone()),
            Arc::new(SessionLedger::new()),
            None,
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(AppState { queue: queue.clone() });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let base = format!("http://{}", addr);
        let started: serde_json::Value = client
            .post(format!("{}/v1/sessions", base))
            .json(&json!({"dialed_number": "+15550100", "metadata": {"campaign": "demo"}}))
            .send().await.unwrap()
            .json().await.unwrap();
        let session_id = started["session_id"].as_str().unwrap().to_string();
        assert!(session_id.starts_with("session_"));

        let current: serde_json::Value = client
            .get(format!("{}/v1/sessions/current", base))
            .send().await.unwrap()
            .json().await.unwrap();
        assert_eq!(current["session_id"], session_id.as_str());
        assert_eq!(current["dialed_number"], "+15550100");

        let status = client
            .post(format!("{}/v1/events", base))
            .json(&json!({"role": "assistant", "content": "नमस्ते"}))
            .send().await.unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::ACCEPTED);
        client.post(format!("{}/v1/events", base)).json(&json!([1, 2])).send().await.unwrap();

        queue.stop().await;
        worker.await.unwrap();
        let lines = file.lines.lock().unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["content"], "session_started");
        assert_eq!(lines[0]["raw"]["campaign"], "demo");
        assert_eq!(lines[1]["role"], "agent");
        assert_eq!(lines[1]["content"], "नमस्ते");
        assert_eq!(lines[1]["source"], "manual");
        assert_eq!(lines[1]["session_id"], session_id.as_str());
        assert_eq!(lines[2]["value"], json!([1, 2]));
    }
}
