use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payload::Payload;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    System,
    Unknown,
}

impl Role {
    /// Maps an upstream role string onto the four roles we record.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Self::User,
            "assistant" | "agent" => Self::Agent,
            "system" | "developer" => Self::System,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    SessionHistory,
    Manual,
    SystemEvent,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionHistory => "session_history",
            Self::Manual => "manual",
            Self::SystemEvent => "system_event",
        }
    }
}

/// One captured conversational occurrence, before sanitization.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub item_type: Option<String>,
    pub raw: Payload,
}

impl TranscriptEvent {
    pub fn new(role: Role, content: impl Into<String>, source: EventSource) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            source,
            item_type: None,
            raw: Payload::Null,
        }
    }

    pub fn manual(role: Role, content: impl Into<String>) -> Self {
        Self::new(role, content, EventSource::Manual).with_item_type("message")
    }

    /// A lifecycle marker such as `session_started` or `shutdown_save_failed`.
    pub fn system(name: impl Into<String>, detail: impl Into<Payload>) -> Self {
        let mut ev = Self::new(Role::System, name, EventSource::SystemEvent);
        ev.raw = detail.into();
        ev.item_type = Some("system_event".into());
        ev
    }

    pub fn tool_call(name: &str, arguments: impl Into<Payload>, output: impl Into<Payload>) -> Self {
        let mut ev = Self::new(Role::Agent, format!("tool:{}", name), EventSource::Manual);
        ev.item_type = Some("tool_call".into());
        ev.raw = Payload::map([
            ("name", Payload::from(name)),
            ("arguments", arguments.into()),
            ("output", output.into()),
        ]);
        ev
    }

    pub fn with_item_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = Some(item_type.into());
        self
    }

    pub fn with_raw(mut self, raw: impl Into<Payload>) -> Self {
        self.raw = raw.into();
        self
    }
}

impl From<TranscriptEvent> for Payload {
    fn from(ev: TranscriptEvent) -> Self {
        Payload::map([
            ("role", Payload::from(ev.role.as_str())),
            ("content", Payload::Text(ev.content)),
            ("timestamp", Payload::Time(ev.timestamp)),
            ("source", Payload::from(ev.source.as_str())),
            ("item_type", Payload::from(ev.item_type)),
            ("raw", ev.raw),
        ])
    }
}

/// Joins content fragments the way upstream chat items carry them: plain strings, or
/// objects with a `text`/`transcript` field. Other fragments are dropped.
pub fn join_content(content: &serde_json::Value) -> String {
    use serde_json::Value;
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj
                    .get("text")
                    .or_else(|| obj.get("transcript"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::sanitize_event;
    use serde_json::json;

    #[test]
    fn role_parsing_maps_upstream_names() {
        assert_eq!(Role::parse("assistant"), Role::Agent);
        assert_eq!(Role::parse(" USER "), Role::User);
        assert_eq!(Role::parse("developer"), Role::System);
        assert_eq!(Role::parse("narrator"), Role::Unknown);
    }

    #[test]
    fn event_sanitizes_to_line_shape() {
        let ev = TranscriptEvent::manual(Role::User, "hello").with_raw(json!({"lang": "hi"}));
        let rec = sanitize_event(&ev.into());
        assert_eq!(rec["role"], "user");
        assert_eq!(rec["content"], "hello");
        assert_eq!(rec["source"], "manual");
        assert_eq!(rec["item_type"], "message");
        assert_eq!(rec["raw"], json!({"lang": "hi"}));
        assert!(chrono::DateTime::parse_from_rfc3339(rec["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn system_event_carries_marker_name() {
        let rec = sanitize_event(&TranscriptEvent::system("session_started", json!({"n": 1})).into());
        assert_eq!(rec["role"], "system");
        assert_eq!(rec["source"], "system_event");
        assert_eq!(rec["content"], "session_started");
    }

    #[test]
    fn tool_call_keeps_arguments_and_output() {
        let rec = sanitize_event(&TranscriptEvent::tool_call("get_weather", json!({"city": "Pune"}), "Pune: 31C").into());
        assert_eq!(rec["item_type"], "tool_call");
        assert_eq!(rec["raw"]["arguments"]["city"], "Pune");
        assert_eq!(rec["raw"]["output"], "Pune: 31C");
    }

    #[test]
    fn content_fragments_are_joined() {
        assert_eq!(join_content(&json!(["a", {"text": "b"}, {"image": "x"}, "c"])), "a\nb\nc");
        assert_eq!(join_content(&json!(null)), "");
        assert_eq!(join_content(&json!("plain")), "plain");
    }
}
