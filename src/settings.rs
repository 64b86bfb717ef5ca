use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_PATH: &str = "conversations/transcripts.jsonl";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2000;

/// One configuration layer. Every field is optional; higher layers win field by field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CaptureSettings {
    pub durable_store_enabled: Option<bool>,
    pub database_url: Option<String>,
    pub log_path: Option<String>,
    pub artifact_dir: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
}

impl CaptureSettings {
    /// Reads a JSON settings file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Reads the `TRANSCRIPT_*` variables through `lookup`. Unparsable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_bool = |v: String| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        };
        Self {
            durable_store_enabled: lookup("TRANSCRIPT_DURABLE_STORE").and_then(parse_bool),
            database_url: lookup("TRANSCRIPT_DATABASE_URL"),
            log_path: lookup("TRANSCRIPT_LOG_PATH"),
            artifact_dir: lookup("TRANSCRIPT_ARTIFACT_DIR"),
            poll_interval_ms: lookup("TRANSCRIPT_POLL_INTERVAL_MS").and_then(|v| v.trim().parse().ok()),
            drain_timeout_ms: lookup("TRANSCRIPT_DRAIN_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()),
            queue_capacity: lookup("TRANSCRIPT_QUEUE_CAPACITY").and_then(|v| v.trim().parse().ok()),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveConfig {
    pub durable_store_enabled: bool,
    pub database_url: Option<String>,
    pub log_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub queue_capacity: Option<usize>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        let empty = CaptureSettings::default();
        resolve_effective_config(&empty, &empty, &empty)
    }
}

/// Precedence: cli over env over file over built-in defaults.
pub fn resolve_effective_config(
    file: &CaptureSettings,
    env: &CaptureSettings,
    cli: &CaptureSettings,
) -> EffectiveConfig {
    let log_path = PathBuf::from(
        cli.log_path
            .clone()
            .or_else(|| env.log_path.clone())
            .or_else(|| file.log_path.clone())
            .unwrap_or_else(|| DEFAULT_LOG_PATH.into()),
    );

    let artifact_dir = cli
        .artifact_dir
        .clone()
        .or_else(|| env.artifact_dir.clone())
        .or_else(|| file.artifact_dir.clone())
        .map(PathBuf::from)
        .unwrap_or_else(|| match log_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        });

    EffectiveConfig {
        durable_store_enabled: cli
            .durable_store_enabled
            .or(env.durable_store_enabled)
            .or(file.durable_store_enabled)
            .unwrap_or(false),
        database_url: cli
            .database_url
            .clone()
            .or_else(|| env.database_url.clone())
            .or_else(|| file.database_url.clone()),
        log_path,
        artifact_dir,
        poll_interval: Duration::from_millis(
            cli.poll_interval_ms
                .or(env.poll_interval_ms)
                .or(file.poll_interval_ms)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        ),
        drain_timeout: Duration::from_millis(
            cli.drain_timeout_ms
                .or(env.drain_timeout_ms)
                .or(file.drain_timeout_ms)
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
        ),
        queue_capacity: cli
            .queue_capacity
            .or(env.queue_capacity)
            .or(file.queue_capacity)
            .filter(|cap| *cap > 0),
    }
}
