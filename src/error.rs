use std::path::PathBuf;

use thiserror::Error;

/// Failure of one export shape on a producer-supplied object.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export shape not supported")]
    Unsupported,
    #[error("export failed: {0}")]
    Failed(String),
    #[error("export returned malformed json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("export panicked")]
    Panicked,
}

impl ExportError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SinkError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
