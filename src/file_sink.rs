use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::error::SinkError;

/// Append-only record sink. Every call writes one self-contained line.
pub trait FileAppender: Send + Sync {
    fn append(&self, record: &Value) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct JsonlAppender {
    path: PathBuf,
}

impl JsonlAppender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FileAppender for JsonlAppender {
    fn append(&self, record: &Value) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SinkError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SinkError::io(&self.path, e))?;
        // single write so a crash can only truncate the last line
        file.write_all(line.as_bytes()).map_err(|e| SinkError::io(&self.path, e))?;
        Ok(())
    }
}

/// Reads back every record for `session_id` from a JSONL log, in file order.
/// Lines that do not parse are skipped.
pub fn read_session_log(path: &Path, session_id: &str) -> Result<Vec<Value>, SinkError> {
    let file = File::open(path).map_err(|e| SinkError::io(path, e))?;
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| SinkError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed transcript line");
                continue;
            }
        };
        if record.get("session_id").and_then(Value::as_str) == Some(session_id) {
            out.push(record);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn appends_one_line_per_record_and_creates_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("t.jsonl");
        let sink = JsonlAppender::new(&path);
        sink.append(&json!({"content": "a", "session_id": "s"})).unwrap();
        sink.append(&json!({"content": "b\nwith newline", "session_id": "s"})).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn replaying_a_record_does_not_corrupt_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let sink = JsonlAppender::new(&path);
        let rec = json!({"content": "same", "session_id": "s"});
        sink.append(&rec).unwrap();
        sink.append(&rec).unwrap();
        let got = read_session_log(&path, "s").unwrap();
        assert_eq!(got, vec![rec.clone(), rec]);
    }

    #[test]
    fn read_back_filters_by_session_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let sink = JsonlAppender::new(&path);
        sink.append(&json!({"content": "1", "session_id": "a"})).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"truncated\": \n").unwrap();
        sink.append(&json!({"content": "2", "session_id": "b"})).unwrap();
        sink.append(&json!({"content": "3", "session_id": "a"})).unwrap();
        let got = read_session_log(&path, "a").unwrap();
        let contents: Vec<&str> = got.iter().map(|r| r["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["1", "3"]);
    }

    #[test]
    fn unwritable_path_reports_io_error() {
        let dir = tempdir().unwrap();
        // a directory where the file should be
        let sink = JsonlAppender::new(dir.path());
        let err = sink.append(&json!({})).unwrap_err();
        assert!(matches!(err, SinkError::Io { .. }));
    }
}
