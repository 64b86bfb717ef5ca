//! Capture of conversational transcript events.
//!
//! Producers hand events to an [`EventQueue`]; a single worker sanitizes each one and writes it
//! to an optional durable store and, always, to an append-only JSONL file. A [`HistoryWatcher`]
//! diffs an externally mutated history object by polling, and [`TranscriptPipeline::shutdown`]
//! saves a final snapshot and drains the queue within a bounded time.

pub mod error;
pub mod event;
pub mod file_sink;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod router;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod settings;
pub mod shutdown;
pub mod storage;
pub mod watcher;

pub use event::{EventSource, Role, TranscriptEvent};
pub use payload::{Exportable, Payload};
pub use queue::EventQueue;
pub use registry::{DEFAULT_SESSION_ID, SessionRegistry};
pub use session::SessionRecord;
pub use shutdown::{SessionFinalizer, ShutdownReport, TranscriptPipeline};
pub use watcher::{HistorySource, HistoryWatcher, JsonFileHistory};
