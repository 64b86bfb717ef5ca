use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::counter;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::event::{Role, TranscriptEvent};
use crate::payload::Payload;
use crate::registry::{DEFAULT_SESSION_ID, SessionRegistry};
use crate::router::PersistenceRouter;
use crate::sanitize::sanitize_event;
use crate::session::SessionLedger;
use crate::shutdown::SessionFinalizer;

/// A queued event, tagged with the session that was active when it was enqueued.
#[derive(Debug)]
pub struct Envelope {
    pub session_id: String,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum QueueMessage {
    Event(Envelope),
    /// Finalize this session once everything queued ahead of it is written.
    Finalize(String),
    /// Drain everything ahead of this, then exit.
    Stop,
}

#[derive(Clone)]
enum QueueSender {
    Unbounded(mpsc::UnboundedSender<QueueMessage>),
    Bounded(mpsc::Sender<QueueMessage>),
}

enum QueueReceiver {
    Unbounded(mpsc::UnboundedReceiver<QueueMessage>),
    Bounded(mpsc::Receiver<QueueMessage>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<QueueMessage> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Producer handle. Cheap to clone; every clone feeds the same worker.
#[derive(Clone)]
pub struct EventQueue {
    tx: QueueSender,
    accepting: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
    router: PersistenceRouter,
    ledger: Arc<SessionLedger>,
    finalizer: Option<Arc<SessionFinalizer>>,
}

impl EventQueue {
    /// Creates the queue and spawns its single worker. `capacity = None` means unbounded.
    /// Without a finalizer, rotated sessions stay in the ledger.
    pub fn start(
        capacity: Option<usize>,
        registry: Arc<SessionRegistry>,
        router: PersistenceRouter,
        ledger: Arc<SessionLedger>,
        finalizer: Option<Arc<SessionFinalizer>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = match capacity {
            Some(cap) => {
                let (tx, rx) = mpsc::channel(cap.max(1));
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
        };
        let worker = tokio::spawn(run_worker(rx, router.clone(), ledger.clone(), finalizer.clone()));
        let queue = Self {
            tx,
            accepting: Arc::new(AtomicBool::new(true)),
            registry,
            router,
            ledger,
            finalizer,
        };
        (queue, worker)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<SessionLedger> {
        &self.ledger
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Hands an event to the worker and returns immediately. Never blocks, never fails:
    /// if the queue cannot take it the event is written straight to the file sink.
    pub fn enqueue(&self, payload: impl Into<Payload>) {
        let envelope = Envelope {
            session_id: self.registry.session_id_or_default(),
            payload: payload.into(),
        };
        if !self.is_accepting() {
            self.write_direct(envelope, "queue stopped");
            return;
        }
        let rejected = match &self.tx {
            QueueSender::Unbounded(tx) => tx.send(QueueMessage::Event(envelope)).err().map(|e| (e.0, "queue closed")),
            QueueSender::Bounded(tx) => match tx.try_send(QueueMessage::Event(envelope)) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(msg)) => Some((msg, "queue full")),
                Err(mpsc::error::TrySendError::Closed(msg)) => Some((msg, "queue closed")),
            },
        };
        match rejected {
            None => counter!("transcript_events_enqueued_total").increment(1),
            Some((QueueMessage::Event(envelope), reason)) => self.write_direct(envelope, reason),
            Some(_) => {}
        }
    }

    /// Makes `next` (or a generated id) the active session. The outgoing session keeps the
    /// metadata it had and is finalized after the events queued ahead of the switch.
    pub fn rotate_session(&self, next: Option<String>) -> String {
        let outgoing = self.registry.session_id_or_default();
        if next.as_deref() == Some(outgoing.as_str()) {
            return outgoing;
        }
        if self.finalizer.is_some() {
            self.ledger.pin_metadata(&outgoing, self.registry.metadata());
        }
        self.registry.reset_details();
        let incoming = match next {
            Some(id) => {
                self.registry.set_session_id(id.clone());
                id
            }
            None => self.registry.generate_session_id(),
        };
        self.ledger.reopen(&incoming);
        if self.finalizer.is_some() {
            self.request_finalize(outgoing);
        }
        incoming
    }

    fn request_finalize(&self, session_id: String) {
        if !self.is_accepting() {
            debug!(session_id = %session_id, "queue stopped; session left for shutdown");
            return;
        }
        match &self.tx {
            QueueSender::Unbounded(tx) => {
                if tx.send(QueueMessage::Finalize(session_id)).is_err() {
                    debug!("transcript worker gone; session left for shutdown");
                }
            }
            QueueSender::Bounded(tx) => match tx.try_send(QueueMessage::Finalize(session_id)) {
                Ok(()) => {}
                // events of the outgoing session are already queued ahead of the marker
                Err(mpsc::error::TrySendError::Full(msg)) => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let tx = tx.clone();
                        handle.spawn(async move {
                            let _ = tx.send(msg).await;
                        });
                    }
                    Err(_) => warn!("queue full outside a runtime; session left for shutdown"),
                },
                Err(mpsc::error::TrySendError::Closed(_)) => debug!("transcript worker gone; session left for shutdown"),
            },
        }
    }

    pub fn log_manual(&self, role: Role, content: impl Into<String>) {
        self.enqueue(TranscriptEvent::manual(role, content));
    }

    pub fn log_system(&self, name: impl Into<String>, detail: impl Into<Payload>) {
        self.enqueue(TranscriptEvent::system(name, detail));
    }

    pub fn log_tool_call(&self, name: &str, arguments: impl Into<Payload>, output: impl Into<Payload>) {
        self.enqueue(TranscriptEvent::tool_call(name, arguments, output));
    }

    /// Stops accepting work and queues the stop marker behind everything already queued.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let sent = match &self.tx {
            QueueSender::Unbounded(tx) => tx.send(QueueMessage::Stop).is_ok(),
            QueueSender::Bounded(tx) => tx.send(QueueMessage::Stop).await.is_ok(),
        };
        if !sent {
            debug!("transcript worker already gone");
        }
    }

    fn write_direct(&self, envelope: Envelope, reason: &str) {
        counter!("transcript_events_fallback_total").increment(1);
        warn!(session_id = %envelope.session_id, reason, "writing transcript event directly to file sink");
        let record = to_record(envelope.payload, &envelope.session_id);
        if let Err(e) = self.router.appender().append(&record) {
            error!(session_id = %envelope.session_id, error = %e, "direct file sink write failed; event lost");
        }
        self.ledger.record(&envelope.session_id, record);
    }
}

/// Sanitized line as written to the sinks, carrying its session id.
fn to_record(payload: Payload, session_id: &str) -> Value {
    let mut record = sanitize_event(&payload);
    record.insert("session_id".into(), Value::String(session_id.to_string()));
    Value::Object(record)
}

async fn run_worker(
    mut rx: QueueReceiver,
    router: PersistenceRouter,
    ledger: Arc<SessionLedger>,
    finalizer: Option<Arc<SessionFinalizer>>,
) {
    let mut processed = 0usize;
    while let Some(msg) = rx.recv().await {
        match msg {
            QueueMessage::Event(envelope) => {
                let record = to_record(envelope.payload, &envelope.session_id);
                router.persist(&record, &envelope.session_id).await;
                ledger.record(&envelope.session_id, record);
                processed += 1;
            }
            QueueMessage::Finalize(session_id) => {
                let Some(finalizer) = &finalizer else { continue };
                if session_id == DEFAULT_SESSION_ID && ledger.len(&session_id) == 0 {
                    continue;
                }
                finalizer.finalize_from_ledger(&ledger, &session_id, Map::new()).await;
            }
            QueueMessage::Stop => break,
        }
    }
    debug!(processed, "transcript worker stopped");
}
