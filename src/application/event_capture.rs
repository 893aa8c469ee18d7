//! Event Capture
//!
//! Per-session, append-only logs of document replication events. Reads
//! never consume; a log is cleared only when its session is discarded.

use crate::domain::entities::DocumentReplicationEvent;
use crate::domain::ports::EventSink;
use crate::domain::value_objects::SessionId;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct EventLog {
    events: RwLock<Vec<DocumentReplicationEvent>>,
    capturing: AtomicBool,
}

impl EventLog {
    fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            capturing: AtomicBool::new(true),
        }
    }

    fn append(&self, event: DocumentReplicationEvent) -> bool {
        if !self.capturing.load(Ordering::Acquire) {
            return false;
        }
        self.events.write().push(event);
        true
    }
}

/// Store of event logs, keyed by session.
#[derive(Debug, Default)]
pub struct EventCapture {
    logs: DashMap<SessionId, Arc<EventLog>>,
}

impl EventCapture {
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
        }
    }

    /// Create the log for a session and return a sink writing to it.
    ///
    /// Opening an existing session reuses its log.
    pub fn open(&self, session_id: SessionId) -> Arc<SessionEventSink> {
        let log = self
            .logs
            .entry(session_id)
            .or_insert_with(|| Arc::new(EventLog::new()))
            .clone();
        Arc::new(SessionEventSink { session_id, log })
    }

    /// Append an event. Returns false if the session has no log or its
    /// capture was stopped.
    pub fn record(&self, session_id: SessionId, event: DocumentReplicationEvent) -> bool {
        let log = match self.logs.get(&session_id) {
            Some(log) => log.clone(),
            None => {
                tracing::debug!("dropping event for unknown session {}", session_id);
                return false;
            }
        };
        log.append(event)
    }

    pub fn count(&self, session_id: SessionId) -> usize {
        self.logs
            .get(&session_id)
            .map(|log| log.events.read().len())
            .unwrap_or(0)
    }

    /// Snapshot of a session's events in submission order.
    pub fn drain(&self, session_id: SessionId) -> Vec<DocumentReplicationEvent> {
        self.logs
            .get(&session_id)
            .map(|log| log.events.read().clone())
            .unwrap_or_default()
    }

    /// Ignore further events for a session. Recorded events stay readable.
    pub fn stop_capture(&self, session_id: SessionId) -> bool {
        match self.logs.get(&session_id) {
            Some(log) => {
                log.capturing.store(false, Ordering::Release);
                tracing::debug!("stopped event capture for session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn is_capturing(&self, session_id: SessionId) -> bool {
        self.logs
            .get(&session_id)
            .map(|log| log.capturing.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Drop a session's log.
    pub fn discard(&self, session_id: SessionId) -> bool {
        self.logs.remove(&session_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.logs.len()
    }
}

/// [`EventSink`] handed to the engine for one session.
#[derive(Debug)]
pub struct SessionEventSink {
    session_id: SessionId,
    log: Arc<EventLog>,
}

impl SessionEventSink {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl EventSink for SessionEventSink {
    fn record(&self, event: DocumentReplicationEvent) {
        tracing::debug!("session {} event: {}", self.session_id, event);
        self.log.append(event);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::value_objects::DocumentFlags;

    fn event(id: &str) -> DocumentReplicationEvent {
        DocumentReplicationEvent::new(id, false, DocumentFlags::NONE)
    }

    #[test]
    fn test_record_and_drain_in_order() {
        let capture = EventCapture::new();
        let session = SessionId::new();
        capture.open(session);

        for id in ["doc1", "doc2", "doc3"] {
            assert!(capture.record(session, event(id)));
        }

        assert_eq!(capture.count(session), 3);
        let ids: Vec<_> = capture.drain(session).into_iter().map(|e| e.doc_id).collect();
        assert_eq!(ids, vec!["doc1", "doc2", "doc3"]);
    }

    #[test]
    fn test_drain_is_non_destructive() {
        let capture = EventCapture::new();
        let session = SessionId::new();
        capture.open(session).record(event("doc1"));

        assert_eq!(capture.drain(session).len(), 1);
        assert_eq!(capture.drain(session).len(), 1);
        assert_eq!(capture.count(session), 1);
    }

    #[test]
    fn test_unknown_session() {
        let capture = EventCapture::new();
        let session = SessionId::new();

        assert!(!capture.record(session, event("doc1")));
        assert_eq!(capture.count(session), 0);
        assert!(capture.drain(session).is_empty());
        assert!(!capture.stop_capture(session));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let capture = EventCapture::new();
        let a = capture.open(SessionId::new());
        let b = capture.open(SessionId::new());

        a.record(event("a1"));
        a.record(event("a2"));
        b.record(event("b1"));

        assert_eq!(capture.count(a.session_id()), 2);
        assert_eq!(capture.count(b.session_id()), 1);
        assert_eq!(capture.drain(b.session_id())[0].doc_id, "b1");
    }

    #[test]
    fn test_stop_capture_keeps_existing_events() {
        let capture = EventCapture::new();
        let sink = capture.open(SessionId::new());
        let session = sink.session_id();

        sink.record(event("doc1"));
        assert!(capture.stop_capture(session));
        assert!(!capture.is_capturing(session));

        sink.record(event("doc2"));
        assert!(!capture.record(session, event("doc3")));
        assert_eq!(capture.count(session), 1);
    }

    #[test]
    fn test_reopen_reuses_log() {
        let capture = EventCapture::new();
        let session = SessionId::new();
        capture.open(session).record(event("doc1"));
        capture.open(session).record(event("doc2"));

        assert_eq!(capture.count(session), 2);
        assert_eq!(capture.session_count(), 1);
    }

    #[test]
    fn test_discard_drops_log() {
        let capture = EventCapture::new();
        let session = SessionId::new();
        capture.open(session).record(event("doc1"));

        assert!(capture.discard(session));
        assert_eq!(capture.count(session), 0);
        assert!(!capture.discard(session));
    }

    #[test]
    fn test_concurrent_recording() {
        let capture = Arc::new(EventCapture::new());
        let session = SessionId::new();
        capture.open(session);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let capture = capture.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        capture.record(session, event(&format!("t{}-{}", t, i)));
                        let _ = capture.count(session);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(capture.count(session), 400);
    }
}
