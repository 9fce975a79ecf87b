//! Task session table.
//!
//! Tracks in-flight work keyed by session id, on both sides of an exchange:
//! outbound sessions are ones this node submitted and is waiting on; inbound
//! sessions are requests this node is executing for a peer. Each outbound
//! session owns a oneshot sender, so a waiting caller wakes the moment its
//! response is matched.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::generate_session_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Submitted,
    Processing,
    Completed,
    TimedOut,
}

impl SessionStatus {
    pub fn is_final(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Submitted => "submitted",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::TimedOut => "timed out",
        }
    }
}

/// What the session correlates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Task,
    CapabilityQuery,
}

/// Which side of the exchange this node is on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// We submitted it to `assigned_agent_id`.
    Outbound,
    /// `requester` submitted it to us.
    Inbound { requester: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSession {
    pub session_id: String,
    pub kind: SessionKind,
    pub origin: SessionOrigin,
    pub description: String,
    pub assigned_agent_id: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub status: SessionStatus,
    pub result: Option<String>,
}

/// Result of matching a response to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// First response; the waiting caller has been woken.
    Delivered,
    /// Session already completed; nothing changed.
    Duplicate,
    /// Session had already timed out; response discarded.
    Late,
    /// No such session (never existed, consumed or collected).
    Unknown,
    /// The session exists but is not one we are waiting on.
    NotAwaited,
    /// Sent by an agent other than the one the session was assigned to, or
    /// answering a different kind of session.
    Misdirected,
}

/// Result of registering an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAccept {
    Accepted,
    /// Same session id seen before; re-delivery is a no-op.
    Duplicate,
    Full,
}

/// Receiving end of an outbound session's completion signal.
pub type CompletionReceiver = oneshot::Receiver<String>;

struct Entry {
    session: TaskSession,
    waiter: Option<oneshot::Sender<String>>,
}

/// Mutex-guarded session table with a bound on non-final sessions.
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Entry>>,
    capacity: usize,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Open an outbound session addressed to `agent_id`.
    pub fn open(
        &self,
        kind: SessionKind,
        description: &str,
        agent_id: &str,
        now: i64,
    ) -> Result<(String, CompletionReceiver)> {
        let mut sessions = self.sessions.lock();
        if active(&sessions) >= self.capacity {
            return Err(Error::TaskTableFull {
                capacity: self.capacity,
            });
        }

        let mut session_id = generate_session_id();
        while sessions.contains_key(&session_id) {
            session_id = generate_session_id();
        }

        let (tx, rx) = oneshot::channel();
        sessions.insert(
            session_id.clone(),
            Entry {
                session: TaskSession {
                    session_id: session_id.clone(),
                    kind,
                    origin: SessionOrigin::Outbound,
                    description: description.to_string(),
                    assigned_agent_id: agent_id.to_string(),
                    created_at: now,
                    completed_at: None,
                    status: SessionStatus::Submitted,
                    result: None,
                },
                waiter: Some(tx),
            },
        );
        Ok((session_id, rx))
    }

    /// Register a request a peer sent us, keyed by its session id.
    pub fn accept_inbound(
        &self,
        session_id: &str,
        requester: &str,
        local_agent_id: &str,
        description: &str,
        now: i64,
    ) -> InboundAccept {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(session_id) {
            return InboundAccept::Duplicate;
        }
        if active(&sessions) >= self.capacity {
            return InboundAccept::Full;
        }
        sessions.insert(
            session_id.to_string(),
            Entry {
                session: TaskSession {
                    session_id: session_id.to_string(),
                    kind: SessionKind::Task,
                    origin: SessionOrigin::Inbound {
                        requester: requester.to_string(),
                    },
                    description: description.to_string(),
                    assigned_agent_id: local_agent_id.to_string(),
                    created_at: now,
                    completed_at: None,
                    status: SessionStatus::Processing,
                    result: None,
                },
                waiter: None,
            },
        );
        InboundAccept::Accepted
    }

    /// Record the result of an inbound request once execution finishes.
    pub fn finish_inbound(&self, session_id: &str, result: &str, now: i64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(session_id) {
            Some(entry) if entry.session.status == SessionStatus::Processing => {
                entry.session.status = SessionStatus::Completed;
                entry.session.result = Some(result.to_string());
                entry.session.completed_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Match a response from `responder` to an outbound session and wake its
    /// caller.
    pub fn complete(
        &self,
        session_id: &str,
        kind: SessionKind,
        responder: &str,
        payload: &str,
        now: i64,
    ) -> Completion {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(session_id) else {
            return Completion::Unknown;
        };
        if entry.session.origin != SessionOrigin::Outbound {
            return Completion::NotAwaited;
        }
        if entry.session.kind != kind || entry.session.assigned_agent_id != responder {
            return Completion::Misdirected;
        }
        match entry.session.status {
            SessionStatus::Completed => Completion::Duplicate,
            SessionStatus::TimedOut => Completion::Late,
            SessionStatus::Submitted | SessionStatus::Processing => {
                entry.session.status = SessionStatus::Completed;
                entry.session.result = Some(payload.to_string());
                entry.session.completed_at = Some(now);
                if let Some(waiter) = entry.waiter.take() {
                    // The caller may have given up already; the result stays
                    // in the table until collected.
                    let _ = waiter.send(payload.to_string());
                }
                Completion::Delivered
            }
        }
    }

    /// Called by a waiter whose deadline passed.
    ///
    /// If the response won the race, the session is consumed and its result
    /// returned. Otherwise the session becomes TimedOut and `None` is returned.
    pub fn expire(&self, session_id: &str, now: i64) -> Option<String> {
        let mut sessions = self.sessions.lock();
        let status = sessions.get(session_id)?.session.status;
        match status {
            SessionStatus::Completed => sessions
                .remove(session_id)
                .and_then(|entry| entry.session.result),
            SessionStatus::Submitted | SessionStatus::Processing => {
                if let Some(entry) = sessions.get_mut(session_id) {
                    entry.session.status = SessionStatus::TimedOut;
                    entry.session.completed_at = Some(now);
                    entry.waiter = None;
                }
                None
            }
            SessionStatus::TimedOut => None,
        }
    }

    /// Remove a session whose result the caller has taken.
    pub fn consume(&self, session_id: &str) -> Option<TaskSession> {
        self.sessions
            .lock()
            .remove(session_id)
            .map(|entry| entry.session)
    }

    /// Drop sessions created more than `retention` ago. Inbound sessions still
    /// executing are kept so duplicate requests stay no-ops.
    pub fn purge(&self, now: i64, retention: Duration) -> usize {
        let cutoff = now - retention.as_millis() as i64;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| {
            entry.session.created_at >= cutoff
                || entry.session.status == SessionStatus::Processing
        });
        before - sessions.len()
    }

    pub fn get(&self, session_id: &str) -> Option<TaskSession> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    /// Copy of every session, oldest first.
    pub fn snapshot(&self) -> Vec<TaskSession> {
        let mut sessions: Vec<TaskSession> = self
            .sessions
            .lock()
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// Non-final sessions, in both directions.
    pub fn active_count(&self) -> usize {
        active(&self.sessions.lock())
    }

    /// Inbound requests still executing; reported to peers as queue depth.
    pub fn processing_count(&self) -> u32 {
        self.sessions
            .lock()
            .values()
            .filter(|entry| entry.session.status == SessionStatus::Processing)
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn active(sessions: &HashMap<String, Entry>) -> usize {
    sessions
        .values()
        .filter(|entry| !entry.session.status.is_final())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let table = SessionTable::new(10);
        let (id, rx) = table.open(SessionKind::Task, "explain X", "a1", 100).unwrap();
        assert_eq!(table.get(&id).unwrap().status, SessionStatus::Submitted);

        assert_eq!(
            table.complete(&id, SessionKind::Task, "a1", "answer", 150),
            Completion::Delivered
        );
        assert_eq!(rx.await.unwrap(), "answer");

        let session = table.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.completed_at, Some(150));
        assert_eq!(session.assigned_agent_id, "a1");
    }

    #[test]
    fn test_duplicate_response_is_noop() {
        let table = SessionTable::new(10);
        let (id, _rx) = table.open(SessionKind::Task, "t", "a1", 0).unwrap();
        assert_eq!(
            table.complete(&id, SessionKind::Task, "a1", "first", 1),
            Completion::Delivered
        );
        let after_first = table.get(&id).unwrap();

        assert_eq!(
            table.complete(&id, SessionKind::Task, "a1", "second", 2),
            Completion::Duplicate
        );
        assert_eq!(table.get(&id).unwrap(), after_first);
    }

    #[test]
    fn test_misdirected_response() {
        let table = SessionTable::new(10);
        let (id, _rx) = table.open(SessionKind::Task, "t", "a1", 0).unwrap();
        assert_eq!(
            table.complete(&id, SessionKind::Task, "a2", "spoofed", 1),
            Completion::Misdirected
        );
        assert_eq!(
            table.complete(&id, SessionKind::CapabilityQuery, "a1", "{}", 1),
            Completion::Misdirected
        );
        assert_eq!(table.get(&id).unwrap().status, SessionStatus::Submitted);
    }

    #[test]
    fn test_late_response_discarded() {
        let table = SessionTable::new(10);
        let (id, _rx) = table.open(SessionKind::Task, "t", "a1", 0).unwrap();
        assert_eq!(table.expire(&id, 30_000), None);
        assert_eq!(table.get(&id).unwrap().status, SessionStatus::TimedOut);

        assert_eq!(
            table.complete(&id, SessionKind::Task, "a1", "too late", 31_000),
            Completion::Late
        );
        assert_eq!(table.get(&id).unwrap().result, None);
        assert_eq!(
            table.complete("nope", SessionKind::Task, "a1", "x", 1),
            Completion::Unknown
        );
    }

    #[test]
    fn test_expire_after_completion_returns_result() {
        let table = SessionTable::new(10);
        let (id, _rx) = table.open(SessionKind::Task, "t", "a1", 0).unwrap();
        table.complete(&id, SessionKind::Task, "a1", "won the race", 10);
        assert_eq!(table.expire(&id, 11), Some("won the race".to_string()));
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn test_capacity_counts_active_only() {
        let table = SessionTable::new(2);
        let (a, _ra) = table.open(SessionKind::Task, "t", "a1", 0).unwrap();
        let (_b, _rb) = table.open(SessionKind::Task, "t", "a1", 0).unwrap();
        assert!(matches!(
            table.open(SessionKind::Task, "t", "a1", 0),
            Err(Error::TaskTableFull { capacity: 2 })
        ));
        assert_eq!(
            table.accept_inbound("remote-1", "a9", "me", "t", 0),
            InboundAccept::Full
        );

        table.expire(&a, 1);
        assert!(table.open(SessionKind::Task, "t", "a1", 2).is_ok());
    }

    #[test]
    fn test_inbound_duplicates() {
        let table = SessionTable::new(10);
        assert_eq!(
            table.accept_inbound("s1", "a2", "me", "do it", 5),
            InboundAccept::Accepted
        );
        assert_eq!(
            table.accept_inbound("s1", "a2", "me", "do it", 6),
            InboundAccept::Duplicate
        );
        assert_eq!(table.processing_count(), 1);

        // A response for an inbound session is not ours to match.
        assert_eq!(
            table.complete("s1", SessionKind::Task, "a1", "x", 7),
            Completion::NotAwaited
        );

        assert!(table.finish_inbound("s1", "done", 8));
        assert!(!table.finish_inbound("s1", "again", 9));
        assert_eq!(table.processing_count(), 0);
        assert_eq!(
            table.accept_inbound("s1", "a2", "me", "do it", 10),
            InboundAccept::Duplicate
        );
    }

    #[test]
    fn test_purge_keeps_running_work() {
        let table = SessionTable::new(10);
        let (old, _rx) = table.open(SessionKind::Task, "t", "a1", 0).unwrap();
        table.expire(&old, 30_000);
        table.accept_inbound("running", "a2", "me", "t", 0);
        let (_fresh, _rx2) = table
            .open(SessionKind::CapabilityQuery, "", "a1", 95_000)
            .unwrap();

        let removed = table.purge(100_000, Duration::from_secs(90));
        assert_eq!(removed, 1);
        assert!(table.get(&old).is_none());
        assert!(table.get("running").is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_consume() {
        let table = SessionTable::new(10);
        let (id, _rx) = table.open(SessionKind::Task, "t", "a1", 0).unwrap();
        table.complete(&id, SessionKind::Task, "a1", "r", 1);
        let session = table.consume(&id).unwrap();
        assert_eq!(session.result.as_deref(), Some("r"));
        assert!(table.is_empty());
        assert_eq!(
            table.complete(&id, SessionKind::Task, "a1", "r", 2),
            Completion::Unknown
        );
    }
}
