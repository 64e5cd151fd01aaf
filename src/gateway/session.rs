use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::common::{SessionId, UserId};

/// Per-connection identity, shared between the receive loop, the heartbeat
/// task and voice joins.
///
/// `sequence` is only ever written by the receive loop (single writer), but
/// the heartbeat task reads it concurrently, hence the atomic. `-1` encodes
/// "no sequence observed yet".
pub struct Session {
    session_id: Mutex<Option<SessionId>>,
    resume_url: Mutex<Option<String>>,
    user_id: Mutex<Option<UserId>>,
    sequence: AtomicI64,
    shard: (u32, u32),
    /// Set by op 11, cleared by the heartbeat task before each beat. A beat
    /// finding it still cleared means the previous one was never acked and
    /// the connection is zombied.
    pub(crate) last_ack: AtomicBool,
    /// Set once READY/RESUMED arrives; the outer loop consumes it to reset
    /// the reconnect backoff.
    established: AtomicBool,
}

impl Session {
    pub fn new(shard: (u32, u32)) -> Self {
        Self {
            session_id: Mutex::new(None),
            resume_url: Mutex::new(None),
            user_id: Mutex::new(None),
            sequence: AtomicI64::new(-1),
            shard,
            last_ack: AtomicBool::new(true),
            established: AtomicBool::new(false),
        }
    }

    /// Folds an inbound sequence number in. Monotonic non-decreasing: the
    /// stored value only moves up, so replays and reordered equal values are
    /// no-ops.
    pub fn observe_sequence(&self, seq: i64) {
        self.sequence.fetch_max(seq, Ordering::AcqRel);
    }

    pub fn sequence(&self) -> Option<i64> {
        match self.sequence.load(Ordering::Acquire) {
            s if s < 0 => None,
            s => Some(s),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.lock().clone()
    }

    pub fn resume_url(&self) -> Option<String> {
        self.resume_url.lock().clone()
    }

    pub fn shard(&self) -> (u32, u32) {
        self.shard
    }

    /// Resume is only possible with both a session id and a sequence saved.
    pub fn can_resume(&self) -> bool {
        self.session_id.lock().is_some() && self.sequence().is_some()
    }

    /// Captures identity from the READY dispatch payload.
    pub fn note_ready(&self, d: &Value) {
        if let Some(id) = d["session_id"].as_str() {
            *self.session_id.lock() = Some(SessionId(id.to_string()));
        }
        if let Some(url) = d["resume_gateway_url"].as_str() {
            *self.resume_url.lock() = Some(url.to_string());
        }
        if let Some(id) = d["user"]["id"].as_str() {
            *self.user_id.lock() = Some(UserId(id.to_string()));
        }
        self.established.store(true, Ordering::Release);
    }

    pub fn note_resumed(&self) {
        self.established.store(true, Ordering::Release);
    }

    pub fn take_established(&self) -> bool {
        self.established.swap(false, Ordering::AcqRel)
    }

    /// Drops everything a Resume would need; the next connect identifies
    /// fresh.
    pub fn invalidate(&self) {
        *self.session_id.lock() = None;
        *self.resume_url.lock() = None;
        self.sequence.store(-1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_is_max_of_observed() {
        let session = Session::new((0, 1));
        for seq in [3i64, 1, 7, 7, 2] {
            session.observe_sequence(seq);
        }
        assert_eq!(session.sequence(), Some(7));
    }

    #[test]
    fn sequence_idempotent_under_reordering() {
        let a = Session::new((0, 1));
        let b = Session::new((0, 1));
        a.observe_sequence(5);
        a.observe_sequence(5);
        b.observe_sequence(5);
        assert_eq!(a.sequence(), b.sequence());
    }

    #[test]
    fn resume_requires_both_session_id_and_sequence() {
        let session = Session::new((0, 1));
        assert!(!session.can_resume());

        session.observe_sequence(12);
        assert!(!session.can_resume());

        session.note_ready(&json!({
            "session_id": "abc123",
            "resume_gateway_url": "wss://gateway-resume.example",
            "user": { "id": "999" }
        }));
        assert!(session.can_resume());
        assert_eq!(session.user_id().unwrap().0, "999");
        assert_eq!(
            session.resume_url().as_deref(),
            Some("wss://gateway-resume.example")
        );
    }

    #[test]
    fn invalidate_clears_resume_state() {
        let session = Session::new((2, 4));
        session.observe_sequence(42);
        session.note_ready(&json!({ "session_id": "abc", "user": { "id": "1" } }));
        session.invalidate();
        assert!(!session.can_resume());
        assert_eq!(session.sequence(), None);
        assert_eq!(session.shard(), (2, 4));
    }
}
