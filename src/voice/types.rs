use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single voice gateway frame.
#[derive(Serialize, Deserialize, Debug)]
pub struct VoiceGatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

impl VoiceGatewayMessage {
    pub fn new(op: u8, d: Value) -> Self {
        Self { op, d }
    }
}

/// Outcome of a single voice WS session.
pub enum VoiceOutcome {
    /// Disconnect worth an op 7 Resume on the same session.
    Resume,
    /// Close 4006: the voice session id is dead server-side. Never resumed;
    /// the whole session must be rebuilt from a fresh `join()`.
    Rejoin,
    /// Caller-initiated shutdown.
    Exit,
    /// Authentication failure or forced removal from the channel.
    Fatal(String),
}

/// Voice close-code policy.
///
/// `4006` (session no longer valid) must never be resumed: the session id it
/// refers to is gone, and any op 7 would just earn another 4006.
pub fn is_session_invalid_close(code: u16) -> bool {
    code == 4006
}

/// - `4004`: authentication failed
/// - `4014`: disconnected (kicked, channel deleted)
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4014)
}

/// Everything else, notably `4009` (timeout) and `4015` (server crashed),
/// gets one op 7 Resume; if that attempt fails, the outer loop falls back to
/// a full reconnect with a fresh voice Identify.
pub fn classify_voice_close(code: u16, reason: &str) -> VoiceOutcome {
    if is_session_invalid_close(code) {
        VoiceOutcome::Rejoin
    } else if is_fatal_close(code) {
        VoiceOutcome::Fatal(format!("voice close {code}: {reason}"))
    } else {
        VoiceOutcome::Resume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_invalid_close_forces_rejoin_never_resume() {
        assert!(matches!(classify_voice_close(4006, ""), VoiceOutcome::Rejoin));
        assert!(!is_fatal_close(4006));
    }

    #[test]
    fn auth_and_kick_are_fatal() {
        assert!(matches!(
            classify_voice_close(4004, "auth failed"),
            VoiceOutcome::Fatal(_)
        ));
        assert!(matches!(
            classify_voice_close(4014, "disconnected"),
            VoiceOutcome::Fatal(_)
        ));
    }

    #[test]
    fn other_closes_try_resume_first() {
        for code in [1000u16, 1006, 4009, 4015] {
            assert!(matches!(classify_voice_close(code, ""), VoiceOutcome::Resume));
        }
    }
}
