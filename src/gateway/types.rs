use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single gateway frame. Inbound frames carry the sequence number `s` and
/// the dispatch event name `t` alongside the opcode; outbound frames omit
/// both.
#[derive(Serialize, Deserialize, Debug)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }
}

/// Outcome of a single WS session, telling the outer loop what to do next.
pub enum SessionOutcome {
    /// Resumable disconnect: keep the session and send op 6 on reconnect.
    Resume,
    /// Session invalid: clear it and start over with a fresh op 2 Identify.
    Identify,
    /// Caller-initiated shutdown, exit cleanly.
    Exit,
    /// Fatal close (bad token, bad shard, bad intents): stop retrying and
    /// surface the reason once.
    Fatal(String),
}

/// Close-code policy table for the control gateway.
///
/// Every close code falls into exactly one bucket; codes not listed anywhere
/// (1000, 1001, the library-local 1006, future codes) default to Resume,
/// which the server downgrades to a fresh session by itself if the resume is
/// rejected.
///
/// - `4000` unknown error, `4001` unknown opcode, `4002` decode error,
///   `4005` already authenticated, `4008` rate limited: the session itself
///   is still valid server-side.
pub fn is_resumable_close(code: u16) -> bool {
    matches!(code, 4000 | 4001 | 4002 | 4005 | 4008)
}

/// - `4003` not authenticated, `4007` invalid sequence, `4009` session timed
///   out: the saved session id / sequence are worthless, identify fresh.
pub fn is_reidentify_close(code: u16) -> bool {
    matches!(code, 4003 | 4007 | 4009)
}

/// - `4004` authentication failed, `4010`/`4011` shard problems,
///   `4012` invalid API version, `4013`/`4014` intents problems: retrying
///   would loop forever with the same credentials, so surface the error.
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010 | 4011 | 4012 | 4013 | 4014)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_buckets_are_disjoint() {
        for code in 4000u16..=4020 {
            let buckets = [
                is_resumable_close(code),
                is_reidentify_close(code),
                is_fatal_close(code),
            ];
            assert!(
                buckets.iter().filter(|b| **b).count() <= 1,
                "code {code} classified into more than one bucket"
            );
        }
    }

    #[test]
    fn auth_failure_is_fatal_not_retried() {
        assert!(is_fatal_close(4004));
        assert!(!is_resumable_close(4004));
        assert!(!is_reidentify_close(4004));
    }

    #[test]
    fn session_timeout_reidentifies() {
        assert!(is_reidentify_close(4009));
        assert!(is_reidentify_close(4007));
    }

    #[test]
    fn unknown_codes_default_to_resume() {
        // Not in any bucket; the connect loop treats that as Resume.
        for code in [1000u16, 1001, 1006, 4999] {
            assert!(!is_reidentify_close(code) && !is_fatal_close(code));
        }
    }
}
