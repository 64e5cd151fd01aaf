use std::time::Duration;

/// Crate-wide error taxonomy.
///
/// Connection loops retry `Transport` and `Protocol` internally and never
/// surface them to the embedding application; `Auth` is terminal and is
/// reported exactly once. `VoiceSessionInvalid` means the voice session must
/// be discarded and rebuilt from a fresh `join()`; resuming it is forbidden.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Dropped connection, failed read/write, DNS failure. Retried via backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame or unexpected opcode. Logged and treated as transient.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bad token or a fatal close code. Never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// HTTP 429 or the voice-equivalent; retry the same operation afterwards.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    /// Voice close code 4006: the session id is dead on the remote end.
    #[error("voice session no longer valid, a fresh join is required")]
    VoiceSessionInvalid,

    /// A pending wait hit its deadline before a matching event arrived.
    #[error("timed out waiting for {0}")]
    WaitTimeout(String),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    /// Seal/open failure on a voice packet.
    #[error("voice packet crypto failure")]
    Crypto,
}

pub type Result<T> = std::result::Result<T, ClientError>;
