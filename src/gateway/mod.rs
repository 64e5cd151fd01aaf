use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod constants;
pub mod handler;
pub mod heartbeat;
pub mod inflate;
pub mod intents;
pub mod session;
pub mod types;
pub mod wait;

pub use intents::Intents;
pub use session::Session;
pub use wait::WaitRegistry;

use self::constants::{
    GATEWAY_VERSION, RECONNECT_DELAY_FRESH_MS, WRITE_TASK_SHUTDOWN_MS, opcode,
};
use self::types::{GatewayMessage, SessionOutcome, is_fatal_close, is_reidentify_close};
use crate::common::{Backoff, ClientError, Result};
use crate::config::ClientConfig;
use crate::router::DispatchRouter;

/// Owns the control websocket: identify/resume, heartbeat, dispatch decode
/// and the reconnect/backoff loop.
pub struct GatewayConnection {
    config: Arc<ClientConfig>,
    pub(crate) session: Arc<Session>,
    pub(crate) router: Arc<dyn DispatchRouter>,
    pub(crate) waits: Arc<WaitRegistry>,
    commands: Option<tokio::sync::mpsc::UnboundedReceiver<GatewayMessage>>,
    cancel: CancellationToken,
}

/// Cloneable sender for caller-initiated gateway traffic. Survives
/// reconnects: queued commands are drained by whichever socket is current.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: tokio::sync::mpsc::UnboundedSender<GatewayMessage>,
    session: Arc<Session>,
    cancel: CancellationToken,
}

impl GatewayHandle {
    fn send(&self, op: u8, d: Value) {
        let _ = self.tx.send(GatewayMessage::new(op, d));
    }

    /// Op 4: joins, moves or leaves a voice channel. Voice joins go out on
    /// the main gateway, never the voice socket.
    pub fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) {
        self.send(
            opcode::VOICE_STATE_UPDATE,
            json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        );
    }

    /// Op 3: presence update, payload per the wire format.
    pub fn update_presence(&self, presence: Value) {
        self.send(opcode::PRESENCE_UPDATE, presence);
    }

    /// Op 8: requests the member list of a guild.
    pub fn request_guild_members(&self, guild_id: &str, query: &str, limit: u32) {
        self.send(
            opcode::REQUEST_GUILD_MEMBERS,
            json!({ "guild_id": guild_id, "query": query, "limit": limit }),
        );
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Stops the connection loop; idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl GatewayConnection {
    pub fn new(
        config: Arc<ClientConfig>,
        router: Arc<dyn DispatchRouter>,
        waits: Arc<WaitRegistry>,
    ) -> (Self, GatewayHandle) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let session = Arc::new(Session::new(config.shard));
        let cancel = CancellationToken::new();
        let handle = GatewayHandle {
            tx,
            session: session.clone(),
            cancel: cancel.clone(),
        };
        let conn = Self {
            config,
            session,
            router,
            waits,
            commands: Some(rx),
            cancel,
        };
        (conn, handle)
    }

    /// Runs the connection until shutdown or a fatal auth failure. Transient
    /// transport and protocol errors are retried through backoff forever;
    /// only `ClientError::Auth` ever escapes.
    pub async fn run(mut self) -> Result<()> {
        let mut commands = self
            .commands
            .take()
            .ok_or_else(|| ClientError::Protocol("gateway connection already running".into()))?;
        let mut backoff = Backoff::new();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let outcome = self.connect(&mut commands).await;

            // A session that reached READY/RESUMED earns a fresh backoff.
            if self.session.take_established() {
                backoff.reset();
            }

            match outcome {
                Ok(SessionOutcome::Exit) => {
                    debug!("gateway shutting down cleanly");
                    return Ok(());
                }
                Ok(SessionOutcome::Fatal(reason)) => {
                    error!("fatal gateway close: {reason}");
                    return Err(ClientError::Auth(reason));
                }
                Ok(outcome @ SessionOutcome::Resume) => {
                    let delay = reconnect_delay(&outcome, &mut backoff);
                    debug!("reconnecting in {delay:?} (resume)");
                    tokio::time::sleep(delay).await;
                }
                Ok(outcome @ SessionOutcome::Identify) => {
                    self.session.invalidate();
                    let delay = reconnect_delay(&outcome, &mut backoff);
                    debug!("session invalidated, identifying fresh in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!("gateway connection error: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect(
        &self,
        commands: &mut tokio::sync::mpsc::UnboundedReceiver<GatewayMessage>,
    ) -> Result<SessionOutcome> {
        let url = self.connect_url();
        debug!("connecting to gateway: {url}");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        let login = serde_json::to_string(&self.login_message())?;
        write.send(Message::Text(login.into())).await?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!("gateway write error: {e}");
                    break;
                }
            }
        });

        let zombie = CancellationToken::new();
        let mut handler = handler::FrameHandler::new(self, tx.clone(), zombie.clone());

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionOutcome::Exit,
                _ = zombie.cancelled() => {
                    warn!("zombied connection, forcing resume");
                    break SessionOutcome::Resume;
                }
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break SessionOutcome::Exit };
                    if let Ok(text) = serde_json::to_string(&cmd) {
                        let _ = tx.send(Message::Text(text.into()));
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("gateway read error: {e}");
                            break SessionOutcome::Resume;
                        }
                        None => {
                            debug!("gateway stream ended");
                            break SessionOutcome::Resume;
                        }
                    };

                    match msg {
                        Message::Text(text) => {
                            if let Some(outcome) = handler.handle_text(&text).await {
                                break outcome;
                            }
                        }
                        Message::Binary(bin) => {
                            if let Some(outcome) = handler.handle_binary(&bin).await {
                                break outcome;
                            }
                        }
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .map(|cf| (cf.code.into(), cf.reason.to_string()))
                                .unwrap_or((1000u16, "no reason".into()));
                            info!("gateway closed: code={code}, reason='{reason}'");
                            break classify_close(code, &reason);
                        }
                        _ => {}
                    }
                }
            }
        };

        drop(handler);
        drop(tx);
        let _ = tokio::time::timeout(
            Duration::from_millis(WRITE_TASK_SHUTDOWN_MS),
            write_task,
        )
        .await;

        Ok(outcome)
    }

    fn connect_url(&self) -> String {
        let base = if self.session.can_resume() {
            self.session
                .resume_url()
                .unwrap_or_else(|| self.config.gateway_url.clone())
        } else {
            self.config.gateway_url.clone()
        };
        let mut url = format!("{base}/?v={GATEWAY_VERSION}&encoding=json");
        if self.config.compress {
            url.push_str("&compress=zlib-stream");
        }
        url
    }

    /// Resume iff both session id and sequence survive from the previous
    /// session; otherwise a fresh Identify.
    fn login_message(&self) -> GatewayMessage {
        if self.session.can_resume() {
            // can_resume() guarantees both are present.
            let session_id = self.session.session_id().map(|s| s.0).unwrap_or_default();
            let seq = self.session.sequence().unwrap_or_default();
            GatewayMessage::new(
                opcode::RESUME,
                json!({
                    "token": self.config.token,
                    "session_id": session_id,
                    "seq": seq,
                }),
            )
        } else {
            GatewayMessage::new(
                opcode::IDENTIFY,
                json!({
                    "token": self.config.token,
                    "intents": self.config.intents,
                    "properties": {
                        "os": self.config.properties.os,
                        "browser": self.config.properties.browser,
                        "device": self.config.properties.device,
                    },
                    "shard": [self.config.shard.0, self.config.shard.1],
                }),
            )
        }
    }
}

/// Delay before the next connect attempt. A fresh Identify waits a short
/// fixed interval and leaves the backoff ladder untouched; everything else
/// climbs it.
fn reconnect_delay(outcome: &SessionOutcome, backoff: &mut Backoff) -> Duration {
    match outcome {
        SessionOutcome::Identify => Duration::from_millis(RECONNECT_DELAY_FRESH_MS),
        _ => backoff.next(),
    }
}

fn classify_close(code: u16, reason: &str) -> SessionOutcome {
    if is_fatal_close(code) {
        SessionOutcome::Fatal(format!("close {code}: {reason}"))
    } else if is_reidentify_close(code) {
        SessionOutcome::Identify
    } else {
        // Resumable codes and everything unlisted (1000/1001/1006/unknown).
        SessionOutcome::Resume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{DispatchEvent, DispatchRouter};
    use serde_json::json;

    struct NullRouter;

    #[async_trait::async_trait]
    impl DispatchRouter for NullRouter {
        async fn handle(&self, _event: DispatchEvent) {}
    }

    fn test_conn() -> (GatewayConnection, GatewayHandle) {
        let config = Arc::new(ClientConfig {
            token: "test-token".into(),
            ..ClientConfig::default()
        });
        GatewayConnection::new(config, Arc::new(NullRouter), Arc::new(WaitRegistry::new()))
    }

    #[test]
    fn identifies_without_saved_session() {
        let (conn, _handle) = test_conn();
        let msg = conn.login_message();
        assert_eq!(msg.op, opcode::IDENTIFY);
        assert_eq!(msg.d["token"], "test-token");
        assert_eq!(msg.d["shard"], json!([0, 1]));
        assert!(msg.d["properties"]["os"].is_string());
    }

    #[test]
    fn resumes_iff_session_id_and_sequence_present() {
        let (conn, _handle) = test_conn();

        // Sequence alone is not enough.
        conn.session.observe_sequence(100);
        assert_eq!(conn.login_message().op, opcode::IDENTIFY);

        conn.session
            .note_ready(&json!({ "session_id": "sess-1", "user": { "id": "7" } }));
        let msg = conn.login_message();
        assert_eq!(msg.op, opcode::RESUME);
        assert_eq!(msg.d["session_id"], "sess-1");
        assert_eq!(msg.d["seq"], 100);

        // Invalidation falls back to Identify.
        conn.session.invalidate();
        assert_eq!(conn.login_message().op, opcode::IDENTIFY);
    }

    #[test]
    fn resume_prefers_the_resume_url() {
        let (conn, _handle) = test_conn();
        conn.session.observe_sequence(1);
        conn.session.note_ready(&json!({
            "session_id": "s",
            "resume_gateway_url": "wss://resume.example",
            "user": { "id": "7" }
        }));
        assert!(conn.connect_url().starts_with("wss://resume.example/?v=10"));
    }

    #[test]
    fn compress_flag_appends_zlib_stream() {
        let config = Arc::new(ClientConfig {
            token: "t".into(),
            compress: true,
            ..ClientConfig::default()
        });
        let (conn, _handle) =
            GatewayConnection::new(config, Arc::new(NullRouter), Arc::new(WaitRegistry::new()));
        assert!(conn.connect_url().ends_with("&compress=zlib-stream"));
    }

    #[test]
    fn fresh_identify_does_not_climb_the_backoff_ladder() {
        let mut backoff = Backoff::new();
        for _ in 0..4 {
            assert_eq!(
                reconnect_delay(&SessionOutcome::Identify, &mut backoff),
                Duration::from_millis(RECONNECT_DELAY_FRESH_MS)
            );
        }
        // The next resumable delay is still the first rung (1s + 25% jitter).
        assert!(reconnect_delay(&SessionOutcome::Resume, &mut backoff) <= Duration::from_millis(1_250));
    }

    #[test]
    fn close_classification_covers_the_policy_table() {
        assert!(matches!(classify_close(4008, ""), SessionOutcome::Resume));
        assert!(matches!(classify_close(4009, ""), SessionOutcome::Identify));
        assert!(matches!(classify_close(4004, ""), SessionOutcome::Fatal(_)));
        assert!(matches!(classify_close(1006, ""), SessionOutcome::Resume));
    }
}
