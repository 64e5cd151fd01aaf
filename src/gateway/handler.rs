use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::GatewayConnection;
use super::constants::{DEFAULT_HEARTBEAT_INTERVAL_MS, opcode};
use super::heartbeat::spawn_heartbeat;
use super::inflate::Inflater;
use super::types::{GatewayMessage, SessionOutcome};
use crate::router::DispatchEvent;

/// Per-connection frame handler. Owns the zlib-stream inflater and the
/// heartbeat task for exactly one socket; dropped (and with it the heartbeat
/// aborted) whenever the socket is replaced.
pub(super) struct FrameHandler<'a> {
    conn: &'a GatewayConnection,
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    zombie: CancellationToken,
    inflater: Inflater,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

impl<'a> FrameHandler<'a> {
    pub(super) fn new(
        conn: &'a GatewayConnection,
        tx: tokio::sync::mpsc::UnboundedSender<Message>,
        zombie: CancellationToken,
    ) -> Self {
        Self {
            conn,
            tx,
            zombie,
            inflater: Inflater::new(),
            heartbeat: None,
        }
    }

    pub(super) async fn handle_text(&mut self, text: &str) -> Option<SessionOutcome> {
        let msg: GatewayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                // Malformed frame: treated as transient, forces a resume.
                warn!("failed to parse gateway frame: {e}");
                return Some(SessionOutcome::Resume);
            }
        };

        if let Some(seq) = msg.s {
            self.conn.session.observe_sequence(seq);
        }

        match msg.op {
            opcode::HELLO => {
                let interval = msg.d["heartbeat_interval"]
                    .as_u64()
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
                debug!("hello received, heartbeat interval {interval}ms");
                self.restart_heartbeat(interval);
                None
            }
            opcode::HEARTBEAT_ACK => {
                self.conn
                    .session
                    .last_ack
                    .store(true, std::sync::atomic::Ordering::Release);
                None
            }
            // The server may request an immediate beat outside the cadence.
            opcode::HEARTBEAT => {
                self.send_immediate_heartbeat();
                None
            }
            opcode::DISPATCH => {
                self.handle_dispatch(msg).await;
                None
            }
            opcode::RECONNECT => {
                info!("server requested reconnect (op 7)");
                Some(SessionOutcome::Resume)
            }
            opcode::INVALID_SESSION => {
                let resumable = msg.d.as_bool().unwrap_or(false);
                if resumable {
                    info!("invalid session, resumable; resuming shortly");
                    Some(SessionOutcome::Resume)
                } else {
                    info!("invalid session, not resumable; identifying fresh");
                    Some(SessionOutcome::Identify)
                }
            }
            other => {
                debug!("ignoring unexpected gateway op {other}");
                None
            }
        }
    }

    /// Binary frames are zlib-stream chunks; a completed message is handled
    /// like a text frame.
    pub(super) async fn handle_binary(&mut self, bin: &[u8]) -> Option<SessionOutcome> {
        match self.inflater.push(bin) {
            Ok(Some(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.handle_text(text).await,
                Err(e) => {
                    warn!("inflated gateway frame is not UTF-8: {e}");
                    Some(SessionOutcome::Resume)
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("zlib-stream inflate error: {e}");
                Some(SessionOutcome::Resume)
            }
        }
    }

    async fn handle_dispatch(&mut self, msg: GatewayMessage) {
        let Some(name) = msg.t else {
            debug!("dispatch frame without event name");
            return;
        };

        match name.as_str() {
            "READY" => {
                self.conn.session.note_ready(&msg.d);
                info!(
                    "session ready (session_id captured, shard {:?})",
                    self.conn.session.shard()
                );
            }
            "RESUMED" => {
                self.conn.session.note_resumed();
                info!("session resumed");
            }
            _ => {}
        }

        self.conn.waits.dispatch(&name, &msg.d);
        self.conn
            .router
            .handle(DispatchEvent {
                name,
                payload: msg.d,
            })
            .await;
    }

    fn restart_heartbeat(&mut self, interval_ms: u64) {
        if let Some(old) = self.heartbeat.take() {
            old.abort();
        }
        self.heartbeat = Some(spawn_heartbeat(
            self.tx.clone(),
            self.conn.session.clone(),
            interval_ms,
            self.zombie.clone(),
        ));
    }

    fn send_immediate_heartbeat(&self) {
        let seq = self
            .conn
            .session
            .sequence()
            .map_or(serde_json::Value::Null, Into::into);
        let beat = GatewayMessage::new(opcode::HEARTBEAT, seq);
        if let Ok(text) = serde_json::to_string(&beat) {
            let _ = self.tx.send(Message::Text(text.into()));
        }
    }
}

impl Drop for FrameHandler<'_> {
    fn drop(&mut self) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
    }
}
