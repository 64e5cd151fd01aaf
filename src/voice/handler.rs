use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::VoiceConnection;
use super::constants::{DEFAULT_VOICE_HEARTBEAT_MS, ENCRYPTION_MODE, opcode};
use super::heartbeat::spawn_voice_heartbeat;
use super::types::{VoiceGatewayMessage, VoiceOutcome};
use super::udp::{RtpSequencer, discover_ip};
use crate::voice::AudioReady;

/// Handshake handler for one voice socket: Hello → heartbeat, Ready → UDP
/// discovery + SelectProtocol, SessionDescription → secret key → audio
/// unblocked.
pub(super) struct VoiceFrameHandler<'a> {
    conn: &'a VoiceConnection,
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    zombie: CancellationToken,
    last_ack: Arc<AtomicBool>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    udp_socket: Option<Arc<tokio::net::UdpSocket>>,
    udp_addr: Option<SocketAddr>,
    ssrc: u32,
}

impl<'a> VoiceFrameHandler<'a> {
    pub(super) fn new(
        conn: &'a VoiceConnection,
        tx: tokio::sync::mpsc::UnboundedSender<Message>,
        zombie: CancellationToken,
    ) -> Self {
        Self {
            conn,
            tx,
            zombie,
            last_ack: Arc::new(AtomicBool::new(true)),
            heartbeat: None,
            udp_socket: None,
            udp_addr: None,
            ssrc: 0,
        }
    }

    pub(super) async fn handle_text(&mut self, text: &str) -> Option<VoiceOutcome> {
        let msg: VoiceGatewayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "[{}] failed to parse voice gateway frame: {e}",
                    self.conn.guild_id
                );
                return Some(VoiceOutcome::Resume);
            }
        };

        match msg.op {
            opcode::HELLO => self.handle_hello(msg.d),
            opcode::READY => self.handle_ready(msg.d).await,
            opcode::SESSION_DESCRIPTION => self.handle_session_description(msg.d),
            opcode::HEARTBEAT_ACK => {
                self.last_ack.store(true, Ordering::Release);
                None
            }
            opcode::RESUMED => {
                info!("[{}] voice session resumed", self.conn.guild_id);
                self.conn.mark_established();
                None
            }
            other => {
                debug!("[{}] ignoring voice op {other}", self.conn.guild_id);
                None
            }
        }
    }

    fn handle_hello(&mut self, d: Value) -> Option<VoiceOutcome> {
        // The interval is fractional on the wire for version 4.
        let interval = d["heartbeat_interval"]
            .as_f64()
            .filter(|ms| *ms >= 1.0)
            .map(|ms| ms as u64)
            .unwrap_or(DEFAULT_VOICE_HEARTBEAT_MS);
        debug!(
            "[{}] voice heartbeat interval {interval}ms",
            self.conn.guild_id
        );

        if let Some(old) = self.heartbeat.take() {
            old.abort();
        }
        self.heartbeat = Some(spawn_voice_heartbeat(
            self.tx.clone(),
            self.last_ack.clone(),
            interval,
            self.zombie.clone(),
        ));
        None
    }

    async fn handle_ready(&mut self, d: Value) -> Option<VoiceOutcome> {
        let Some(ssrc) = d["ssrc"]
            .as_u64()
            .filter(|s| *s > 0 && *s <= u64::from(u32::MAX))
        else {
            warn!("[{}] voice ready without a usable ssrc", self.conn.guild_id);
            return Some(VoiceOutcome::Resume);
        };
        self.ssrc = ssrc as u32;
        let ip = d["ip"].as_str().unwrap_or("");
        let port = d["port"].as_u64().unwrap_or(0) as u16;
        let addr: SocketAddr = match format!("{ip}:{port}").parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("[{}] bad voice UDP address {ip}:{port}: {e}", self.conn.guild_id);
                return Some(VoiceOutcome::Resume);
            }
        };
        self.udp_addr = Some(addr);

        if let Some(modes) = d["modes"].as_array() {
            if !modes.iter().any(|m| m.as_str() == Some(ENCRYPTION_MODE)) {
                return Some(VoiceOutcome::Fatal(format!(
                    "server offers none of the supported encryption modes (wanted {ENCRYPTION_MODE})"
                )));
            }
        }

        let socket = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("[{}] failed to bind voice UDP socket: {e}", self.conn.guild_id);
                return Some(VoiceOutcome::Resume);
            }
        };

        match discover_ip(&socket, addr, self.ssrc).await {
            Ok((external_ip, external_port)) => {
                info!(
                    "[{}] voice ready: ssrc={}, external {external_ip}:{external_port}",
                    self.conn.guild_id, self.ssrc
                );
                self.udp_socket = Some(socket);
                self.send_json(select_protocol_message(&external_ip, external_port));
                None
            }
            Err(e) => {
                warn!("[{}] IP discovery failed: {e}", self.conn.guild_id);
                Some(VoiceOutcome::Resume)
            }
        }
    }

    fn handle_session_description(&mut self, d: Value) -> Option<VoiceOutcome> {
        if let Some(mode) = d["mode"].as_str() {
            if mode != ENCRYPTION_MODE {
                return Some(VoiceOutcome::Fatal(format!(
                    "server selected unsupported encryption mode {mode}"
                )));
            }
        }

        let Some(secret_key) = parse_secret_key(&d) else {
            warn!(
                "[{}] session description missing a usable secret_key",
                self.conn.guild_id
            );
            return Some(VoiceOutcome::Resume);
        };

        let (Some(socket), Some(address)) = (self.udp_socket.clone(), self.udp_addr) else {
            warn!(
                "[{}] session description before UDP discovery completed",
                self.conn.guild_id
            );
            return Some(VoiceOutcome::Resume);
        };

        debug!("[{}] voice transport keyed, audio unblocked", self.conn.guild_id);
        self.conn.publish_ready(AudioReady {
            socket,
            address,
            ssrc: self.ssrc,
            secret_key,
            sequencer: Arc::new(parking_lot::Mutex::new(RtpSequencer::new(self.ssrc))),
        });
        self.conn.mark_established();
        None
    }

    fn send_json(&self, msg: VoiceGatewayMessage) {
        if let Ok(text) = serde_json::to_string(&msg) {
            let _ = self.tx.send(Message::Text(text.into()));
        }
    }
}

impl Drop for VoiceFrameHandler<'_> {
    fn drop(&mut self) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
    }
}

/// Op 1: names exactly the externally discovered address and the chosen
/// encryption mode.
fn select_protocol_message(address: &str, port: u16) -> VoiceGatewayMessage {
    VoiceGatewayMessage::new(
        opcode::SELECT_PROTOCOL,
        json!({
            "protocol": "udp",
            "data": {
                "address": address,
                "port": port,
                "mode": ENCRYPTION_MODE,
            }
        }),
    )
}

fn parse_secret_key(d: &Value) -> Option<[u8; 32]> {
    let array = d["secret_key"].as_array()?;
    if array.len() < 32 {
        return None;
    }
    let mut key = [0u8; 32];
    for (slot, value) in key.iter_mut().zip(array.iter()) {
        *slot = value.as_u64()? as u8;
    }
    Some(key)
}
