use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod constants;
pub mod handler;
pub mod heartbeat;
pub mod types;
pub mod udp;

use self::constants::{
    MAX_VOICE_RECONNECT_ATTEMPTS, VOICE_GATEWAY_VERSION, WRITE_TASK_SHUTDOWN_MS, opcode,
};
use self::types::{VoiceGatewayMessage, VoiceOutcome, classify_voice_close};
use crate::audio::pipeline::AudioPipeline;
use crate::audio::transcoder::{TranscodeInput, Transcoder};
use crate::common::{Backoff, ChannelId, ClientError, GuildId, Result, SessionId, UserId};
use crate::config::ClientConfig;
use crate::gateway::{GatewayHandle, WaitRegistry};

/// Everything the audio pipeline needs to transmit: published once the
/// SessionDescription delivers the secret key. `ssrc` and `secret_key` are
/// only ever valid after protocol selection completes. The sequencer is
/// created alongside the key and shared by every playback, so frame
/// counters (and with them the packet nonces) never restart under one key.
#[derive(Clone)]
pub struct AudioReady {
    pub(crate) socket: Arc<tokio::net::UdpSocket>,
    pub(crate) address: SocketAddr,
    pub(crate) ssrc: u32,
    pub(crate) secret_key: [u8; 32],
    pub(crate) sequencer: Arc<parking_lot::Mutex<udp::RtpSequencer>>,
}

/// A per-guild voice transport: its own websocket for negotiation and a UDP
/// socket for encrypted audio, fully independent of the control gateway
/// once joined.
pub struct VoiceSession {
    guild_id: GuildId,
    channel_id: ChannelId,
    gateway: GatewayHandle,
    config: Arc<ClientConfig>,
    ready_rx: watch::Receiver<Option<AudioReady>>,
    speak_tx: tokio::sync::mpsc::UnboundedSender<VoiceGatewayMessage>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<()>>>>,
}

impl VoiceSession {
    /// Joins `channel_id`: announces the move on the **main** gateway
    /// (op 4), then waits for the matching VOICE_STATE_UPDATE (session id)
    /// and VOICE_SERVER_UPDATE (endpoint + token). Arrival order of the two
    /// is not guaranteed and does not matter; either missing its deadline
    /// fails the join.
    pub async fn join(
        config: Arc<ClientConfig>,
        gateway: GatewayHandle,
        waits: Arc<WaitRegistry>,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Self> {
        let user_id = gateway
            .session()
            .user_id()
            .ok_or_else(|| ClientError::Protocol("gateway has not received READY yet".into()))?;

        gateway.update_voice_state(&guild_id, Some(&channel_id.0), false, false);

        let deadline = Duration::from_secs(config.voice.join_timeout_secs);
        let state_guild = guild_id.clone();
        let state_user = user_id.clone();
        let state = waits.wait_for("VOICE_STATE_UPDATE", Some(deadline), move |d| {
            d["guild_id"] == state_guild.0 && d["user_id"] == state_user.0
        });
        let server_guild = guild_id.clone();
        let server = waits.wait_for("VOICE_SERVER_UPDATE", Some(deadline), move |d| {
            d["guild_id"] == server_guild.0
        });
        let (state, server) = tokio::try_join!(state, server)?;

        let session_id = state["session_id"]
            .as_str()
            .ok_or_else(|| ClientError::Protocol("voice state update without session_id".into()))?
            .to_string();
        let token = server["token"]
            .as_str()
            .ok_or_else(|| ClientError::Protocol("voice server update without token".into()))?
            .to_string();
        let endpoint = server["endpoint"]
            .as_str()
            .ok_or_else(|| ClientError::Protocol("voice server update without endpoint".into()))?
            .trim_start_matches("wss://")
            .to_string();

        info!("[{guild_id}] voice negotiation targets {endpoint}");

        let (ready_tx, ready_rx) = watch::channel(None);
        let (speak_tx, speak_rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let conn = VoiceConnection {
            guild_id: guild_id.clone(),
            user_id,
            session_id: SessionId(session_id),
            token,
            endpoint,
            ready_tx,
            cancel: cancel.clone(),
            established: AtomicBool::new(false),
        };
        let task = tokio::spawn(conn.run(speak_rx));

        Ok(Self {
            guild_id,
            channel_id,
            gateway,
            config,
            ready_rx,
            speak_tx,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Starts streaming `input` through the external transcoder. Blocks
    /// until the voice handshake has delivered the secret key; audio can
    /// never be sent before then.
    pub async fn play(&self, input: TranscodeInput) -> Result<Arc<AudioPipeline>> {
        let mut ready_rx = self.ready_rx.clone();
        let ready = ready_rx
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| {
                ClientError::Protocol("voice session closed before transport was ready".into())
            })?
            .clone()
            .ok_or(ClientError::VoiceSessionInvalid)?;

        let transcoder = Transcoder::spawn(&self.config.voice, input)?;
        Ok(AudioPipeline::start(ready, self.speak_tx.clone(), transcoder))
    }

    /// Leaves the channel and tears the session down. The run loop's final
    /// verdict is returned; `VoiceSessionInvalid` from it means the caller
    /// must use a fresh `join()` next time (it must anyway after this).
    pub async fn disconnect(self) -> Result<()> {
        self.gateway
            .update_voice_state(&self.guild_id, None, false, false);
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }

    /// Resolves once the voice run loop exits, yielding its verdict. A
    /// `VoiceSessionInvalid` error here is the 4006 case: discard this
    /// session and `join()` again.
    pub async fn closed(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }
}

/// Connection-loop state, owned by the spawned voice task.
pub(crate) struct VoiceConnection {
    pub(crate) guild_id: GuildId,
    user_id: UserId,
    session_id: SessionId,
    token: String,
    endpoint: String,
    ready_tx: watch::Sender<Option<AudioReady>>,
    cancel: CancellationToken,
    established: AtomicBool,
}

impl VoiceConnection {
    pub(crate) fn publish_ready(&self, ready: AudioReady) {
        let _ = self.ready_tx.send(Some(ready));
    }

    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    async fn run(
        self,
        mut commands: tokio::sync::mpsc::UnboundedReceiver<VoiceGatewayMessage>,
    ) -> Result<()> {
        let mut backoff = Backoff::with_max_attempts(MAX_VOICE_RECONNECT_ATTEMPTS);
        let mut is_resume = false;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let outcome = self.connect(is_resume, &mut commands).await;

            if self.established.swap(false, Ordering::AcqRel) {
                backoff.reset();
            }

            match outcome {
                Ok(VoiceOutcome::Exit) => {
                    debug!("[{}] voice session shutting down cleanly", self.guild_id);
                    return Ok(());
                }
                Ok(VoiceOutcome::Rejoin) => {
                    // 4006: resume is forbidden, the caller must rebuild the
                    // session from join().
                    warn!("[{}] voice session invalidated (4006)", self.guild_id);
                    return Err(ClientError::VoiceSessionInvalid);
                }
                Ok(VoiceOutcome::Fatal(reason)) => {
                    warn!("[{}] fatal voice close: {reason}", self.guild_id);
                    return Err(ClientError::Auth(reason));
                }
                Ok(VoiceOutcome::Resume) => {
                    if backoff.is_exhausted() {
                        return Err(ClientError::Transport(
                            "voice reconnect attempts exhausted".into(),
                        ));
                    }
                    let delay = backoff.next();
                    debug!("[{}] voice reconnect in {delay:?} (resume)", self.guild_id);
                    tokio::time::sleep(delay).await;
                    is_resume = true;
                }
                Err(e) => {
                    if backoff.is_exhausted() {
                        return Err(e);
                    }
                    let delay = backoff.next();
                    warn!(
                        "[{}] voice connection error: {e}; full reconnect in {delay:?}",
                        self.guild_id
                    );
                    tokio::time::sleep(delay).await;
                    // A failed resume falls back to a fresh Identify.
                    is_resume = false;
                }
            }
        }
    }

    async fn connect(
        &self,
        is_resume: bool,
        commands: &mut tokio::sync::mpsc::UnboundedReceiver<VoiceGatewayMessage>,
    ) -> Result<VoiceOutcome> {
        let url = format!("wss://{}?v={}", self.endpoint, VOICE_GATEWAY_VERSION);
        debug!("[{}] connecting to voice gateway: {url}", self.guild_id);

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        let login = if is_resume {
            self.resume_message()
        } else {
            self.identify_message()
        };
        write
            .send(Message::Text(serde_json::to_string(&login)?.into()))
            .await?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let guild_id = self.guild_id.clone();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!("[{guild_id}] voice write error: {e}");
                    break;
                }
            }
        });

        let zombie = CancellationToken::new();
        let mut handler = handler::VoiceFrameHandler::new(self, tx.clone(), zombie.clone());

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break VoiceOutcome::Exit,
                _ = zombie.cancelled() => {
                    warn!("[{}] zombied voice connection, forcing resume", self.guild_id);
                    break VoiceOutcome::Resume;
                }
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break VoiceOutcome::Exit };
                    if let Ok(text) = serde_json::to_string(&cmd) {
                        let _ = tx.send(Message::Text(text.into()));
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("[{}] voice read error: {e}", self.guild_id);
                            break VoiceOutcome::Resume;
                        }
                        None => {
                            debug!("[{}] voice stream ended", self.guild_id);
                            break VoiceOutcome::Resume;
                        }
                    };

                    match msg {
                        Message::Text(text) => {
                            if let Some(outcome) = handler.handle_text(&text).await {
                                break outcome;
                            }
                        }
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .map(|cf| (cf.code.into(), cf.reason.to_string()))
                                .unwrap_or((1000u16, "no reason".into()));
                            info!(
                                "[{}] voice closed: code={code}, reason='{reason}'",
                                self.guild_id
                            );
                            break classify_voice_close(code, &reason);
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

    fn identify_message(&self) -> VoiceGatewayMessage {
        VoiceGatewayMessage::new(
            opcode::IDENTIFY,
            json!({
                "server_id": self.guild_id,
                "user_id": self.user_id,
                "session_id": self.session_id,
                "token": self.token,
            }),
        )
    }

    fn resume_message(&self) -> VoiceGatewayMessage {
        VoiceGatewayMessage::new(
            opcode::RESUME,
            json!({
                "server_id": self.guild_id,
                "session_id": self.session_id,
                "token": self.token,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> VoiceConnection {
        let (ready_tx, _ready_rx) = watch::channel(None);
        VoiceConnection {
            guild_id: GuildId("123".into()),
            user_id: UserId("42".into()),
            session_id: SessionId("sess".into()),
            token: "voice-token".into(),
            endpoint: "voice.example.com:443".into(),
            ready_tx,
            cancel: CancellationToken::new(),
            established: AtomicBool::new(false),
        }
    }

    #[test]
    fn identify_carries_the_four_handshake_fields() {
        let msg = test_conn().identify_message();
        assert_eq!(msg.op, 0);
        assert_eq!(msg.d["server_id"], "123");
        assert_eq!(msg.d["user_id"], "42");
        assert_eq!(msg.d["session_id"], "sess");
        assert_eq!(msg.d["token"], "voice-token");
    }

    #[test]
    fn resume_omits_user_id() {
        let msg = test_conn().resume_message();
        assert_eq!(msg.op, 7);
        assert_eq!(msg.d["server_id"], "123");
        assert_eq!(msg.d["session_id"], "sess");
        assert_eq!(msg.d["token"], "voice-token");
        assert!(msg.d.get("user_id").is_none());
    }
}
