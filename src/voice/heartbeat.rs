use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::constants::opcode;
use super::types::VoiceGatewayMessage;

/// Voice heartbeat task: `{op:3, d:<nonce>}` on the Hello interval, with the
/// same missed-ack zombie detection as the control gateway. Runs separately
/// from the gateway heartbeat; the two sockets beat independently.
pub fn spawn_voice_heartbeat(
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    last_ack: Arc<AtomicBool>,
    interval_ms: u64,
    zombie: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(interval_ms);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;

            if !last_ack.swap(false, Ordering::AcqRel) {
                warn!("voice heartbeat ack missed, connection zombied");
                zombie.cancel();
                break;
            }

            let nonce = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            let beat = VoiceGatewayMessage::new(opcode::HEARTBEAT, json!(nonce));
            let Ok(text) = serde_json::to_string(&beat) else {
                break;
            };
            if tx.send(Message::Text(text.into())).is_err() {
                break; // Channel closed, session ending.
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn beats_and_zombies_like_the_gateway_heartbeat() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let last_ack = Arc::new(AtomicBool::new(true));
        let zombie = CancellationToken::new();

        let handle = spawn_voice_heartbeat(tx, last_ack.clone(), 500, zombie.clone());
        // Let the task register its interval before the clock moves.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        match rx.try_recv().unwrap() {
            Message::Text(text) => {
                let beat: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(beat["op"], 3);
                assert!(beat["d"].is_u64());
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Unacked: the next tick cancels the zombie token instead of beating.
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert!(zombie.is_cancelled());

        handle.abort();
    }
}
