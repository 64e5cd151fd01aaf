use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::constants::opcode;
use super::session::Session;
use super::types::GatewayMessage;

/// Spawns the gateway heartbeat task: `{op:1, d:<sequence>}` every
/// `interval_ms`, first beat one full interval after Hello.
///
/// Zombie detection: each beat clears `last_ack`; if the next beat finds it
/// still cleared, the server never acked and the connection is dead: the
/// task cancels `zombie`, which the receive loop treats as a resumable
/// disconnect. The returned handle is aborted whenever the owning socket is
/// replaced, so at most one heartbeat task exists per connection.
pub fn spawn_heartbeat(
    tx: tokio::sync::mpsc::UnboundedSender<Message>,
    session: Arc<Session>,
    interval_ms: u64,
    zombie: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    // An ack left outstanding by the previous socket must not count against
    // this connection.
    session.last_ack.store(true, Ordering::Release);
    tokio::spawn(async move {
        let period = Duration::from_millis(interval_ms);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;

            if !session.last_ack.swap(false, Ordering::AcqRel) {
                warn!("heartbeat ack missed, connection zombied");
                zombie.cancel();
                break;
            }

            let seq = session
                .sequence()
                .map_or(serde_json::Value::Null, Into::into);
            let beat = GatewayMessage::new(opcode::HEARTBEAT, seq);
            let Ok(text) = serde_json::to_string(&beat) else {
                break;
            };
            if tx.send(Message::Text(text.into())).is_err() {
                break; // Channel closed, connection ending.
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn recv_beat(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().expect("expected a heartbeat frame") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn beats_on_the_hello_interval_with_current_sequence() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let session = Arc::new(Session::new((0, 1)));
        session.observe_sequence(17);
        let zombie = CancellationToken::new();

        let handle = spawn_heartbeat(tx, session.clone(), 41_250, zombie.clone());
        // Let the task register its interval before the clock moves.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(41_249)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "beat fired early");

        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        let beat = recv_beat(&mut rx);
        assert_eq!(beat["op"], 1);
        assert_eq!(beat["d"], 17);

        // Ack it so the next interval produces another beat.
        session.last_ack.store(true, Ordering::Release);
        session.observe_sequence(18);
        tokio::time::advance(Duration::from_millis(41_250)).await;
        tokio::task::yield_now().await;
        let beat = recv_beat(&mut rx);
        assert_eq!(beat["d"], 18);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_missed_ack_does_not_zombie_a_fresh_connection() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let session = Arc::new(Session::new((0, 1)));
        // The previous connection died with its last beat unacked.
        session.last_ack.store(false, Ordering::Release);
        let zombie = CancellationToken::new();

        let handle = spawn_heartbeat(tx, session.clone(), 1_000, zombie.clone());
        // Let the task register its interval before the clock moves.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(1_000)).await;
        tokio::task::yield_now().await;
        assert!(!zombie.is_cancelled(), "fresh connection zombied by stale ack state");
        let beat = recv_beat(&mut rx);
        assert_eq!(beat["op"], 1);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ack_cancels_the_zombie_token() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let session = Arc::new(Session::new((0, 1)));
        let zombie = CancellationToken::new();

        let handle = spawn_heartbeat(tx, session, 1_000, zombie.clone());
        // Let the task register its interval before the clock moves.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(1_000)).await;
        tokio::task::yield_now().await;
        assert!(!zombie.is_cancelled());
        let _ = recv_beat(&mut rx);

        // No ack before the next beat: zombied.
        tokio::time::advance(Duration::from_millis(1_000)).await;
        tokio::task::yield_now().await;
        assert!(zombie.is_cancelled());
        assert!(rx.try_recv().is_err(), "no beat after zombie detection");

        handle.abort();
    }
}
