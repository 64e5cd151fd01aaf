use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::common::{ClientError, Result};

type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

struct PendingWait {
    id: u64,
    predicate: Predicate,
    tx: oneshot::Sender<Value>,
}

/// Correlates inbound dispatch events with pending async waiters.
///
/// Waits are keyed by event type, so dispatching an event only ever touches
/// waiters for that exact type. Registration happens from one task and
/// resolution from another, both under the single mutex; each wait is
/// fulfilled at most once and removed.
pub struct WaitRegistry {
    next_id: AtomicU64,
    waits: Mutex<HashMap<String, Vec<PendingWait>>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            waits: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves every registered waiter whose predicate matches `payload`.
    pub fn dispatch(&self, event: &str, payload: &Value) {
        let mut waits = self.waits.lock();
        let Some(list) = waits.get_mut(event) else {
            return;
        };

        let mut i = 0;
        while i < list.len() {
            if (list[i].predicate)(payload) {
                let wait = list.remove(i);
                let _ = wait.tx.send(payload.clone());
            } else {
                i += 1;
            }
        }
        if list.is_empty() {
            waits.remove(event);
        }
    }

    /// Waits for the next `event` dispatch matching `predicate`. With a
    /// deadline, expiry removes the registration and yields `WaitTimeout`
    /// instead of hanging forever.
    pub async fn wait_for(
        &self,
        event: &str,
        deadline: Option<Duration>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waits
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(PendingWait {
                id,
                predicate: Box::new(predicate),
                tx,
            });

        let recv = async {
            rx.await
                .map_err(|_| ClientError::Protocol(format!("wait for {event} dropped")))
        };

        match deadline {
            None => recv.await,
            Some(limit) => match tokio::time::timeout(limit, recv).await {
                Ok(result) => result,
                Err(_) => {
                    self.remove(event, id);
                    Err(ClientError::WaitTimeout(event.to_string()))
                }
            },
        }
    }

    fn remove(&self, event: &str, id: u64) {
        let mut waits = self.waits.lock();
        if let Some(list) = waits.get_mut(event) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                waits.remove(event);
            }
        }
    }
}

impl Default for WaitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn fulfills_matching_waiter_once() {
        let registry = Arc::new(WaitRegistry::new());
        let reg = registry.clone();
        let wait = tokio::spawn(async move {
            reg.wait_for("VOICE_STATE_UPDATE", None, |d| d["guild_id"] == "123")
                .await
        });
        tokio::task::yield_now().await;

        registry.dispatch("VOICE_STATE_UPDATE", &json!({"guild_id": "999"}));
        registry.dispatch("VOICE_STATE_UPDATE", &json!({"guild_id": "123", "session_id": "s1"}));

        let payload = wait.await.unwrap().unwrap();
        assert_eq!(payload["session_id"], "s1");

        // Already fulfilled and removed: a second dispatch goes nowhere.
        registry.dispatch("VOICE_STATE_UPDATE", &json!({"guild_id": "123"}));
        assert!(registry.waits.lock().is_empty());
    }

    #[tokio::test]
    async fn voice_join_completes_regardless_of_arrival_order() {
        // VOICE_SERVER_UPDATE for guild "123" lands before the matching
        // VOICE_STATE_UPDATE; both waits must still resolve.
        let registry = Arc::new(WaitRegistry::new());

        let reg = registry.clone();
        let join = tokio::spawn(async move {
            let state = reg.wait_for("VOICE_STATE_UPDATE", None, |d| d["guild_id"] == "123");
            let server = reg.wait_for("VOICE_SERVER_UPDATE", None, |d| d["guild_id"] == "123");
            tokio::try_join!(state, server)
        });
        tokio::task::yield_now().await;

        registry.dispatch(
            "VOICE_SERVER_UPDATE",
            &json!({"guild_id": "123", "endpoint": "voice.example:443", "token": "tok"}),
        );
        registry.dispatch(
            "VOICE_STATE_UPDATE",
            &json!({"guild_id": "123", "user_id": "42", "session_id": "sess"}),
        );

        let (state, server) = join.await.unwrap().unwrap();
        assert_eq!(state["session_id"], "sess");
        assert_eq!(server["endpoint"], "voice.example:443");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_yields_wait_timeout_and_unregisters() {
        let registry = WaitRegistry::new();
        let result = registry
            .wait_for(
                "VOICE_SERVER_UPDATE",
                Some(Duration::from_secs(5)),
                |_| true,
            )
            .await;
        assert!(matches!(result, Err(ClientError::WaitTimeout(_))));
        assert!(registry.waits.lock().is_empty());
    }

    #[tokio::test]
    async fn unrelated_event_types_are_untouched() {
        let registry = Arc::new(WaitRegistry::new());
        let reg = registry.clone();
        let wait = tokio::spawn(async move { reg.wait_for("GUILD_CREATE", None, |_| true).await });
        tokio::task::yield_now().await;

        registry.dispatch("MESSAGE_CREATE", &json!({"content": "hi"}));
        assert_eq!(registry.waits.lock().len(), 1);

        registry.dispatch("GUILD_CREATE", &json!({"id": "1"}));
        assert!(wait.await.unwrap().is_ok());
    }
}
