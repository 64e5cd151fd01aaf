use serde_json::Value;

/// One decoded dispatch frame: the event name (`t`) and its payload (`d`).
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub name: String,
    pub payload: Value,
}

/// Consumer-side half of the dispatch path. The receive loop hands every
/// dispatch here after session bookkeeping and wait resolution; what happens
/// next (command handling, cache warming, ...) is the embedder's business.
#[async_trait::async_trait]
pub trait DispatchRouter: Send + Sync {
    async fn handle(&self, event: DispatchEvent);
}

/// Forwards dispatches into a channel, for embedders that prefer pulling
/// events off a stream over implementing the trait.
pub struct ChannelRouter {
    tx: tokio::sync::mpsc::UnboundedSender<DispatchEvent>,
}

impl ChannelRouter {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<DispatchEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl DispatchRouter for ChannelRouter {
    async fn handle(&self, event: DispatchEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}
