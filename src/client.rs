use std::sync::Arc;

use tracing::info;

use crate::cache::TtlCache;
use crate::common::{ChannelId, GuildId, Result};
use crate::config::{ClientConfig, LoggingConfig};
use crate::gateway::{GatewayConnection, GatewayHandle, WaitRegistry};
use crate::rest::RestClient;
use crate::router::DispatchRouter;
use crate::voice::VoiceSession;

/// Top-level handle tying the pieces together: one gateway connection, one
/// REST client, one cache, any number of voice sessions.
pub struct Client {
    config: Arc<ClientConfig>,
    rest: Arc<RestClient>,
    cache: Arc<TtlCache>,
    waits: Arc<WaitRegistry>,
    gateway: GatewayHandle,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<()>>>>,
}

impl Client {
    /// Builds the client and starts the gateway connection loop. Dispatches
    /// flow to `router` once session bookkeeping and wait resolution are
    /// done with them.
    pub fn start(config: ClientConfig, router: Arc<dyn DispatchRouter>) -> Result<Self> {
        Self::start_with_cache(config, router, Arc::new(TtlCache::new()))
    }

    /// Same as [`start`](Self::start) with a caller-owned cache, for
    /// embedders sharing one cache across clients or pre-warming it.
    pub fn start_with_cache(
        config: ClientConfig,
        router: Arc<dyn DispatchRouter>,
        cache: Arc<TtlCache>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let rest = Arc::new(RestClient::new(config.token.clone())?);
        let waits = Arc::new(WaitRegistry::new());
        let (conn, gateway) = GatewayConnection::new(config.clone(), router, waits.clone());
        let task = tokio::spawn(conn.run());
        info!("client started (shard {}/{})", config.shard.0, config.shard.1);

        Ok(Self {
            config,
            rest,
            cache,
            waits,
            gateway,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    pub fn gateway(&self) -> &GatewayHandle {
        &self.gateway
    }

    pub fn waits(&self) -> &Arc<WaitRegistry> {
        &self.waits
    }

    /// Joins a voice channel, driving the whole handshake; resolves once the
    /// voice websocket is being established. Requires READY to have been
    /// received.
    pub async fn join_voice(
        &self,
        guild_id: impl Into<GuildId>,
        channel_id: impl Into<ChannelId>,
    ) -> Result<VoiceSession> {
        VoiceSession::join(
            self.config.clone(),
            self.gateway.clone(),
            self.waits.clone(),
            guild_id.into(),
            channel_id.into(),
        )
        .await
    }

    /// Stops the gateway loop and waits for it to wind down.
    pub async fn shutdown(&self) -> Result<()> {
        self.gateway.shutdown();
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }
}

/// Installs the global tracing subscriber: `RUST_LOG` wins, then the config
/// section, then `info`. Call once, early.
pub fn init_tracing(logging: Option<&LoggingConfig>) {
    let fallback = logging
        .and_then(|l| l.filters.clone().or_else(|| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
