use serde::{Deserialize, Serialize};

use crate::common::{ClientError, Result};
use crate::gateway::Intents;
use crate::gateway::constants::DEFAULT_GATEWAY_URL;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientConfig {
    pub token: String,
    #[serde(default = "default_intents")]
    pub intents: u32,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Requests zlib-stream transport compression from the gateway.
    #[serde(default)]
    pub compress: bool,
    /// `(shard_id, shard_count)` sent in Identify.
    #[serde(default = "default_shard")]
    pub shard: (u32, u32),
    #[serde(default)]
    pub properties: ClientProperties,
    #[serde(default)]
    pub voice: VoiceConfig,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoiceConfig {
    /// Passed through to the transcoder; the transport itself is raw PCM.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Deadline for the paired voice state/server events after a join.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
    /// Transcoder binary; anything speaking the same CLI works.
    #[serde(default = "default_transcoder")]
    pub transcoder: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub filters: Option<String>,
}

fn default_intents() -> u32 {
    Intents::default().bits()
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_shard() -> (u32, u32) {
    (0, 1)
}

fn default_bitrate() -> u32 {
    64_000
}

fn default_join_timeout() -> u64 {
    10
}

fn default_transcoder() -> String {
    "ffmpeg".to_string()
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            join_timeout_secs: default_join_timeout(),
            transcoder: default_transcoder(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: default_intents(),
            gateway_url: default_gateway_url(),
            compress: false,
            shard: default_shard(),
            properties: ClientProperties::default(),
            voice: VoiceConfig::default(),
            logging: None,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        if config_str.is_empty() {
            return Err(ClientError::Config(format!("{path} is empty")));
        }
        let config: ClientConfig = toml::from_str(&config_str)
            .map_err(|e| ClientError::Config(format!("{path}: {e}")))?;
        if config.token.is_empty() {
            return Err(ClientError::Config("token must be set".into()));
        }
        if config.shard.1 == 0 || config.shard.0 >= config.shard.1 {
            return Err(ClientError::Config(format!(
                "shard {}/{} is out of range",
                config.shard.0, config.shard.1
            )));
        }
        Ok(config)
    }
}
