//! Realtime client for the Discord gateway and voice stack: a resumable
//! control websocket with heartbeating and dispatch routing, per-guild
//! voice transports (websocket negotiation, UDP discovery, encrypted RTP),
//! and an audio pipeline fed by an external transcoder process.

pub mod audio;
pub mod cache;
pub mod client;
pub mod common;
pub mod config;
pub mod gateway;
pub mod rest;
pub mod router;
pub mod voice;

pub use audio::{AudioPipeline, TranscodeInput};
pub use cache::TtlCache;
pub use client::{Client, init_tracing};
pub use common::{Backoff, ChannelId, ClientError, GuildId, Result, SessionId, UserId};
pub use config::ClientConfig;
pub use gateway::{GatewayConnection, GatewayHandle, Intents, Session, WaitRegistry};
pub use rest::RestClient;
pub use router::{ChannelRouter, DispatchEvent, DispatchRouter};
pub use voice::VoiceSession;
