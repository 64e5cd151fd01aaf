/// Gateway API version in the websocket URL.
pub const GATEWAY_VERSION: u8 = 10;

/// Default gateway host used when the caller does not override it.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Gateway opcodes (client <-> control channel).
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Fixed delay (ms) before a fresh Identify after the session was invalidated.
pub const RECONNECT_DELAY_FRESH_MS: u64 = 500;

/// Timeout (ms) allowed for the WS write task to shut down gracefully.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;

/// Fallback heartbeat interval (ms) if Hello carries a nonsense value.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 41_250;
