/// Voice gateway version in the websocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Voice gateway opcodes (separate numbering from the control gateway).
pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
}

/// The one transport encryption mode this crate speaks.
pub const ENCRYPTION_MODE: &str = "xsalsa20_poly1305";

/// IP discovery datagram size (type + length + ssrc + padded address block).
pub const DISCOVERY_PACKET_SIZE: usize = 70;

pub const IP_DISCOVERY_TIMEOUT_SECS: u64 = 2;

/// First byte of the RTP header: version 2, no padding/extension/CSRC.
pub const RTP_VERSION_BYTE: u8 = 0x80;

/// RTP payload type used for voice frames.
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;

/// Timestamp advance per 20 ms frame at 48 kHz.
pub const RTP_TIMESTAMP_STEP: u32 = 960;

/// Transport-level silence frame, sent a few times before un-keying the
/// speaking indicator so receiver-side interpolation drains cleanly.
pub const SILENCE_FRAME: &[u8] = &[0xF8, 0xFF, 0xFE];
pub const SILENCE_FRAME_COUNT: usize = 5;

/// Fallback heartbeat interval (ms) if Hello carries a nonsense value.
pub const DEFAULT_VOICE_HEARTBEAT_MS: u64 = 30_000;

/// Reconnect attempts before a voice session gives up.
pub const MAX_VOICE_RECONNECT_ATTEMPTS: u32 = 5;

/// Timeout (ms) allowed for the WS write task to shut down gracefully.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;
