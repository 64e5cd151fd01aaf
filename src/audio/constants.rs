/// PCM format the transcoder is asked to emit: 48 kHz, stereo, 16-bit LE.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;

/// One 20 ms frame of that format: 48_000 * 0.02 * 2 channels * 2 bytes.
pub const FRAME_SIZE: usize = 3840;

pub const FRAME_DURATION_MS: u64 = 20;

/// Frames buffered between the transcoder reader and the send loop. Enough
/// to ride out transcoder stalls without letting a fast transcoder run far
/// ahead of the 20 ms pacing.
pub const FRAME_CHANNEL_CAPACITY: usize = 16;
