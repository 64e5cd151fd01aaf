pub mod constants;
pub mod pipeline;
pub mod transcoder;

pub use pipeline::AudioPipeline;
pub use transcoder::{TranscodeInput, Transcoder};
