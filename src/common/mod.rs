pub mod backoff;
pub mod errors;
pub mod types;

pub use backoff::Backoff;
pub use errors::{ClientError, Result};
pub use types::{ChannelId, GuildId, SessionId, UserId};
