use bitflags::bitflags;

bitflags! {
    /// Gateway intents bitmask sent in the Identify payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intents: u32 {
        const GUILDS = 1 << 0;
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_BANS = 1 << 2;
        const GUILD_EMOJIS_AND_STICKERS = 1 << 3;
        const GUILD_INTEGRATIONS = 1 << 4;
        const GUILD_WEBHOOKS = 1 << 5;
        const GUILD_INVITES = 1 << 6;
        const GUILD_VOICE_STATES = 1 << 7;
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const GUILD_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING = 1 << 14;
        const MESSAGE_CONTENT = 1 << 15;
        const GUILD_SCHEDULED_EVENTS = 1 << 16;
    }
}

impl Default for Intents {
    /// Everything except the privileged intents, which require an opt-in on
    /// the application and get the connection closed with 4014 otherwise.
    fn default() -> Self {
        Self::all() - Self::GUILD_MEMBERS - Self::GUILD_PRESENCES - Self::MESSAGE_CONTENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_excludes_privileged_bits() {
        let intents = Intents::default();
        assert!(intents.contains(Intents::GUILDS));
        assert!(intents.contains(Intents::GUILD_VOICE_STATES));
        assert!(!intents.contains(Intents::GUILD_MEMBERS));
        assert!(!intents.contains(Intents::GUILD_PRESENCES));
        assert!(!intents.contains(Intents::MESSAGE_CONTENT));
    }
}
