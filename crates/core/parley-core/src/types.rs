//! Shared domain types: who we watch, and what the gateway tells us

use serde::{Deserialize, Serialize};

/// The voice channel we follow and, optionally, the one user whose presence
/// triggers us. Built once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Voice channel to auto-join
    pub channel_id: u64,
    /// Only this user's presence counts; `None` means any human user
    pub participant_id: Option<u64>,
}

impl TargetDescriptor {
    /// Create a target for a channel, triggered by any user
    pub fn new(channel_id: u64) -> Self {
        Self {
            channel_id,
            participant_id: None,
        }
    }

    /// Restrict the trigger to one participant
    pub fn with_participant(mut self, participant_id: u64) -> Self {
        self.participant_id = Some(participant_id);
        self
    }

    /// Whether a participant's presence should drive the session
    pub fn matches_participant(&self, participant_id: u64, is_bot: bool) -> bool {
        match self.participant_id {
            Some(target) => target == participant_id,
            None => !is_bot,
        }
    }
}

/// A participant's voice-channel membership changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    /// Guild the channels belong to
    pub guild_id: u64,
    /// Participant whose presence changed
    pub participant_id: u64,
    /// Channel before the change (`None` = not in voice)
    pub previous_channel: Option<u64>,
    /// Channel after the change (`None` = left voice)
    pub new_channel: Option<u64>,
    /// The participant is this bot
    pub is_self: bool,
    /// The participant is any bot account
    pub is_bot: bool,
}

impl PresenceEvent {
    /// Participant arrived in `channel_id` from elsewhere (or from nowhere)
    pub fn entered(&self, channel_id: u64) -> bool {
        self.new_channel == Some(channel_id) && self.previous_channel != Some(channel_id)
    }

    /// Participant was in `channel_id` and is now somewhere else (or nowhere)
    pub fn departed(&self, channel_id: u64) -> bool {
        self.previous_channel == Some(channel_id) && self.new_channel != Some(channel_id)
    }
}

/// A chat message seen by the bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Message text
    pub text: String,
    /// Author id
    pub author_id: u64,
    /// Author display name, for logs
    pub author_name: String,
    /// Author is a bot account
    pub is_bot: bool,
    /// Sent in a guild text channel (not a DM, thread or voice chat)
    pub in_guild_text: bool,
}

/// Text commands recognised in chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    /// `!start`
    Start,
    /// `!stop`
    Stop,
}

impl ChatCommand {
    /// Parse a whole message as a command: case-insensitive, exact match
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_lowercase().as_str() {
            "!start" => Some(Self::Start),
            "!stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(previous: Option<u64>, new: Option<u64>) -> PresenceEvent {
        PresenceEvent {
            guild_id: 1,
            participant_id: 7,
            previous_channel: previous,
            new_channel: new,
            is_self: false,
            is_bot: false,
        }
    }

    #[test]
    fn test_entered_and_departed() {
        assert!(presence(None, Some(10)).entered(10));
        assert!(presence(Some(20), Some(10)).entered(10));
        assert!(!presence(Some(10), Some(10)).entered(10));

        assert!(presence(Some(10), None).departed(10));
        assert!(presence(Some(10), Some(20)).departed(10));
        assert!(!presence(Some(20), None).departed(10));
    }

    #[test]
    fn test_participant_filter() {
        let any = TargetDescriptor::new(10);
        assert!(any.matches_participant(7, false));
        assert!(!any.matches_participant(7, true));

        let only = TargetDescriptor::new(10).with_participant(7);
        assert!(only.matches_participant(7, false));
        assert!(!only.matches_participant(8, false));
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(ChatCommand::parse("!start"), Some(ChatCommand::Start));
        assert_eq!(ChatCommand::parse("!STOP"), Some(ChatCommand::Stop));
        assert_eq!(ChatCommand::parse("!start now"), None);
        assert_eq!(ChatCommand::parse(" !start"), None);
        assert_eq!(ChatCommand::parse("start"), None);
    }
}
