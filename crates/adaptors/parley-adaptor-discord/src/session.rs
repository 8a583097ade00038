//! Session state machine
//!
//! Pure reconciliation of gateway events into effects. Nothing here
//! suspends or touches the network; [`crate::companion::VoiceCompanion`]
//! carries out the effects.

use parley_core::{ChatCommand, MessageEvent, PresenceEvent, TargetDescriptor};

/// Where the companion is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not in voice
    Idle,
    /// Join requested
    Connecting,
    /// In the channel, conversation not started
    ConnectedWaiting,
    /// In the channel, speech allowed
    ConnectedActive,
}

impl SessionState {
    /// In voice, with or without a conversation
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::ConnectedWaiting | Self::ConnectedActive)
    }
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Join the target channel
    Join {
        /// Guild of the channel
        guild_id: u64,
        /// Channel to join
        channel_id: u64,
    },
    /// Leave voice and end any conversation
    Leave,
    /// Greet and activate the conversation
    StartConversation,
    /// Deactivate the conversation
    StopConversation,
    /// A user command that cannot be honoured right now
    Reject(&'static str),
    /// Event has no bearing on the session
    Ignore(&'static str),
}

/// Result of feeding one event to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the event
    pub next: SessionState,
    /// Effects to carry out, in order
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: SessionState, effect: Effect) -> Self {
        Self {
            next,
            effects: vec![effect],
        }
    }

    fn stay(state: SessionState, effect: Effect) -> Self {
        Self::to(state, effect)
    }
}

/// Reconciles presence and chat events against the current state
#[derive(Debug, Clone)]
pub struct SessionMachine {
    target: TargetDescriptor,
}

impl SessionMachine {
    /// Create a machine for `target`
    pub fn new(target: TargetDescriptor) -> Self {
        Self { target }
    }

    /// The configured target
    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// A participant's voice state changed
    pub fn on_presence(&self, state: SessionState, event: &PresenceEvent) -> Transition {
        if event.is_self {
            return Transition::stay(state, Effect::Ignore("own voice state"));
        }
        if !self
            .target
            .matches_participant(event.participant_id, event.is_bot)
        {
            return Transition::stay(state, Effect::Ignore("not the target participant"));
        }

        let channel_id = self.target.channel_id;
        if event.entered(channel_id) {
            return match state {
                SessionState::Idle => Transition::to(
                    SessionState::Connecting,
                    Effect::Join {
                        guild_id: event.guild_id,
                        channel_id,
                    },
                ),
                _ => Transition::stay(state, Effect::Ignore("already connected or connecting")),
            };
        }
        if event.departed(channel_id) {
            return match state {
                SessionState::Idle => Transition::stay(state, Effect::Ignore("not connected")),
                _ => Transition::to(SessionState::Idle, Effect::Leave),
            };
        }
        Transition::stay(state, Effect::Ignore("unrelated channel"))
    }

    /// A chat message arrived
    pub fn on_message(&self, state: SessionState, event: &MessageEvent) -> Transition {
        if event.is_bot {
            return Transition::stay(state, Effect::Ignore("bot author"));
        }
        if !event.in_guild_text {
            return Transition::stay(state, Effect::Ignore("not a guild text channel"));
        }

        match ChatCommand::parse(&event.text) {
            Some(ChatCommand::Start) => match state {
                SessionState::ConnectedWaiting => {
                    Transition::stay(state, Effect::StartConversation)
                }
                SessionState::ConnectedActive => {
                    Transition::stay(state, Effect::Ignore("conversation already active"))
                }
                SessionState::Idle | SessionState::Connecting => {
                    Transition::stay(state, Effect::Reject("not connected to a voice channel"))
                }
            },
            // While waiting, a greeting may still be in flight; the stop
            // cancels it and is a no-op otherwise
            Some(ChatCommand::Stop) => match state {
                SessionState::ConnectedActive | SessionState::ConnectedWaiting => Transition::to(
                    SessionState::ConnectedWaiting,
                    Effect::StopConversation,
                ),
                SessionState::Idle | SessionState::Connecting => {
                    Transition::stay(state, Effect::Ignore("conversation not active"))
                }
            },
            None => Transition::stay(state, Effect::Ignore("not a command")),
        }
    }

    /// The join started by [`Effect::Join`] finished
    pub fn on_join_finished(&self, state: SessionState, succeeded: bool) -> SessionState {
        match (state, succeeded) {
            (SessionState::Connecting, true) => SessionState::ConnectedWaiting,
            (SessionState::Connecting, false) => SessionState::Idle,
            (other, _) => other,
        }
    }
}
