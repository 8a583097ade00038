//! The voice companion
//!
//! One object owns the session: it feeds gateway events to the state
//! machine in arrival order and carries out the resulting effects against
//! the connection manager and the conversation orchestrator.

use crate::connection::{ConnectionManager, ReadyConnection};
use crate::conversation::{ConversationOrchestrator, StartOutcome};
use crate::session::{Effect, SessionMachine, SessionState, Transition};
use parking_lot::Mutex;
use parley_core::{ConnectError, MessageEvent, ParleyError, PresenceEvent, TargetDescriptor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Events forwarded from the chat gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Voice-state change
    Presence(PresenceEvent),
    /// Chat message
    Message(MessageEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug)]
struct PhaseState {
    phase: Phase,
    /// Bumped whenever a join starts or the session returns to idle
    epoch: u64,
}

/// Presence-triggered voice session manager
pub struct VoiceCompanion {
    machine: SessionMachine,
    connections: Arc<ConnectionManager>,
    conversation: Arc<ConversationOrchestrator>,
    phase: Mutex<PhaseState>,
    auto_greet: Option<Duration>,
}

impl VoiceCompanion {
    /// Create a companion for `target`
    pub fn new(
        target: TargetDescriptor,
        connections: Arc<ConnectionManager>,
        conversation: Arc<ConversationOrchestrator>,
    ) -> Self {
        Self {
            machine: SessionMachine::new(target),
            connections,
            conversation,
            phase: Mutex::new(PhaseState {
                phase: Phase::Idle,
                epoch: 0,
            }),
            auto_greet: None,
        }
    }

    /// Start a conversation `delay` after every automatic join
    pub fn with_auto_greet(mut self, delay: Duration) -> Self {
        self.auto_greet = Some(delay);
        self
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        let phase = self.phase.lock().phase;
        match phase {
            Phase::Idle => SessionState::Idle,
            Phase::Connecting => SessionState::Connecting,
            Phase::Connected if self.conversation.is_active() => SessionState::ConnectedActive,
            Phase::Connected => SessionState::ConnectedWaiting,
        }
    }

    /// The conversation orchestrator
    pub fn conversation(&self) -> &Arc<ConversationOrchestrator> {
        &self.conversation
    }

    /// Speak in the active conversation
    pub async fn speak(&self, text: &str) -> Result<(), ParleyError> {
        self.conversation.speak(text).await
    }

    /// Consume gateway events until the sender side closes
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<GatewayEvent>) {
        info!(channel_id = %self.machine.target().channel_id, "Voice companion listening");
        while let Some(event) = events.recv().await {
            match event {
                GatewayEvent::Presence(presence) => self.handle_presence(&presence).await,
                GatewayEvent::Message(message) => self.handle_message(&message).await,
            }
        }
        debug!("Gateway event stream closed");
    }

    /// Apply one voice-state change
    pub async fn handle_presence(self: &Arc<Self>, event: &PresenceEvent) {
        if event.is_self {
            debug!(
                guild_id = %event.guild_id,
                previous = ?event.previous_channel,
                new = ?event.new_channel,
                "Own voice state changed"
            );
        }
        self.reconcile();
        let transition = self.machine.on_presence(self.state(), event);
        self.apply(transition, Some(event.participant_id)).await;
    }

    /// Apply one chat message
    pub async fn handle_message(self: &Arc<Self>, event: &MessageEvent) {
        let transition = self.machine.on_message(self.state(), event);
        self.apply(transition, Some(event.author_id)).await;
    }

    /// Drop a connected phase whose transport has gone away
    fn reconcile(&self) {
        let lost = {
            let mut phase = self.phase.lock();
            if phase.phase == Phase::Connected && !self.connections.is_connected() {
                phase.phase = Phase::Idle;
                phase.epoch += 1;
                true
            } else {
                false
            }
        };
        if lost {
            info!("Voice connection was lost; session reset to idle");
            self.conversation.reset();
        }
    }

    /// Move to the phase for `next`; returns the epoch after the move
    fn enter(&self, next: SessionState) -> u64 {
        let target = match next {
            SessionState::Idle => Phase::Idle,
            SessionState::Connecting => Phase::Connecting,
            SessionState::ConnectedWaiting | SessionState::ConnectedActive => Phase::Connected,
        };
        let mut phase = self.phase.lock();
        if phase.phase != target {
            if target != Phase::Connected {
                phase.epoch += 1;
            }
            phase.phase = target;
        }
        phase.epoch
    }

    async fn apply(self: &Arc<Self>, transition: Transition, participant_id: Option<u64>) {
        let epoch = self.enter(transition.next);
        for effect in transition.effects {
            match effect {
                Effect::Join {
                    guild_id,
                    channel_id,
                } => self.start_join(epoch, guild_id, channel_id),
                Effect::Leave => self.leave().await,
                Effect::StartConversation => {
                    let conversation = self.conversation.clone();
                    tokio::spawn(async move {
                        conversation.start_conversation().await;
                    });
                }
                Effect::StopConversation => self.conversation.stop_conversation(),
                Effect::Reject(reason) => {
                    warn!(participant_id = ?participant_id, reason, "Command rejected")
                }
                Effect::Ignore(reason) => {
                    debug!(participant_id = ?participant_id, reason, "Event ignored")
                }
            }
        }
    }

    fn start_join(self: &Arc<Self>, epoch: u64, guild_id: u64, channel_id: u64) {
        info!(guild_id = %guild_id, channel_id = %channel_id, "Target joined; connecting to voice");
        let pending = self.connections.begin_join(guild_id, channel_id);
        let companion = Arc::clone(self);
        tokio::spawn(async move {
            let result = pending.wait().await;
            companion.finish_join(epoch, result);
        });
    }

    fn finish_join(self: &Arc<Self>, epoch: u64, result: Result<ReadyConnection, ConnectError>) {
        let current = {
            let mut phase = self.phase.lock();
            let current = phase.epoch == epoch && phase.phase == Phase::Connecting;
            if current {
                let state = self
                    .machine
                    .on_join_finished(SessionState::Connecting, result.is_ok());
                phase.phase = match state {
                    SessionState::Idle => Phase::Idle,
                    _ => Phase::Connected,
                };
                if phase.phase == Phase::Idle {
                    phase.epoch += 1;
                }
            }
            current
        };

        match result {
            Ok(ready) if current => {
                info!(
                    guild_id = %ready.guild_id,
                    channel_id = %ready.channel_id,
                    "Joined voice channel"
                );
                if let Some(delay) = self.auto_greet {
                    self.schedule_greeting(epoch, delay);
                }
            }
            Ok(ready) => {
                debug!(channel_id = %ready.channel_id, "Join completed for a superseded session")
            }
            Err(e) if current => error!(
                channel_id = %self.machine.target().channel_id,
                participant_id = ?self.machine.target().participant_id,
                error = %e,
                "Failed to join voice channel"
            ),
            Err(e) => debug!(error = %e, "Superseded join ended"),
        }
    }

    fn schedule_greeting(self: &Arc<Self>, epoch: u64, delay: Duration) {
        let companion = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_joined = {
                let phase = companion.phase.lock();
                phase.epoch == epoch && phase.phase == Phase::Connected
            };
            if !still_joined {
                debug!("Session changed before the automatic greeting");
                return;
            }
            if companion.conversation.start_conversation().await == StartOutcome::Started {
                info!("Automatic greeting played");
            }
        });
    }

    async fn leave(&self) {
        self.conversation.reset();
        self.connections.leave().await;
        info!(channel_id = %self.machine.target().channel_id, "Left voice channel");
    }
}
