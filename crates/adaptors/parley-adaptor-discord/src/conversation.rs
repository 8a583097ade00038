//! Conversation orchestrator
//!
//! Decides when speech may be synthesized and pushes it through
//! synthesis, transcoding and playback.

use crate::connection::ConnectionManager;
use crate::playback::{FlagGuard, PlaybackController};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_core::{ParleyError, PlaybackError};
use parley_provider_voice::{SpeechSynthesizer, Transcoder};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Spoken when a conversation starts
pub const GREETING: &str = "¡Hola! Me he conectado al canal de voz. ¿En qué puedo ayudarte hoy?";

/// Whether speech is currently permitted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSession {
    /// Speech requests are accepted
    pub active: bool,
    /// When the conversation became active
    pub since: Option<DateTime<Utc>>,
}

/// What happened to a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Greeting played and the conversation is active
    Started,
    /// Nothing to do
    AlreadyActive,
    /// No ready voice connection
    NotConnected,
    /// Speech synthesis has no credentials
    TtsUnavailable,
    /// Another start is still greeting
    Busy,
    /// Greeting failed; conversation stays inactive
    Failed,
    /// Stopped or reset while the greeting was playing
    Cancelled,
}

#[derive(Debug, Default)]
struct ConversationState {
    session: ConversationSession,
    /// Bumped by every stop and reset
    epoch: u64,
}

/// Speech policy for the voice session
pub struct ConversationOrchestrator {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcoder: Transcoder,
    playback: PlaybackController,
    connections: Arc<ConnectionManager>,
    state: Mutex<ConversationState>,
    starting: AtomicBool,
}

impl ConversationOrchestrator {
    /// Create an orchestrator speaking through `playback`
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        connections: Arc<ConnectionManager>,
        playback: PlaybackController,
    ) -> Self {
        let transcoder = Transcoder::new(synthesizer.output_format());
        Self {
            synthesizer,
            transcoder,
            playback,
            connections,
            state: Mutex::new(ConversationState::default()),
            starting: AtomicBool::new(false),
        }
    }

    /// Whether the conversation is active
    pub fn is_active(&self) -> bool {
        self.state.lock().session.active
    }

    /// Snapshot of the conversation flag
    pub fn session(&self) -> ConversationSession {
        self.state.lock().session.clone()
    }

    /// Greet the channel and activate the conversation
    ///
    /// The conversation only becomes active once the greeting is playing on
    /// the same connection it started on, and only if nothing stopped it in
    /// the meantime. Failures are logged, never returned.
    pub async fn start_conversation(&self) -> StartOutcome {
        if self.is_active() {
            debug!("Conversation already active");
            return StartOutcome::AlreadyActive;
        }
        let Some(ready) = self.connections.ready_connection() else {
            warn!("Cannot start conversation: not connected to a voice channel");
            return StartOutcome::NotConnected;
        };
        if !self.synthesizer.is_configured() {
            warn!(
                engine = %self.synthesizer.name(),
                channel_id = %ready.channel_id,
                "Cannot start conversation: speech synthesis is not configured"
            );
            return StartOutcome::TtsUnavailable;
        }
        let Some(_starting) = FlagGuard::acquire(&self.starting) else {
            debug!("Conversation start already in progress");
            return StartOutcome::Busy;
        };
        let epoch = self.state.lock().epoch;

        if let Err(e) = self.say(GREETING).await {
            error!(channel_id = %ready.channel_id, error = %e, "Failed to start conversation");
            return StartOutcome::Failed;
        }

        let current = self.connections.ready_connection().map(|r| r.generation);
        if current != Some(ready.generation) {
            warn!(
                channel_id = %ready.channel_id,
                "Voice connection changed during greeting; conversation not started"
            );
            return StartOutcome::Failed;
        }

        let mut state = self.state.lock();
        if state.epoch != epoch {
            info!(channel_id = %ready.channel_id, "Conversation stopped during greeting");
            return StartOutcome::Cancelled;
        }
        state.session.active = true;
        state.session.since = Some(Utc::now());
        info!(channel_id = %ready.channel_id, "Conversation started");
        StartOutcome::Started
    }

    /// Speak `text` in the active conversation
    ///
    /// Nothing is synthesized unless the conversation is active and the
    /// connection is ready.
    pub async fn speak(&self, text: &str) -> Result<(), ParleyError> {
        if !self.is_active() {
            warn!("Speech requested while no conversation is active");
            return Err(ParleyError::ConversationInactive);
        }
        if !self.connections.is_connected() {
            warn!("Speech requested without a voice connection");
            return Err(PlaybackError::NotConnected.into());
        }

        self.say(text).await.map_err(|e| {
            warn!(error = %e, "Speech failed");
            e
        })
    }

    /// Deactivate the conversation; safe to repeat
    ///
    /// A start still greeting when this runs will not activate.
    pub fn stop_conversation(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        if !state.session.active {
            debug!("Conversation already stopped");
            return;
        }
        let since = state.session.since.take();
        state.session.active = false;
        info!(
            active_secs = since.map(|s| (Utc::now() - s).num_seconds()).unwrap_or(0),
            "Conversation stopped"
        );
    }

    /// Force the conversation inactive after the connection went away
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        if state.session.active {
            debug!("Conversation reset");
        }
        state.session = ConversationSession::default();
    }

    async fn say(&self, text: &str) -> Result<(), ParleyError> {
        let audio = self.synthesizer.synthesize(text).await?;
        let frames = self.transcoder.spawn(audio);
        self.playback.play(frames).await?;
        Ok(())
    }
}
