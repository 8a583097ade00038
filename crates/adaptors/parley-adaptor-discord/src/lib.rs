//! Discord adaptor for Parley
//!
//! Connects a serenity gateway client to the voice companion: voice-state
//! updates and chat messages are forwarded, in arrival order, to a single
//! [`VoiceCompanion`], which joins and leaves the target voice channel and
//! speaks through songbird.

#![warn(clippy::all)]

use parley_core::{
    get_env_bool, get_env_id, get_env_int, get_optional_env, get_required_env, MessageEvent,
    ParleyError, PresenceEvent, Result, TargetDescriptor,
};
use parley_provider_voice::SpeechSynthesizer;
use serenity::all::{
    Channel, ChannelType, Client, Context, EventHandler, GatewayIntents, Message, Ready,
    VoiceState,
};
use serenity::async_trait as serenity_async_trait;
use songbird::serenity::SerenityInit;
use songbird::Songbird;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub mod companion;
pub mod connection;
pub mod conversation;
pub mod playback;
pub mod session;
pub mod transport;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use companion::{GatewayEvent, VoiceCompanion};
pub use connection::{ConnectionManager, ConnectionStatus, ReadyConnection};
pub use conversation::{ConversationOrchestrator, ConversationSession, StartOutcome, GREETING};
pub use playback::PlaybackController;
pub use session::{Effect, SessionMachine, SessionState, Transition};
pub use transport::{LinkStatus, PlayerStatus, SongbirdGateway, VoiceGateway, VoiceLink};
pub use webhook::{RelayPayload, WebhookRelay};

/// Gateway events waiting for the companion
const EVENT_BUFFER: usize = 64;

/// Voice session settings
#[derive(Debug, Clone)]
pub struct VoiceTargetConfig {
    /// Channel to follow and optional participant to follow into it
    pub target: TargetDescriptor,
    /// Greet automatically after every automatic join
    pub auto_greet: bool,
    /// Delay before the automatic greeting
    pub auto_greet_delay: Duration,
    /// Limit for a new connection to become ready
    pub ready_timeout: Duration,
    /// Limit for playback to start
    pub start_timeout: Duration,
}

impl VoiceTargetConfig {
    /// Settings for `target` with default timings
    pub fn new(target: TargetDescriptor) -> Self {
        Self {
            target,
            auto_greet: false,
            auto_greet_delay: Duration::from_millis(2000),
            ready_timeout: connection::DEFAULT_READY_TIMEOUT,
            start_timeout: playback::DEFAULT_START_TIMEOUT,
        }
    }

    /// Read the voice settings; `None` when no target channel is configured
    pub fn from_env() -> Result<Option<Self>> {
        let Some(channel_id) = get_env_id("DISCORD_VOICE_CHANNEL_ID")? else {
            warn!("DISCORD_VOICE_CHANNEL_ID not set; voice features disabled");
            return Ok(None);
        };

        let mut target = TargetDescriptor::new(channel_id);
        match get_env_id("DISCORD_USER_ID")? {
            Some(user_id) => target = target.with_participant(user_id),
            None => info!("DISCORD_USER_ID not set; any member joining the channel triggers voice"),
        }

        let mut config = Self::new(target);
        config.auto_greet = get_env_bool("DISCORD_AUTO_GREET", false);
        config.auto_greet_delay =
            Duration::from_millis(get_env_int("DISCORD_AUTO_GREET_DELAY_MS", 2000u64));
        Ok(Some(config))
    }
}

/// Discord adaptor settings
#[derive(Clone)]
pub struct DiscordConfig {
    /// Bot token
    pub token: String,
    /// Gateway intents
    pub intents: GatewayIntents,
    /// Voice settings; `None` disables voice
    pub voice: Option<VoiceTargetConfig>,
    /// Chat relay target
    pub webhook_url: Option<String>,
}

impl DiscordConfig {
    /// Settings for `token` with voice and relay disabled
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            intents: GatewayIntents::GUILDS
                | GatewayIntents::GUILD_MESSAGES
                | GatewayIntents::MESSAGE_CONTENT
                | GatewayIntents::GUILD_VOICE_STATES,
            voice: None,
            webhook_url: None,
        }
    }

    /// Read every setting from the environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(get_required_env("DISCORD_TOKEN")?);
        config.voice = VoiceTargetConfig::from_env()?;
        config.webhook_url = get_optional_env("WEBHOOK_URL");
        Ok(config)
    }
}

/// Wire up the companion for `voice` on top of `gateway`
pub fn build_companion(
    voice: &VoiceTargetConfig,
    gateway: Arc<dyn VoiceGateway>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
) -> Arc<VoiceCompanion> {
    let connections =
        Arc::new(ConnectionManager::new(gateway).with_ready_timeout(voice.ready_timeout));
    let playback =
        PlaybackController::new(connections.clone()).with_start_timeout(voice.start_timeout);
    let conversation = Arc::new(ConversationOrchestrator::new(
        synthesizer,
        connections.clone(),
        playback,
    ));

    let mut companion = VoiceCompanion::new(voice.target.clone(), connections, conversation);
    if voice.auto_greet {
        companion = companion.with_auto_greet(voice.auto_greet_delay);
    }
    Arc::new(companion)
}

struct Handler {
    bot_id: OnceLock<u64>,
    events: Option<mpsc::Sender<GatewayEvent>>,
    relay: Option<WebhookRelay>,
}

impl Handler {
    async fn forward(&self, event: GatewayEvent) {
        if let Some(events) = &self.events {
            if events.send(event).await.is_err() {
                warn!("Voice companion stopped; dropping gateway event");
            }
        }
    }

    fn presence_event(&self, old: Option<&VoiceState>, new: &VoiceState) -> Option<PresenceEvent> {
        let guild_id = new.guild_id.or_else(|| old.and_then(|o| o.guild_id))?;
        let participant_id = new.user_id.get();
        Some(PresenceEvent {
            guild_id: guild_id.get(),
            participant_id,
            previous_channel: old.and_then(|o| o.channel_id).map(|c| c.get()),
            new_channel: new.channel_id.map(|c| c.get()),
            is_self: self.bot_id.get() == Some(&participant_id),
            is_bot: new.member.as_ref().map(|m| m.user.bot).unwrap_or(false),
        })
    }

    fn relay_payload(ctx: &Context, msg: &Message, channel_name: Option<String>) -> RelayPayload {
        use webhook::{RelayAttachment, RelayAuthor, RelayPlace};

        RelayPayload {
            content: (!msg.content.is_empty()).then(|| msg.content.clone()),
            attachments: msg
                .attachments
                .iter()
                .map(|a| RelayAttachment {
                    url: a.url.clone(),
                    proxy_url: a.proxy_url.clone(),
                    size: u64::from(a.size),
                    content_type: a.content_type.clone(),
                })
                .collect(),
            author: RelayAuthor {
                id: msg.author.id.to_string(),
                bot: msg.author.bot,
                username: msg.author.name.clone(),
                global_name: msg.author.global_name.clone(),
                discriminator: msg.author.discriminator.map(|d| format!("{:04}", d.get())),
            },
            channel: RelayPlace {
                id: msg.channel_id.to_string(),
                name: channel_name,
            },
            guild: RelayPlace {
                id: msg.guild_id.map(|g| g.to_string()).unwrap_or_default(),
                name: msg.guild_id.and_then(|g| g.name(&ctx.cache)),
            },
            timestamp: msg.timestamp.to_string(),
        }
    }
}

#[serenity_async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        let _ = self.bot_id.set(ready.user.id.get());
        info!(
            user = %ready.user.name,
            guilds_count = %ready.guilds.len(),
            "Bot connected"
        );
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(event) = self.presence_event(old.as_ref(), &new) else {
            return;
        };
        debug!(
            guild_id = %event.guild_id,
            user_id = %event.participant_id,
            previous = ?event.previous_channel,
            new = ?event.new_channel,
            "Voice state update"
        );
        self.forward(GatewayEvent::Presence(event)).await;
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let guild_channel = match msg.guild_id {
            Some(_) => match msg.channel(&ctx).await {
                Ok(Channel::Guild(channel)) => Some(channel),
                Ok(_) => None,
                Err(e) => {
                    debug!(
                        channel_id = %msg.channel_id,
                        error = %e,
                        "Could not resolve message channel"
                    );
                    None
                }
            },
            None => None,
        };
        let in_guild_text = guild_channel
            .as_ref()
            .is_some_and(|c| c.kind == ChannelType::Text);

        if let Some(relay) = &self.relay {
            if !msg.author.bot && msg.guild_id.is_some() {
                let payload =
                    Self::relay_payload(&ctx, &msg, guild_channel.as_ref().map(|c| c.name.clone()));
                let relay = relay.clone();
                tokio::spawn(async move {
                    if let Err(e) = relay.relay(&payload).await {
                        warn!(channel_id = %payload.channel.id, error = %e, "Webhook relay failed");
                    }
                });
            }
        }

        self.forward(GatewayEvent::Message(MessageEvent {
            text: msg.content.clone(),
            author_id: msg.author.id.get(),
            author_name: msg.author.name.clone(),
            is_bot: msg.author.bot,
            in_guild_text,
        }))
        .await;
    }
}

/// Run the Discord client until it stops
pub async fn start_discord(
    config: DiscordConfig,
    synthesizer: Arc<dyn SpeechSynthesizer>,
) -> Result<()> {
    let songbird = Songbird::serenity();

    if !synthesizer.is_configured() {
        warn!(
            engine = %synthesizer.name(),
            "Speech synthesis not configured; conversations cannot start"
        );
    }

    let events = config.voice.as_ref().map(|voice| {
        let gateway = Arc::new(SongbirdGateway::new(songbird.clone()));
        let companion = build_companion(voice, gateway, synthesizer.clone());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(companion.run(rx));
        info!(
            channel_id = %voice.target.channel_id,
            user_id = ?voice.target.participant_id,
            auto_greet = voice.auto_greet,
            "Voice companion enabled"
        );
        tx
    });

    let relay = config.webhook_url.clone().map(WebhookRelay::new);
    if relay.is_some() {
        info!("Relaying guild messages to webhook");
    }

    let handler = Handler {
        bot_id: OnceLock::new(),
        events,
        relay,
    };

    let mut client = Client::builder(&config.token, config.intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await
        .map_err(|e| ParleyError::gateway(format!("Failed to create Discord client: {}", e)))?;

    info!("Discord adapter started");
    client.start().await.map_err(|e| {
        error!(error = %e, "Discord client error");
        ParleyError::gateway(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, FakeGateway, FakeSynthesizer, LinkBehavior};

    #[test]
    fn test_default_intents() {
        let config = DiscordConfig::new("token");
        assert!(config.intents.contains(GatewayIntents::GUILD_VOICE_STATES));
        assert!(config.intents.contains(GatewayIntents::MESSAGE_CONTENT));
        assert!(config.voice.is_none());
    }

    #[test]
    fn test_voice_defaults() {
        let voice = VoiceTargetConfig::new(TargetDescriptor::new(5));
        assert!(!voice.auto_greet);
        assert_eq!(voice.auto_greet_delay, Duration::from_millis(2000));
        assert_eq!(voice.ready_timeout, Duration::from_secs(30));
        assert_eq!(voice.start_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_voice_from_env() {
        std::env::set_var("DISCORD_VOICE_CHANNEL_ID", "123");
        std::env::set_var("DISCORD_USER_ID", "456");
        std::env::set_var("DISCORD_AUTO_GREET", "true");
        std::env::set_var("DISCORD_AUTO_GREET_DELAY_MS", "500");

        let voice = VoiceTargetConfig::from_env().unwrap().unwrap();
        assert_eq!(voice.target.channel_id, 123);
        assert_eq!(voice.target.participant_id, Some(456));
        assert!(voice.auto_greet);
        assert_eq!(voice.auto_greet_delay, Duration::from_millis(500));

        std::env::set_var("DISCORD_USER_ID", "not-a-number");
        assert!(VoiceTargetConfig::from_env().is_err());

        std::env::remove_var("DISCORD_VOICE_CHANNEL_ID");
        std::env::remove_var("DISCORD_USER_ID");
        assert!(VoiceTargetConfig::from_env().unwrap().is_none());

        std::env::remove_var("DISCORD_AUTO_GREET");
        std::env::remove_var("DISCORD_AUTO_GREET_DELAY_MS");
    }

    #[test]
    fn test_presence_from_voice_states() {
        let handler = Handler {
            bot_id: OnceLock::new(),
            events: None,
            relay: None,
        };
        let _ = handler.bot_id.set(99);

        let state = |user: u64, channel: Option<u64>| -> VoiceState {
            serde_json::from_value(serde_json::json!({
                "guild_id": "1",
                "channel_id": channel.map(|c| c.to_string()),
                "user_id": user.to_string(),
                "session_id": "abc",
                "deaf": false,
                "mute": false,
                "self_deaf": false,
                "self_mute": false,
                "self_video": false,
                "suppress": false,
                "request_to_speak_timestamp": null
            }))
            .unwrap()
        };

        let old = state(7, Some(100));
        let new = state(7, None);
        let event = handler.presence_event(Some(&old), &new).unwrap();
        assert_eq!(event.guild_id, 1);
        assert_eq!(event.previous_channel, Some(100));
        assert_eq!(event.new_channel, None);
        assert!(!event.is_self);

        let own = handler.presence_event(None, &state(99, Some(100))).unwrap();
        assert!(own.is_self);
    }

    #[tokio::test]
    async fn test_build_companion_follows_target() {
        let gateway = FakeGateway::new(LinkBehavior::Ready);
        let voice = VoiceTargetConfig::new(TargetDescriptor::new(100).with_participant(7));
        let companion = build_companion(&voice, gateway.clone(), FakeSynthesizer::new(true));

        companion
            .handle_presence(&PresenceEvent {
                guild_id: 1,
                participant_id: 7,
                previous_channel: None,
                new_channel: Some(100),
                is_self: false,
                is_bot: false,
            })
            .await;
        eventually(|| companion.state() == SessionState::ConnectedWaiting).await;
        assert_eq!(gateway.requests(), 1);
    }
}
