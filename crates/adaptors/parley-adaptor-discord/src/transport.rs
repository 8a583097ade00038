//! Voice transport
//!
//! The session logic only ever talks to [`VoiceGateway`] and [`VoiceLink`].
//! [`SongbirdGateway`] is the production implementation on top of the
//! songbird driver registered with the serenity client.

use async_trait::async_trait;
use parley_core::{ConnectError, PlaybackError};
use parley_provider_voice::transcode::{FrameStream, CHANNELS, SAMPLE_RATE};
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::{Input, RawAdapter};
use songbird::tracks::{PlayMode, ReadyState, TrackState};
use songbird::{
    Call, CoreEvent, Event, EventContext, EventHandler as SongbirdEventHandler, Songbird,
    TrackEvent,
};
use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroU64;
use std::sync::Arc;
use symphonia::core::io::MediaSource;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Connection state reported by a transport link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Handshake in progress
    Connecting,
    /// Audio can be sent
    Ready,
    /// Link is gone (left, kicked, or failed)
    Disconnected,
}

/// Player state for one submitted frame stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerStatus {
    /// Submitted, no audio out yet
    Buffering,
    /// Audio is going out
    Playing,
    /// Played to the end (or stopped)
    Finished,
    /// The transport gave up on the resource
    Errored(String),
}

/// Creates transport links to voice channels
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Ask the chat gateway to put the bot in `channel_id`
    ///
    /// Returns as soon as the request is issued; readiness is reported
    /// through [`VoiceLink::status`]. `generation` grows with every request
    /// from the same caller, and a request never displaces the link of a
    /// newer one.
    async fn request_join(
        &self,
        generation: u64,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Arc<dyn VoiceLink>, ConnectError>;
}

/// One live transport session
#[async_trait]
pub trait VoiceLink: Send + Sync {
    /// Watch the connection state
    fn status(&self) -> watch::Receiver<LinkStatus>;

    /// Replace whatever is playing with `frames`
    async fn play(
        &self,
        frames: FrameStream,
    ) -> Result<watch::Receiver<PlayerStatus>, PlaybackError>;

    /// Tear the session down
    async fn destroy(&self);
}

/// Which request generation owns each guild's voice call
///
/// The driver keeps a single call per guild, so every link for a guild
/// shares it. Only the owner may tear the call down.
#[derive(Debug, Default)]
pub(crate) struct GuildLeases {
    owners: parking_lot::Mutex<HashMap<u64, u64>>,
}

impl GuildLeases {
    /// Take the guild for `generation`; `false` if a newer one holds it
    pub(crate) fn claim(&self, guild_id: u64, generation: u64) -> bool {
        let mut owners = self.owners.lock();
        match owners.get(&guild_id) {
            Some(&owner) if owner > generation => false,
            _ => {
                owners.insert(guild_id, generation);
                true
            }
        }
    }

    pub(crate) fn is_current(&self, guild_id: u64, generation: u64) -> bool {
        self.owners.lock().get(&guild_id) == Some(&generation)
    }

    /// Give the guild up; `true` if `generation` still owned it
    pub(crate) fn release(&self, guild_id: u64, generation: u64) -> bool {
        let mut owners = self.owners.lock();
        if owners.get(&guild_id) == Some(&generation) {
            owners.remove(&guild_id);
            true
        } else {
            false
        }
    }
}

/// [`VoiceGateway`] backed by songbird
pub struct SongbirdGateway {
    songbird: Arc<Songbird>,
    leases: Arc<GuildLeases>,
    /// Serializes call setup against call removal
    calls: Arc<Mutex<()>>,
}

impl SongbirdGateway {
    /// Wrap the songbird manager registered on the serenity client
    pub fn new(songbird: Arc<Songbird>) -> Self {
        Self {
            songbird,
            leases: Arc::new(GuildLeases::default()),
            calls: Arc::new(Mutex::new(())),
        }
    }
}

fn discord_id(id: u64, channel_id: u64) -> Result<NonZeroU64, ConnectError> {
    NonZeroU64::new(id).ok_or_else(|| ConnectError::Gateway {
        channel_id,
        reason: "id must be non-zero".to_string(),
    })
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn request_join(
        &self,
        generation: u64,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Arc<dyn VoiceLink>, ConnectError> {
        let guild = GuildId::from(discord_id(guild_id, channel_id)?);
        let channel = ChannelId::from(discord_id(channel_id, channel_id)?);

        let (status, _) = watch::channel(LinkStatus::Connecting);
        let status = Arc::new(status);

        let call = {
            let _calls = self.calls.lock().await;
            if !self.leases.claim(guild_id, generation) {
                debug!(guild_id = %guild_id, generation, "Join request overtaken by a newer one");
                return Err(ConnectError::Superseded { channel_id });
            }
            let call = self.songbird.get_or_insert(guild);
            let mut handler = call.lock().await;
            handler.remove_all_global_events();
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectNotifier {
                    status: status.clone(),
                },
            );
            drop(handler);
            call
        };

        let songbird = self.songbird.clone();
        let leases = self.leases.clone();
        let join_status = status.clone();
        tokio::spawn(async move {
            if !leases.is_current(guild_id, generation) {
                join_status.send_replace(LinkStatus::Disconnected);
                return;
            }
            match songbird.join(guild, channel).await {
                Ok(_) => {
                    info!(guild_id = %guild_id, channel_id = %channel_id, "Voice driver connected");
                    join_status.send_replace(LinkStatus::Ready);
                }
                Err(e) => {
                    warn!(
                        guild_id = %guild_id,
                        channel_id = %channel_id,
                        error = %e,
                        "Voice driver failed to connect"
                    );
                    join_status.send_replace(LinkStatus::Disconnected);
                }
            }
        });

        Ok(Arc::new(SongbirdLink {
            songbird: self.songbird.clone(),
            leases: self.leases.clone(),
            calls: self.calls.clone(),
            generation,
            guild,
            call,
            status,
        }))
    }
}

struct SongbirdLink {
    songbird: Arc<Songbird>,
    leases: Arc<GuildLeases>,
    calls: Arc<Mutex<()>>,
    generation: u64,
    guild: GuildId,
    call: Arc<Mutex<Call>>,
    status: Arc<watch::Sender<LinkStatus>>,
}

#[async_trait]
impl VoiceLink for SongbirdLink {
    fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    async fn play(
        &self,
        frames: FrameStream,
    ) -> Result<watch::Receiver<PlayerStatus>, PlaybackError> {
        let input: Input =
            RawAdapter::new(FrameSource::new(frames), SAMPLE_RATE, CHANNELS as u32).into();

        let handle = {
            let mut call = self.call.lock().await;
            call.stop();
            call.play_input(input)
        };

        let (tx, rx) = watch::channel(PlayerStatus::Buffering);
        let tx = Arc::new(tx);
        for event in [TrackEvent::Playable, TrackEvent::Play, TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(Event::Track(event), PlayerNotifier { status: tx.clone() })
                .map_err(|e| PlaybackError::Rejected(e.to_string()))?;
        }

        // The track may have moved on before the handlers were attached
        match handle.get_info().await {
            Ok(state) => {
                if let Some(status) = player_status(&state) {
                    tx.send_replace(status);
                }
            }
            Err(e) => {
                debug!(error = %e, "Track ended before its state could be read");
                tx.send_replace(PlayerStatus::Finished);
            }
        }

        Ok(rx)
    }

    async fn destroy(&self) {
        {
            let _calls = self.calls.lock().await;
            if self.leases.release(self.guild.get(), self.generation) {
                if let Err(e) = self.songbird.remove(self.guild).await {
                    debug!(guild_id = %self.guild, error = %e, "Voice call already gone");
                }
            } else {
                debug!(
                    guild_id = %self.guild,
                    generation = self.generation,
                    "Voice call belongs to a newer session; leaving it up"
                );
            }
        }
        self.status.send_replace(LinkStatus::Disconnected);
    }
}

/// Map a track state to a player status; `None` while still buffering
fn player_status(state: &TrackState) -> Option<PlayerStatus> {
    match &state.playing {
        PlayMode::Play if matches!(state.ready, ReadyState::Playable) => {
            Some(PlayerStatus::Playing)
        }
        PlayMode::End | PlayMode::Stop => Some(PlayerStatus::Finished),
        PlayMode::Errored(e) => Some(PlayerStatus::Errored(format!("{:?}", e))),
        _ => None,
    }
}

struct DisconnectNotifier {
    status: Arc<watch::Sender<LinkStatus>>,
}

#[async_trait]
impl SongbirdEventHandler for DisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            info!(guild_id = ?data.guild_id, reason = ?data.reason, "Voice driver disconnected");
            self.status.send_replace(LinkStatus::Disconnected);
        }
        None
    }
}

struct PlayerNotifier {
    status: Arc<watch::Sender<PlayerStatus>>,
}

#[async_trait]
impl SongbirdEventHandler for PlayerNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _) in tracks.iter() {
                if let Some(status) = player_status(state) {
                    self.status.send_replace(status);
                }
            }
        }
        None
    }
}

/// Raw little-endian `f32` PCM pulled from a [`FrameStream`]
///
/// Songbird reads inputs from its own threads, so the blocking receive is
/// safe here. A transcode failure ends the track early.
struct FrameSource {
    frames: std::sync::Mutex<FrameStream>,
    current: Vec<u8>,
    offset: usize,
    finished: bool,
}

impl FrameSource {
    fn new(frames: FrameStream) -> Self {
        Self {
            frames: std::sync::Mutex::new(frames),
            current: Vec::new(),
            offset: 0,
            finished: false,
        }
    }

    fn refill(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let frames = self.frames.get_mut().unwrap_or_else(|p| p.into_inner());
        match frames.blocking_recv() {
            Some(Ok(frame)) => {
                self.current = frame.to_le_bytes();
                self.offset = 0;
                true
            }
            Some(Err(e)) => {
                warn!(error = %e, "Speech stream ended early");
                self.finished = true;
                false
            }
            None => {
                self.finished = true;
                false
            }
        }
    }
}

impl Read for FrameSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset >= self.current.len() && !self.refill() {
            return Ok(0);
        }
        let available = &self.current[self.offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

impl Seek for FrameSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "live speech cannot seek"))
    }
}

impl MediaSource for FrameSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::TranscodeError;
    use tokio::sync::mpsc;

    #[test]
    fn test_zero_ids_rejected() {
        assert!(matches!(
            discord_id(0, 5),
            Err(ConnectError::Gateway { channel_id: 5, .. })
        ));
        assert_eq!(discord_id(9, 5).unwrap().get(), 9);
    }

    #[test]
    fn test_guild_leases_follow_newest_generation() {
        let leases = GuildLeases::default();
        assert!(leases.claim(1, 1));
        assert!(leases.claim(1, 2));
        // An older request arriving late cannot take the call back
        assert!(!leases.claim(1, 1));
        assert!(leases.is_current(1, 2));

        // Only the owner tears the call down
        assert!(!leases.release(1, 1));
        assert!(leases.is_current(1, 2));
        assert!(leases.release(1, 2));
        assert!(!leases.release(1, 2));
        assert!(!leases.is_current(1, 2));

        // Guilds are independent
        assert!(leases.claim(2, 1));
        assert!(leases.claim(1, 3));
        assert!(leases.is_current(2, 1));
    }

    #[test]
    fn test_frame_source_ends_on_transcode_error() {
        let (tx, rx) = mpsc::channel(4);
        let mut source = FrameSource::new(rx);
        tx.try_send(Err(TranscodeError::Decode("bad packet".into()))).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        // Stays at end of stream even though the sender is still open
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_frame_source_closed_stream_is_eof() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let mut source = FrameSource::new(rx);

        let mut buf = [0u8; 16];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert!(source.seek(SeekFrom::Start(0)).is_err());
        assert!(!source.is_seekable());
        assert_eq!(source.byte_len(), None);
    }
}
