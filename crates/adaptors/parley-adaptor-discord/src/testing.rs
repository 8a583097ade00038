//! In-memory collaborators with call counters

use crate::transport::{GuildLeases, LinkStatus, PlayerStatus, VoiceGateway, VoiceLink};
use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{ConnectError, PlaybackError, SynthesisError};
use parley_provider_voice::{create_audio_stream, AudioStream, FrameStream, SpeechSynthesizer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

/// Poll `condition` until it holds, letting spawned tasks run in between
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition never became true");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkBehavior {
    /// Links are ready as soon as they are created
    Ready,
    /// Links stay connecting until the test moves them
    Manual,
    /// `request_join` itself fails
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlayerBehavior {
    /// Playback starts right away
    Start,
    /// The transport refuses the resource
    Error(String),
    /// Never leaves buffering
    Stall,
}

pub(crate) struct FakeGateway {
    behavior: LinkBehavior,
    player: Mutex<PlayerBehavior>,
    requests: AtomicUsize,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeGateway {
    pub(crate) fn new(behavior: LinkBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            player: Mutex::new(PlayerBehavior::Start),
            requests: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    /// Player behavior for links created from now on
    pub(crate) fn set_player(&self, behavior: PlayerBehavior) {
        *self.player.lock() = behavior;
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn last_link(&self) -> Option<Arc<FakeLink>> {
        self.links.lock().last().cloned()
    }

    pub(crate) fn total_destroys(&self) -> usize {
        self.links.lock().iter().map(|link| link.destroys()).sum()
    }

    pub(crate) fn total_plays(&self) -> usize {
        self.links.lock().iter().map(|link| link.plays()).sum()
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn request_join(
        &self,
        _generation: u64,
        _guild_id: u64,
        channel_id: u64,
    ) -> Result<Arc<dyn VoiceLink>, ConnectError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.behavior == LinkBehavior::Reject {
            return Err(ConnectError::Gateway {
                channel_id,
                reason: "gateway refused".to_string(),
            });
        }

        let initial = match self.behavior {
            LinkBehavior::Ready => LinkStatus::Ready,
            _ => LinkStatus::Connecting,
        };
        let link = Arc::new(FakeLink {
            status: watch::channel(initial).0,
            player: self.player.lock().clone(),
            destroys: AtomicUsize::new(0),
            plays: AtomicUsize::new(0),
            players: Mutex::new(Vec::new()),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

pub(crate) struct FakeLink {
    status: watch::Sender<LinkStatus>,
    player: PlayerBehavior,
    destroys: AtomicUsize,
    plays: AtomicUsize,
    /// Keeps stalled players open
    players: Mutex<Vec<watch::Sender<PlayerStatus>>>,
}

impl FakeLink {
    pub(crate) fn set_status(&self, status: LinkStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub(crate) fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceLink for FakeLink {
    fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    async fn play(
        &self,
        _frames: FrameStream,
    ) -> Result<watch::Receiver<PlayerStatus>, PlaybackError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        let initial = match &self.player {
            PlayerBehavior::Start => PlayerStatus::Playing,
            PlayerBehavior::Error(msg) => PlayerStatus::Errored(msg.clone()),
            PlayerBehavior::Stall => PlayerStatus::Buffering,
        };
        let (tx, rx) = watch::channel(initial);
        self.players.lock().push(tx);
        Ok(rx)
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.status.send_replace(LinkStatus::Disconnected);
    }
}

/// One call per guild shared by every link, like the songbird driver
///
/// Links are ready as soon as they are handed out. The first request can be
/// held inside `request_join` until [`SharedCallGateway::release_first`].
pub(crate) struct SharedCallGateway {
    leases: Arc<GuildLeases>,
    calls: Arc<Mutex<HashMap<u64, Arc<SharedCall>>>>,
    removals: Arc<AtomicUsize>,
    requests: AtomicUsize,
    hold_first: bool,
    first: Semaphore,
}

#[derive(Default)]
struct SharedCall {
    /// Status of the link that set the call up last
    listener: Mutex<Option<watch::Sender<LinkStatus>>>,
}

impl SharedCallGateway {
    pub(crate) fn new(hold_first: bool) -> Arc<Self> {
        Arc::new(Self {
            leases: Arc::new(GuildLeases::default()),
            calls: Arc::new(Mutex::new(HashMap::new())),
            removals: Arc::new(AtomicUsize::new(0)),
            requests: AtomicUsize::new(0),
            hold_first,
            first: Semaphore::new(0),
        })
    }

    pub(crate) fn release_first(&self) {
        self.first.add_permits(1);
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Calls torn down so far
    pub(crate) fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceGateway for SharedCallGateway {
    async fn request_join(
        &self,
        generation: u64,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Arc<dyn VoiceLink>, ConnectError> {
        let index = self.requests.fetch_add(1, Ordering::SeqCst);
        // Claimed before suspending so a held request owns a stale lease
        if !self.leases.claim(guild_id, generation) {
            return Err(ConnectError::Superseded { channel_id });
        }
        if self.hold_first && index == 0 {
            if let Ok(permit) = self.first.acquire().await {
                permit.forget();
            }
        }

        let (status, _) = watch::channel(LinkStatus::Ready);
        if self.leases.is_current(guild_id, generation) {
            let call = self.calls.lock().entry(guild_id).or_default().clone();
            *call.listener.lock() = Some(status.clone());
        }
        Ok(Arc::new(SharedCallLink {
            leases: self.leases.clone(),
            calls: self.calls.clone(),
            removals: self.removals.clone(),
            generation,
            guild_id,
            status,
        }))
    }
}

struct SharedCallLink {
    leases: Arc<GuildLeases>,
    calls: Arc<Mutex<HashMap<u64, Arc<SharedCall>>>>,
    removals: Arc<AtomicUsize>,
    generation: u64,
    guild_id: u64,
    status: watch::Sender<LinkStatus>,
}

#[async_trait]
impl VoiceLink for SharedCallLink {
    fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    async fn play(
        &self,
        _frames: FrameStream,
    ) -> Result<watch::Receiver<PlayerStatus>, PlaybackError> {
        Ok(watch::channel(PlayerStatus::Playing).1)
    }

    async fn destroy(&self) {
        if self.leases.release(self.guild_id, self.generation) {
            let removed = self.calls.lock().remove(&self.guild_id);
            if let Some(call) = removed {
                self.removals.fetch_add(1, Ordering::SeqCst);
                // Whoever is on the call loses it
                if let Some(listener) = call.listener.lock().take() {
                    listener.send_replace(LinkStatus::Disconnected);
                }
            }
        }
        self.status.send_replace(LinkStatus::Disconnected);
    }
}

pub(crate) struct FakeSynthesizer {
    configured: bool,
    failure: Mutex<Option<SynthesisError>>,
    delay: Mutex<Option<Duration>>,
    texts: Mutex<Vec<String>>,
}

impl FakeSynthesizer {
    pub(crate) fn new(configured: bool) -> Arc<Self> {
        Arc::new(Self {
            configured,
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            texts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn fail_with(&self, error: SynthesisError) {
        *self.failure.lock() = Some(error);
    }

    /// Take `delay` over every synthesis from now on
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.texts.lock().len()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    fn name(&self) -> &str {
        "fake"
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, SynthesisError> {
        self.texts.lock().push(text.to_string());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        // Empty audio: the transcoder closes it straight away
        let (_tx, rx) = create_audio_stream(1);
        Ok(rx)
    }
}
