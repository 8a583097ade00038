//! Playback controller

use crate::connection::ConnectionManager;
use crate::transport::PlayerStatus;
use parley_core::PlaybackError;
use parley_provider_voice::FrameStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long the transport may take to start playing
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Clears a flag when dropped
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    /// Set `flag`, or `None` if it was already set
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Submits frame streams to the ready connection
pub struct PlaybackController {
    connections: Arc<ConnectionManager>,
    start_timeout: Duration,
    starting: AtomicBool,
}

impl PlaybackController {
    /// Create a controller with the default start timeout
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            start_timeout: DEFAULT_START_TIMEOUT,
            starting: AtomicBool::new(false),
        }
    }

    /// Override the start timeout
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    /// Play `frames` and return once the transport confirms playback started
    ///
    /// Does not wait for the audio to finish. Only one play may be waiting
    /// for its start confirmation at a time; others get
    /// [`PlaybackError::Busy`].
    pub async fn play(&self, frames: FrameStream) -> Result<(), PlaybackError> {
        let (ready, link) = self
            .connections
            .ready_link()
            .ok_or(PlaybackError::NotConnected)?;
        let _starting = FlagGuard::acquire(&self.starting).ok_or(PlaybackError::Busy)?;

        let mut status = link.play(frames).await?;
        debug!(channel_id = %ready.channel_id, "Submitted audio, waiting for playback to start");

        let outcome = timeout(
            self.start_timeout,
            status.wait_for(|s| *s != PlayerStatus::Buffering),
        )
        .await
        .map(|result| result.map(|status| status.clone()));

        match outcome {
            Ok(Ok(PlayerStatus::Playing)) | Ok(Ok(PlayerStatus::Finished)) => {
                info!(channel_id = %ready.channel_id, "Playback started");
                Ok(())
            }
            Ok(Ok(PlayerStatus::Errored(reason))) => {
                warn!(channel_id = %ready.channel_id, reason = %reason, "Transport rejected audio");
                Err(PlaybackError::Rejected(reason))
            }
            Ok(Ok(PlayerStatus::Buffering)) | Ok(Err(_)) => Err(PlaybackError::Rejected(
                "player closed before starting".to_string(),
            )),
            Err(_) => {
                warn!(
                    channel_id = %ready.channel_id,
                    timeout = ?self.start_timeout,
                    "Playback did not start"
                );
                Err(PlaybackError::StartTimeout(self.start_timeout))
            }
        }
    }
}
