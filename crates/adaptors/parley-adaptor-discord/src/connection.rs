//! Voice connection lifecycle
//!
//! [`ConnectionManager`] owns at most one transport session. Every session
//! gets a generation number when it is reserved; work that resumes after an
//! await re-checks that its generation is still the current one before it
//! touches shared state, and abandons the mutation otherwise.

use crate::transport::{LinkStatus, VoiceGateway, VoiceLink};
use parking_lot::Mutex;
use parley_core::ConnectError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long a new session may take to become ready
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Externally visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No session
    Disconnected,
    /// Session requested, not ready yet
    Connecting,
    /// Session can carry audio
    Ready,
    /// Last attempt failed; no session
    Failed,
}

/// Proof that a session reached `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyConnection {
    /// Session generation
    pub generation: u64,
    /// Guild of the channel
    pub guild_id: u64,
    /// Joined channel
    pub channel_id: u64,
}

struct ConnectionSession {
    generation: u64,
    guild_id: u64,
    channel_id: u64,
    link: Option<Arc<dyn VoiceLink>>,
    status: watch::Sender<ConnectionStatus>,
}

impl ConnectionSession {
    fn ready(&self) -> ReadyConnection {
        ReadyConnection {
            generation: self.generation,
            guild_id: self.guild_id,
            channel_id: self.channel_id,
        }
    }
}

struct ManagerState {
    session: Option<ConnectionSession>,
    /// Reported when there is no session
    idle_status: ConnectionStatus,
    next_generation: u64,
}

impl ManagerState {
    fn current(&mut self, generation: u64) -> Option<&mut ConnectionSession> {
        self.session
            .as_mut()
            .filter(|session| session.generation == generation)
    }
}

/// Owns the single voice session
#[derive(Clone)]
pub struct ConnectionManager {
    gateway: Arc<dyn VoiceGateway>,
    ready_timeout: Duration,
    state: Arc<Mutex<ManagerState>>,
}

impl ConnectionManager {
    /// Create a manager with the default readiness timeout
    pub fn new(gateway: Arc<dyn VoiceGateway>) -> Self {
        Self {
            gateway,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            state: Arc::new(Mutex::new(ManagerState {
                session: None,
                idle_status: ConnectionStatus::Disconnected,
                next_generation: 1,
            })),
        }
    }

    /// Override the readiness timeout
    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    /// Join `channel_id` and wait until the session is ready
    pub async fn join(
        &self,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<ReadyConnection, ConnectError> {
        self.begin_join(guild_id, channel_id).wait().await
    }

    /// Reserve the session for `channel_id` without suspending
    ///
    /// Callers that must keep event order do this inline and run
    /// [`PendingJoin::wait`] elsewhere. A ready session for the same channel
    /// is reused, and a join already in flight for it is shared rather than
    /// requested twice. A session for any other channel is replaced.
    pub fn begin_join(&self, guild_id: u64, channel_id: u64) -> PendingJoin {
        let mut state = self.state.lock();

        if let Some(session) = state.session.as_ref() {
            if session.guild_id == guild_id && session.channel_id == channel_id {
                let status = *session.status.borrow();
                match status {
                    ConnectionStatus::Ready => {
                        debug!(channel_id = %channel_id, "Already connected to voice channel");
                        return PendingJoin {
                            manager: self.clone(),
                            kind: JoinKind::Existing(session.ready()),
                        };
                    }
                    ConnectionStatus::Connecting => {
                        debug!(channel_id = %channel_id, "Join already in progress; waiting on it");
                        return PendingJoin {
                            manager: self.clone(),
                            kind: JoinKind::Attach {
                                target: session.ready(),
                                status: session.status.subscribe(),
                            },
                        };
                    }
                    _ => {}
                }
            }
        }

        let replaced = state.session.take().and_then(|old| {
            info!(
                from_channel = %old.channel_id,
                to_channel = %channel_id,
                "Replacing voice session"
            );
            old.link
        });

        let generation = state.next_generation;
        state.next_generation += 1;
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        state.session = Some(ConnectionSession {
            generation,
            guild_id,
            channel_id,
            link: None,
            status,
        });

        PendingJoin {
            manager: self.clone(),
            kind: JoinKind::Fresh {
                target: ReadyConnection {
                    generation,
                    guild_id,
                    channel_id,
                },
                replaced,
            },
        }
    }

    /// Destroy the current session, if any
    ///
    /// Safe to call any number of times; a session's link is destroyed at
    /// most once.
    pub async fn leave(&self) {
        let taken = {
            let mut state = self.state.lock();
            state.idle_status = ConnectionStatus::Disconnected;
            state.session.take()
        };

        match taken {
            Some(session) => {
                info!(
                    guild_id = %session.guild_id,
                    channel_id = %session.channel_id,
                    "Leaving voice channel"
                );
                session.status.send_replace(ConnectionStatus::Disconnected);
                if let Some(link) = session.link {
                    link.destroy().await;
                }
            }
            None => debug!("Leave requested with no voice session"),
        }
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        let state = self.state.lock();
        match state.session.as_ref() {
            Some(session) => *session.status.borrow(),
            None => state.idle_status,
        }
    }

    /// Whether a ready session exists
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Ready
    }

    /// The ready session, if there is one
    pub fn ready_connection(&self) -> Option<ReadyConnection> {
        self.ready_link().map(|(ready, _)| ready)
    }

    /// The ready session together with its transport link
    pub fn ready_link(&self) -> Option<(ReadyConnection, Arc<dyn VoiceLink>)> {
        let state = self.state.lock();
        let session = state.session.as_ref()?;
        if *session.status.borrow() != ConnectionStatus::Ready {
            return None;
        }
        let link = session.link.clone()?;
        Some((session.ready(), link))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().current(generation).is_some()
    }

    /// Drop session `generation` as failed; returns its link for teardown
    ///
    /// `None` in the outer option means the session was already superseded.
    fn fail(&self, generation: u64) -> Option<Option<Arc<dyn VoiceLink>>> {
        let mut state = self.state.lock();
        state.current(generation)?;
        let session = state.session.take()?;
        state.idle_status = ConnectionStatus::Failed;
        session.status.send_replace(ConnectionStatus::Failed);
        Some(session.link)
    }

    /// Clear session `generation` when its transport reports loss
    fn watch_for_loss(&self, generation: u64, mut link_status: watch::Receiver<LinkStatus>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            // A dropped sender also means the link is gone
            let _ = link_status
                .wait_for(|status| *status == LinkStatus::Disconnected)
                .await;

            let mut state = state.lock();
            if state.current(generation).is_none() {
                return;
            }
            if let Some(session) = state.session.take() {
                warn!(
                    guild_id = %session.guild_id,
                    channel_id = %session.channel_id,
                    "Voice connection lost"
                );
                session.status.send_replace(ConnectionStatus::Disconnected);
            }
            state.idle_status = ConnectionStatus::Disconnected;
        });
    }
}

enum JoinKind {
    /// Already ready
    Existing(ReadyConnection),
    /// Sharing another caller's in-flight attempt
    Attach {
        target: ReadyConnection,
        status: watch::Receiver<ConnectionStatus>,
    },
    /// This caller owns the attempt
    Fresh {
        target: ReadyConnection,
        replaced: Option<Arc<dyn VoiceLink>>,
    },
}

/// A reserved join, completed by [`PendingJoin::wait`]
pub struct PendingJoin {
    manager: ConnectionManager,
    kind: JoinKind,
}

impl PendingJoin {
    /// Generation of the session this join resolves to
    pub fn generation(&self) -> u64 {
        match &self.kind {
            JoinKind::Existing(target)
            | JoinKind::Attach { target, .. }
            | JoinKind::Fresh { target, .. } => target.generation,
        }
    }

    /// Drive the join to a ready session or an error
    pub async fn wait(self) -> Result<ReadyConnection, ConnectError> {
        let manager = self.manager;
        match self.kind {
            JoinKind::Existing(ready) => Ok(ready),
            JoinKind::Attach { target, status } => manager.attach(target, status).await,
            JoinKind::Fresh { target, replaced } => {
                if let Some(link) = replaced {
                    link.destroy().await;
                }
                manager.establish(target).await
            }
        }
    }
}

impl ConnectionManager {
    async fn attach(
        &self,
        target: ReadyConnection,
        mut status: watch::Receiver<ConnectionStatus>,
    ) -> Result<ReadyConnection, ConnectError> {
        let channel_id = target.channel_id;
        let outcome = timeout(
            self.ready_timeout,
            status.wait_for(|s| *s != ConnectionStatus::Connecting),
        )
        .await
        .map(|result| result.map(|status| *status));

        match outcome {
            Ok(Ok(ConnectionStatus::Ready)) => Ok(target),
            Ok(Ok(_)) => Err(ConnectError::Dropped { channel_id }),
            Ok(Err(_)) => Err(ConnectError::Superseded { channel_id }),
            Err(_) => Err(ConnectError::Timeout {
                channel_id,
                timeout: self.ready_timeout,
            }),
        }
    }

    async fn establish(&self, target: ReadyConnection) -> Result<ReadyConnection, ConnectError> {
        let ReadyConnection {
            generation,
            guild_id,
            channel_id,
        } = target;

        if !self.is_current(generation) {
            debug!(channel_id = %channel_id, generation, "Join superseded before request");
            return Err(ConnectError::Superseded { channel_id });
        }

        let requested = self
            .gateway
            .request_join(generation, guild_id, channel_id)
            .await;
        let link = match requested {
            Ok(link) => link,
            Err(e) => {
                self.fail(generation);
                return Err(e);
            }
        };

        let attached = {
            let mut state = self.state.lock();
            match state.current(generation) {
                Some(session) => {
                    session.link = Some(link.clone());
                    true
                }
                None => false,
            }
        };
        if !attached {
            debug!(channel_id = %channel_id, generation, "Join superseded during request");
            link.destroy().await;
            return Err(ConnectError::Superseded { channel_id });
        }

        let mut link_status = link.status();
        let outcome = timeout(
            self.ready_timeout,
            link_status.wait_for(|s| *s != LinkStatus::Connecting),
        )
        .await
        .map(|result| result.map(|status| *status));

        let error = match outcome {
            Ok(Ok(LinkStatus::Ready)) => {
                let marked = {
                    let mut state = self.state.lock();
                    match state.current(generation) {
                        Some(session) => {
                            session.status.send_replace(ConnectionStatus::Ready);
                            true
                        }
                        None => false,
                    }
                };
                if !marked {
                    return Err(ConnectError::Superseded { channel_id });
                }
                info!(guild_id = %guild_id, channel_id = %channel_id, "Voice connection ready");
                self.watch_for_loss(generation, link_status);
                return Ok(target);
            }
            Ok(_) => ConnectError::Dropped { channel_id },
            Err(_) => ConnectError::Timeout {
                channel_id,
                timeout: self.ready_timeout,
            },
        };

        match self.fail(generation) {
            Some(link) => {
                if let Some(link) = link {
                    link.destroy().await;
                }
                Err(error)
            }
            None => Err(ConnectError::Superseded { channel_id }),
        }
    }
}
