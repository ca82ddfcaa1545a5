//! Live Session Management
//!
//! Owns every [`GameSession`] in the process together with the connection
//! bookkeeping the state machine itself does not care about: who is
//! watching, when the session was last touched, and the turn countdown.
//!
//! Locking: the store map and each session have their own tokio lock. Only
//! the sweep holds both, always store first. Nothing takes the store lock
//! while holding a session lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::ids::{ConnectionId, GameId};
use crate::game::state::{GameSession, SessionConfig, SessionSnapshot};

/// Session lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No live session with this id.
    #[error("unknown session: {0}")]
    UnknownSession(GameId),
}

/// A session plus its connection-side state.
#[derive(Debug)]
pub struct LiveSession {
    /// The match state machine.
    pub game: GameSession,
    attached: BTreeSet<ConnectionId>,
    last_activity: Instant,
    evicted: bool,
    turn_timer: Option<AbortHandle>,
}

impl LiveSession {
    /// Wrap a fresh game.
    pub fn new(game: GameSession) -> Self {
        Self {
            game,
            attached: BTreeSet::new(),
            last_activity: Instant::now(),
            evicted: false,
            turn_timer: None,
        }
    }

    /// Attach a connection. Returns false if it was already attached.
    pub fn attach(&mut self, conn: ConnectionId) -> bool {
        self.touch();
        self.attached.insert(conn)
    }

    /// Detach a connection. Returns false if it was not attached.
    pub fn detach(&mut self, conn: ConnectionId) -> bool {
        self.touch();
        self.attached.remove(&conn)
    }

    /// Whether `conn` is attached.
    pub fn is_attached(&self, conn: ConnectionId) -> bool {
        self.attached.contains(&conn)
    }

    /// Number of attached connections.
    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last activity.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Set once the sweep has removed this session from the store.
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Broadcastable view, counting attached connections as viewers.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.game.snapshot(self.attached.len())
    }

    /// Install a new countdown, aborting the previous one.
    pub fn set_turn_timer(&mut self, timer: AbortHandle) {
        if let Some(old) = self.turn_timer.replace(timer) {
            old.abort();
        }
    }

    /// Abort the running countdown, if any.
    pub fn cancel_turn_timer(&mut self) {
        if let Some(old) = self.turn_timer.take() {
            old.abort();
        }
    }

    /// Drop the countdown handle without aborting it. Used by the countdown
    /// task itself once it has fired.
    pub fn release_turn_timer(&mut self) {
        self.turn_timer = None;
    }

    /// Whether a countdown is installed.
    pub fn has_turn_timer(&self) -> bool {
        self.turn_timer.is_some()
    }
}

/// Shared handle to a live session.
pub type SharedSession = Arc<Mutex<LiveSession>>;

/// All live sessions, keyed by game id.
pub struct SessionStore {
    sessions: RwLock<BTreeMap<GameId, SharedSession>>,
    config: SessionConfig,
}

impl SessionStore {
    /// Create an empty store. New sessions use `config`.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            config,
        }
    }

    /// Rules applied to new sessions.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Existing session, or a new `Waiting` one. Concurrent callers for the
    /// same unknown id get the same session.
    ///
    /// Returns the session and whether it was created by this call.
    pub async fn get_or_create(&self, id: &GameId) -> (SharedSession, bool) {
        if let Some(session) = self.sessions.read().await.get(id) {
            return (session.clone(), false);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id) {
            return (session.clone(), false);
        }
        let session = Arc::new(Mutex::new(LiveSession::new(GameSession::new(
            id.clone(),
            self.config.clone(),
        ))));
        sessions.insert(id.clone(), session.clone());
        info!(game_id = %id, "Session created");
        (session, true)
    }

    /// Existing session.
    pub async fn get(&self, id: &GameId) -> Result<SharedSession, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(id.clone()))
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Evict sessions idle for longer than `idle_timeout` with nothing
    /// attached. Sessions whose lock is busy are skipped until next time.
    pub async fn sweep(&self, idle_timeout: Duration) -> Vec<GameId> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let mut evicted = Vec::new();

        for (id, session) in sessions.iter() {
            let Ok(mut live) = session.try_lock() else {
                debug!(game_id = %id, "Session busy, skipping sweep");
                continue;
            };
            if live.attached_count() == 0 && live.idle_for(now) > idle_timeout {
                live.evicted = true;
                live.cancel_turn_timer();
                evicted.push(id.clone());
            }
        }

        for id in &evicted {
            sessions.remove(id);
            info!(game_id = %id, "Session evicted");
        }
        evicted
    }
}
