//! Protocol Router
//!
//! Turns inbound frames into session operations and session events into
//! outbound broadcasts.
//!
//! Every mutation follows the same pipeline:
//!
//! ```text
//! resolve session -> lock -> apply -> re-arm countdown -> snapshot -> unlock
//!     -> broadcast each event with the snapshot -> queue persistence writes
//! ```
//!
//! Rejections go back to the originating connection only.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::core::ids::{ConnectionId, GameId, PlayerAddress};
use crate::core::rng::OutcomeSource;
use crate::game::events::{FlipTrigger, GameEvent};
use crate::game::flow::GameError;
use crate::game::state::{Phase, SessionSnapshot};
use crate::network::hub::{BroadcastReport, ConnectionHub, HubError, RoomJoin};
use crate::network::protocol::{
    now_millis, ActionKind, ClientMessage, ErrorCode, GameAction, JoinRole, ServerEvent,
    ServerMessage,
};
use crate::network::session::{LiveSession, SessionError, SessionStore, SharedSession};
use crate::persistence::{ChatRecord, PersistenceCommand, PersistenceError, PersistenceHandle};

/// Routing failure, reported to the originating connection.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session rejected the operation.
    #[error(transparent)]
    Game(#[from] GameError),

    /// No live session with this id.
    #[error("unknown session: {0}")]
    UnknownSession(GameId),

    /// Frame could not be parsed or lacks context.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Delivery or registration failure.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Store unavailable.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<SessionError> for RouterError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::UnknownSession(id) => RouterError::UnknownSession(id),
        }
    }
}

impl RouterError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::Game(e) => ErrorCode::from(e),
            RouterError::UnknownSession(_) => ErrorCode::UnknownSession,
            RouterError::MalformedMessage(_) => ErrorCode::MalformedMessage,
            RouterError::Hub(HubError::UnknownConnection(_)) => ErrorCode::UnknownConnection,
            RouterError::Hub(HubError::UnknownIdentity(_)) => ErrorCode::UnknownIdentity,
            RouterError::Hub(HubError::DeliveryFailure(_)) => ErrorCode::DeliveryFailure,
            RouterError::Persistence(_) => ErrorCode::PersistenceFailure,
        }
    }
}

/// Convert a session event into its wire form.
fn convert_game_event(event: &GameEvent) -> ServerEvent {
    match event {
        GameEvent::CreatorJoined { creator, max_rounds } => ServerEvent::CreatorJoined {
            creator: creator.clone(),
            max_rounds: *max_rounds,
        },
        GameEvent::JoinerJoined { joiner, entry_fee_hash } => ServerEvent::PlayerJoined {
            joiner: joiner.clone(),
            entry_fee_hash: entry_fee_hash.clone(),
        },
        GameEvent::GameStarted { started_at, current_turn } => ServerEvent::GameStarted {
            current_turn: current_turn.clone(),
            started_at: *started_at,
        },
        GameEvent::ChoiceMade { player, role, choice } => ServerEvent::PlayerChoiceMade {
            player: player.clone(),
            role: *role,
            choice: *choice,
        },
        GameEvent::ChoicesLocked { round, creator_choice, joiner_choice, current_turn } => {
            ServerEvent::ChoiceMadeReadyToFlip {
                round: *round,
                creator_choice: *creator_choice,
                joiner_choice: *joiner_choice,
                current_turn: current_turn.clone(),
            }
        }
        GameEvent::ChargeStarted { player } => ServerEvent::PowerChargeStarted {
            player: player.clone(),
        },
        GameEvent::PowerUpdated { player, level } => ServerEvent::PowerUpdate {
            player: player.clone(),
            power_level: *level,
        },
        GameEvent::PowerCharged { player, level } => ServerEvent::PowerCharged {
            player: player.clone(),
            power_level: *level,
        },
        GameEvent::FlipStarted { round, flipper, power, trigger } => ServerEvent::FlipStarted {
            round: *round,
            flipper: flipper.clone(),
            power: *power,
            trigger: *trigger,
        },
        GameEvent::FlipResolved {
            round,
            outcome,
            round_winner,
            flipper,
            power,
            creator_choice,
            joiner_choice,
        } => ServerEvent::FlipResult {
            round: *round,
            result: *outcome,
            round_winner: round_winner.clone(),
            flipper: flipper.clone(),
            power: *power,
            creator_choice: *creator_choice,
            joiner_choice: *joiner_choice,
            phase: Phase::RoundComplete,
        },
        GameEvent::ScoreUpdated { creator_wins, joiner_wins } => ServerEvent::ScoreUpdate {
            creator_wins: *creator_wins,
            joiner_wins: *joiner_wins,
        },
        GameEvent::RoundStarted { round, current_turn } => ServerEvent::RoundStarted {
            round: *round,
            current_turn: current_turn.clone(),
        },
        GameEvent::TurnExpired { player, phase } => ServerEvent::TurnTimeout {
            player: player.clone(),
            phase: *phase,
        },
        GameEvent::GameCompleted { winner, creator_wins, joiner_wins, completed_at } => {
            ServerEvent::GameCompleted {
                winner: winner.clone(),
                creator_wins: *creator_wins,
                joiner_wins: *joiner_wins,
                completed_at: *completed_at,
            }
        }
    }
}

/// Dispatches client messages against the session store.
pub struct Router {
    hub: Arc<ConnectionHub>,
    sessions: Arc<SessionStore>,
    outcomes: Arc<dyn OutcomeSource>,
    persistence: PersistenceHandle,
}

impl Router {
    /// Create a router.
    pub fn new(
        hub: Arc<ConnectionHub>,
        sessions: Arc<SessionStore>,
        outcomes: Arc<dyn OutcomeSource>,
        persistence: PersistenceHandle,
    ) -> Self {
        Self {
            hub,
            sessions,
            outcomes,
            persistence,
        }
    }

    /// Connection registry.
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    // =========================================================================
    // ENTRY POINTS
    // =========================================================================

    /// Handle one text frame from `conn`.
    pub async fn handle_text(self: &Arc<Self>, conn: ConnectionId, text: &str) {
        #[cfg(feature = "debug-tracing")]
        debug!(conn = %conn, raw = text, "Inbound frame");

        let msg = match ClientMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn = %conn, error = %e, "Invalid message");
                self.reply_error(conn, &RouterError::MalformedMessage(e.to_string())).await;
                return;
            }
        };

        if let Err(e) = self.dispatch(conn, msg).await {
            debug!(conn = %conn, error = %e, "Request rejected");
            self.reply_error(conn, &e).await;
        }
    }

    /// Clean up after a closed connection.
    pub async fn handle_disconnect(&self, conn: ConnectionId) {
        let Some(departed) = self.hub.disconnect(conn).await else {
            return;
        };
        if let Some(room) = departed.room {
            self.detach_from(conn, &room).await;
        }
        info!(
            conn = %conn,
            identity = departed.identity.as_ref().map(PlayerAddress::short),
            "Client cleaned up"
        );
    }

    /// Route a parsed message.
    pub async fn dispatch(self: &Arc<Self>, conn: ConnectionId, msg: ClientMessage) -> Result<(), RouterError> {
        match msg {
            ClientMessage::JoinRoom { room_id } => self.handle_join_room(conn, room_id).await,
            ClientMessage::LeaveRoom { room_id } => self.handle_leave_room(conn, room_id).await,
            ClientMessage::RegisterUser { address } => self.handle_register(conn, address).await,
            ClientMessage::ChatMessage { room_id, message, from } => {
                self.handle_chat(conn, room_id, message, from).await
            }
            ClientMessage::CreateGame { game_id, address, max_rounds } => {
                self.handle_join_game(conn, game_id, JoinRole::Creator, Some(address), None, max_rounds)
                    .await
            }
            ClientMessage::JoinGame { game_id, role, address, entry_fee_hash, max_rounds } => {
                self.handle_join_game(conn, game_id, role, address, entry_fee_hash, max_rounds)
                    .await
            }
            ClientMessage::StartGame { game_id } => {
                let who = self.acting_identity(conn, None).await?;
                self.mutate(&game_id, false, |live| live.game.start_game(&who)).await?;
                Ok(())
            }
            ClientMessage::GetGameData { game_id } => self.handle_get_game_data(conn, game_id).await,
            ClientMessage::NftOffer { game_id, offerer_address, nft, timestamp } => {
                let event = ServerEvent::NftOfferReceived {
                    offerer_address,
                    nft,
                    offered_at: timestamp.unwrap_or_else(now_millis),
                };
                self.broadcast(&game_id, &ServerMessage::new(event).in_game(&game_id)).await;
                Ok(())
            }
            ClientMessage::OfferAccepted { game_id, creator_address, accepted_offer, timestamp } => {
                self.handle_offer_accepted(game_id, creator_address, accepted_offer, timestamp).await
            }
            ClientMessage::Ping { timestamp } => {
                let pong = ServerEvent::Pong {
                    client_timestamp: timestamp,
                    server_time: now_millis(),
                };
                self.hub.send_to(conn, &ServerMessage::new(pong)).await?;
                Ok(())
            }
            ClientMessage::GameAction(action) => self.handle_game_action(conn, action).await,
        }
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    async fn handle_join_room(self: &Arc<Self>, conn: ConnectionId, room: GameId) -> Result<(), RouterError> {
        let (_, snapshot) = self
            .apply(&room, true, |live| {
                live.attach(conn);
                Ok(Vec::new())
            })
            .await?;

        let join = match self.hub.join(conn, &room).await {
            Ok(join) => join,
            Err(e) => {
                self.release(&room, &[conn]).await;
                return Err(e.into());
            }
        };
        if let Some(previous) = &join.previous {
            self.detach_from(conn, previous).await;
        }

        let reply = ServerMessage::new(ServerEvent::RoomJoined {
            room_id: room.clone(),
            members: join.members,
        })
        .in_game(&room)
        .with_state(snapshot.clone());
        self.hub.send_to(conn, &reply).await?;
        self.announce_viewers(&room, snapshot).await;
        Ok(())
    }

    async fn handle_leave_room(&self, conn: ConnectionId, room: Option<GameId>) -> Result<(), RouterError> {
        let current = self.hub.room_of(conn).await;
        if room.is_some() && room != current {
            return Ok(());
        }
        if let Some(left) = self.hub.leave(conn).await {
            self.detach_from(conn, &left).await;
        }
        Ok(())
    }

    async fn handle_register(&self, conn: ConnectionId, address: PlayerAddress) -> Result<(), RouterError> {
        if let Some(old) = self.hub.register_identity(conn, address.clone()).await? {
            debug!(old = %old, new = %conn, "Registration superseded earlier connection");
        }
        let reply = ServerMessage::new(ServerEvent::UserRegistered { address });
        self.hub.send_to(conn, &reply).await?;
        Ok(())
    }

    async fn handle_chat(
        &self,
        conn: ConnectionId,
        room: Option<GameId>,
        message: String,
        from: Option<PlayerAddress>,
    ) -> Result<(), RouterError> {
        let room = match room {
            Some(room) => room,
            None => self
                .hub
                .room_of(conn)
                .await
                .ok_or_else(|| RouterError::MalformedMessage("chat outside a room".into()))?,
        };
        let from = self.hub.identity_of(conn).await.or(from);

        let event = ServerEvent::ChatMessage {
            room_id: room.clone(),
            from: from.clone(),
            message: message.clone(),
        };
        self.broadcast(&room, &ServerMessage::new(event).in_game(&room)).await;

        let _ = self.persistence.submit(PersistenceCommand::RecordChat(ChatRecord {
            room,
            from,
            message,
            sent_at: Utc::now(),
        }));
        Ok(())
    }

    async fn handle_join_game(
        self: &Arc<Self>,
        conn: ConnectionId,
        game_id: GameId,
        role: JoinRole,
        address: Option<PlayerAddress>,
        entry_fee_hash: Option<String>,
        max_rounds: Option<u32>,
    ) -> Result<(), RouterError> {
        let who = match &address {
            Some(address) => Some(address.clone()),
            None => self.hub.identity_of(conn).await,
        };
        if role != JoinRole::Spectator && who.is_none() {
            return Err(GameError::NotParticipant.into());
        }

        // Seat first; identity and room only move once the session accepts
        let (events, snapshot) = self
            .apply(&game_id, true, |live| {
                let events = match (role, &who) {
                    (JoinRole::Creator, Some(who)) => live.game.claim_creator(who, max_rounds)?,
                    (JoinRole::Joiner, Some(who)) => live.game.set_joiner(who, entry_fee_hash)?,
                    _ => Vec::new(),
                };
                live.attach(conn);
                Ok(events)
            })
            .await?;

        let join = match self.bind_connection(conn, &game_id, address).await {
            Ok(join) => join,
            Err(e) => {
                self.release(&game_id, &[conn]).await;
                return Err(e.into());
            }
        };
        if let Some(previous) = &join.previous {
            self.detach_from(conn, previous).await;
        }
        self.publish(&game_id, &events, &snapshot).await;

        let reply = ServerMessage::new(ServerEvent::GameState { role: Some(role) })
            .in_game(&game_id)
            .with_state(snapshot.clone());
        self.hub.send_to(conn, &reply).await?;
        self.announce_viewers(&game_id, snapshot).await;
        Ok(())
    }

    /// Bind `address` to `conn` if given, then move `conn` into `room`.
    async fn bind_connection(
        &self,
        conn: ConnectionId,
        room: &GameId,
        address: Option<PlayerAddress>,
    ) -> Result<RoomJoin, HubError> {
        if let Some(address) = address {
            if let Some(old) = self.hub.register_identity(conn, address).await? {
                debug!(old = %old, new = %conn, "Join superseded earlier connection");
            }
        }
        self.hub.join(conn, room).await
    }

    async fn handle_get_game_data(&self, conn: ConnectionId, game_id: GameId) -> Result<(), RouterError> {
        let game = self.persistence.get_game(game_id.clone()).await?;
        let mut reply = ServerMessage::new(ServerEvent::GameDataResponse { game }).in_game(&game_id);
        if let Ok(shared) = self.sessions.get(&game_id).await {
            reply = reply.with_state(shared.lock().await.snapshot());
        }
        self.hub.send_to(conn, &reply).await?;
        Ok(())
    }

    async fn handle_offer_accepted(
        &self,
        game_id: GameId,
        creator_address: PlayerAddress,
        accepted_offer: serde_json::Value,
        timestamp: Option<i64>,
    ) -> Result<(), RouterError> {
        let offerer = ["offererAddress", "offerer_address"]
            .iter()
            .find_map(|key| accepted_offer.get(*key).and_then(|v| v.as_str()))
            .map(PlayerAddress::new);

        let msg = ServerMessage::new(ServerEvent::NftOfferAccepted {
            creator_address,
            accepted_offer,
            accepted_at: timestamp.unwrap_or_else(now_millis),
        })
        .in_game(&game_id);
        self.broadcast(&game_id, &msg).await;

        // Offerer may have left the room while waiting
        if let Some(offerer) = offerer {
            if let Some(conn) = self.hub.connection_of(&offerer).await {
                if !self.hub.is_member(conn, &game_id).await {
                    if let Err(e) = self.hub.send_to(conn, &msg).await {
                        debug!(offerer = offerer.short(), error = %e, "Offer notice not delivered");
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_game_action(self: &Arc<Self>, conn: ConnectionId, action: GameAction) -> Result<(), RouterError> {
        let who = self.acting_identity(conn, action.player.as_ref()).await?;
        let round = action.round;
        debug!(
            game_id = %action.game_id,
            player = who.short(),
            action = action.kind.name(),
            "Game action"
        );

        let outcomes = Arc::clone(&self.outcomes);
        self.mutate(&action.game_id, false, |live| match action.kind {
            ActionKind::MakeChoice { choice } => live.game.submit_choice(&who, choice),
            ActionKind::PowerChargeStart => live.game.start_charging(&who),
            ActionKind::PowerUpdate { power_level } => live.game.update_power(&who, power_level),
            ActionKind::PowerCharged { power_level } => {
                live.game.stop_charging(&who, power_level, round, &*outcomes)
            }
            ActionKind::AutoFlip { choice } => {
                live.game.force_flip(&who, choice, FlipTrigger::AutoFlip, round, &*outcomes)
            }
            ActionKind::AutoFlipTimeout { choice } => {
                live.game.force_flip(&who, choice, FlipTrigger::Timeout, round, &*outcomes)
            }
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // PIPELINE
    // =========================================================================

    /// Identity allowed to act for `conn`. A `claimed` player that disagrees
    /// with the bound identity is refused.
    async fn acting_identity(
        &self,
        conn: ConnectionId,
        claimed: Option<&PlayerAddress>,
    ) -> Result<PlayerAddress, RouterError> {
        let bound = self.hub.identity_of(conn).await.ok_or(GameError::NotParticipant)?;
        match claimed {
            Some(claimed) if claimed != &bound => Err(GameError::NotParticipant.into()),
            _ => Ok(bound),
        }
    }

    /// Lock the live session for `game_id`, skipping one that the sweep
    /// evicted between lookup and lock.
    async fn lock_session(
        &self,
        game_id: &GameId,
        create: bool,
    ) -> Result<(SharedSession, OwnedMutexGuard<LiveSession>), RouterError> {
        loop {
            let shared = if create {
                self.sessions.get_or_create(game_id).await.0
            } else {
                self.sessions.get(game_id).await?
            };
            let live = Arc::clone(&shared).lock_owned().await;
            if !live.is_evicted() {
                return Ok((shared, live));
            }
            debug!(game_id = %game_id, "Raced with eviction, retrying");
        }
    }

    /// Apply `op` under the session lock, then broadcast and persist its
    /// events. Returns the events and the post-mutation snapshot.
    async fn mutate<F>(
        self: &Arc<Self>,
        game_id: &GameId,
        create: bool,
        op: F,
    ) -> Result<(Vec<GameEvent>, SessionSnapshot), RouterError>
    where
        F: FnOnce(&mut LiveSession) -> Result<Vec<GameEvent>, GameError>,
    {
        let (events, snapshot) = self.apply(game_id, create, op).await?;
        self.publish(game_id, &events, &snapshot).await;
        Ok((events, snapshot))
    }

    /// Apply `op` under the session lock and re-arm the countdown. Nothing
    /// is broadcast; the caller publishes the returned events.
    async fn apply<F>(
        self: &Arc<Self>,
        game_id: &GameId,
        create: bool,
        op: F,
    ) -> Result<(Vec<GameEvent>, SessionSnapshot), RouterError>
    where
        F: FnOnce(&mut LiveSession) -> Result<Vec<GameEvent>, GameError>,
    {
        let (shared, mut live) = self.lock_session(game_id, create).await?;
        live.touch();
        let epoch = live.game.turn_epoch();

        let events = op(&mut *live)?;

        if live.game.turn_epoch() != epoch {
            self.arm_turn_timer(&shared, &mut *live);
        }
        let snapshot = live.snapshot();
        Ok((events, snapshot))
    }

    /// Broadcast each event with the snapshot, then queue persistence writes.
    async fn publish(&self, game_id: &GameId, events: &[GameEvent], snapshot: &SessionSnapshot) {
        for event in events {
            let msg = ServerMessage::new(convert_game_event(event))
                .in_game(game_id)
                .with_state(snapshot.clone());
            let report = self.broadcast(game_id, &msg).await;
            debug!(
                game_id = %game_id,
                event = event.name(),
                delivered = report.delivered,
                failed = report.failed,
                "Event broadcast"
            );
        }

        for event in events {
            if let Some(command) = PersistenceCommand::from_event(game_id, event) {
                // Failure already logged by the handle
                let _ = self.persistence.submit(command);
            }
            if let GameEvent::GameCompleted { winner, creator_wins, joiner_wins, .. } = event {
                info!(
                    game_id = %game_id,
                    winner = winner.short(),
                    creator_wins,
                    joiner_wins,
                    "Game completed"
                );
            }
        }
    }

    /// Detach `conn` from the session behind `room` and tell the room.
    async fn detach_from(&self, conn: ConnectionId, room: &GameId) {
        let Ok(shared) = self.sessions.get(room).await else {
            return;
        };
        let snapshot = {
            let mut live = shared.lock().await;
            if live.is_evicted() || !live.detach(conn) {
                return;
            }
            live.snapshot()
        };
        self.announce_viewers(room, snapshot).await;
    }

    /// Detach connections from the session behind `room` without telling
    /// the room. The next broadcast carries the new spectator count.
    async fn release(&self, room: &GameId, conns: &[ConnectionId]) {
        let Ok(shared) = self.sessions.get(room).await else {
            return;
        };
        let mut live = shared.lock().await;
        if live.is_evicted() {
            return;
        }
        for conn in conns {
            live.detach(*conn);
        }
    }

    /// Broadcast to `room`. Members the hub dropped for a full or closed
    /// queue are detached from the session as well.
    async fn broadcast(&self, room: &GameId, msg: &ServerMessage) -> BroadcastReport {
        let report = self.hub.broadcast(room, msg).await;
        if !report.dropped.is_empty() {
            self.release(room, &report.dropped).await;
        }
        report
    }

    async fn announce_viewers(&self, room: &GameId, snapshot: SessionSnapshot) {
        let event = ServerEvent::SpectatorUpdate {
            spectators: snapshot.spectators,
        };
        let msg = ServerMessage::new(event).in_game(room).with_state(snapshot);
        self.broadcast(room, &msg).await;
    }

    async fn reply_error(&self, conn: ConnectionId, err: &RouterError) {
        let msg = ServerMessage::error(err.code(), err.to_string());
        if let Err(e) = self.hub.send_to(conn, &msg).await {
            warn!(conn = %conn, error = %e, "Failed to deliver error reply");
        }
    }

    // =========================================================================
    // TURN COUNTDOWN
    // =========================================================================

    /// Replace the countdown for the session's current turn. Untimed phases
    /// just cancel it.
    fn arm_turn_timer(self: &Arc<Self>, shared: &SharedSession, live: &mut LiveSession) {
        if !live.game.phase().is_timed() {
            live.cancel_turn_timer();
            return;
        }

        let epoch = live.game.turn_epoch();
        let deadline = tokio::time::Instant::now() + live.game.config().turn_timeout;
        let router = Arc::clone(self);
        let shared = Arc::clone(shared);
        let game_id = live.game.game_id().clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            router.expire_turn(shared, game_id, epoch).await;
        });
        live.set_turn_timer(task.abort_handle());
    }

    async fn expire_turn(self: &Arc<Self>, shared: SharedSession, game_id: GameId, epoch: u64) {
        let mut live = Arc::clone(&shared).lock_owned().await;
        if live.is_evicted() || live.game.turn_epoch() != epoch {
            return;
        }
        // This task is the installed countdown; re-arming must not abort it.
        live.release_turn_timer();

        let events = match live.game.expire_turn(&*self.outcomes) {
            Ok(events) => events,
            Err(e) => {
                debug!(game_id = %game_id, error = %e, "Countdown fired in untimed phase");
                return;
            }
        };
        info!(game_id = %game_id, phase = ?live.game.phase(), "Turn countdown expired");

        self.arm_turn_timer(&shared, &mut *live);
        let snapshot = live.snapshot();
        drop(live);

        self.publish(&game_id, &events, &snapshot).await;
    }
}
