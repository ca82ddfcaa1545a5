//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every frame
//! is a JSON object discriminated by `type`; game actions carry a second
//! discriminator, `action`.

use serde::{Deserialize, Serialize};

use crate::core::coin::CoinSide;
use crate::core::ids::{GameId, PlayerAddress};
use crate::game::events::FlipTrigger;
use crate::game::flow::GameError;
use crate::game::state::{Phase, Role, SessionSnapshot};
use crate::persistence::GameRecord;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Watch a room, creating the session if needed.
    JoinRoom {
        /// Room (game) to join.
        room_id: GameId,
    },

    /// Stop watching the current room.
    LeaveRoom {
        /// Room to leave; defaults to the current one.
        #[serde(default)]
        room_id: Option<GameId>,
    },

    /// Bind a wallet address to this connection.
    RegisterUser {
        /// Wallet address.
        address: PlayerAddress,
    },

    /// Chat line for a room.
    ChatMessage {
        /// Target room; defaults to the current one.
        #[serde(default)]
        room_id: Option<GameId>,
        /// Message text.
        message: String,
        /// Display name when no identity is bound.
        #[serde(default)]
        from: Option<PlayerAddress>,
    },

    /// Create a game and take the creator seat.
    CreateGame {
        /// New game id.
        game_id: GameId,
        /// Creator wallet.
        address: PlayerAddress,
        /// Series length.
        #[serde(default)]
        max_rounds: Option<u32>,
    },

    /// Join a game as creator, joiner or spectator.
    JoinGame {
        /// Target game.
        game_id: GameId,
        /// Requested seat.
        #[serde(default)]
        role: JoinRole,
        /// Wallet, if not registered yet.
        #[serde(default)]
        address: Option<PlayerAddress>,
        /// Joiner's proof of payment.
        #[serde(default)]
        entry_fee_hash: Option<String>,
        /// Series length (creator only).
        #[serde(default)]
        max_rounds: Option<u32>,
    },

    /// Start the series.
    StartGame {
        /// Target game.
        game_id: GameId,
    },

    /// Fetch the stored record of a game.
    GetGameData {
        /// Target game.
        game_id: GameId,
    },

    /// Offer an NFT to a game's creator.
    NftOffer {
        /// Target game.
        game_id: GameId,
        /// Who is offering.
        offerer_address: PlayerAddress,
        /// Opaque NFT description.
        nft: serde_json::Value,
        /// Client time of the offer.
        #[serde(default)]
        timestamp: Option<i64>,
    },

    /// Creator accepted an offer.
    OfferAccepted {
        /// Target game.
        game_id: GameId,
        /// Accepting creator.
        creator_address: PlayerAddress,
        /// The offer being accepted, as sent in `nft_offer`.
        accepted_offer: serde_json::Value,
        /// Client time of acceptance.
        #[serde(default)]
        timestamp: Option<i64>,
    },

    /// Latency probe.
    Ping {
        /// Client time, echoed back.
        #[serde(default)]
        timestamp: Option<i64>,
    },

    /// In-game action.
    #[serde(rename = "GAME_ACTION")]
    GameAction(GameAction),
}

/// Seat requested by `join_game`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinRole {
    /// Creator seat.
    Creator,
    /// Joiner seat.
    Joiner,
    /// Watch only.
    #[default]
    Spectator,
}

/// `GAME_ACTION` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameAction {
    /// Target game.
    pub game_id: GameId,
    /// Claimed actor; must match the connection's identity when present.
    #[serde(default)]
    pub player: Option<PlayerAddress>,
    /// Round the action refers to.
    #[serde(default)]
    pub round: Option<u32>,
    /// The action itself.
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// Game action kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ActionKind {
    /// Pick a side.
    MakeChoice {
        /// Chosen side.
        choice: CoinSide,
    },
    /// Begin charging.
    PowerChargeStart,
    /// Intermediate power level.
    PowerUpdate {
        /// Level in `[0, 10]`.
        power_level: f64,
    },
    /// Final power level; flips the coin.
    PowerCharged {
        /// Level in `[0, 10]`.
        power_level: f64,
    },
    /// Flip immediately.
    AutoFlip {
        /// Side to lock in if none is chosen yet.
        #[serde(default)]
        choice: Option<CoinSide>,
    },
    /// Client-side countdown expired.
    AutoFlipTimeout {
        /// Side to lock in if none is chosen yet.
        #[serde(default)]
        choice: Option<CoinSide>,
    },
}

impl ActionKind {
    /// Wire name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::MakeChoice { .. } => "MAKE_CHOICE",
            ActionKind::PowerChargeStart => "POWER_CHARGE_START",
            ActionKind::PowerUpdate { .. } => "POWER_UPDATE",
            ActionKind::PowerCharged { .. } => "POWER_CHARGED",
            ActionKind::AutoFlip { .. } => "AUTO_FLIP",
            ActionKind::AutoFlipTimeout { .. } => "AUTO_FLIP_TIMEOUT",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Outbound frame: `{type, gameId?, ...fields, timestamp, state?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    /// Event type and fields.
    #[serde(flatten)]
    pub event: ServerEvent,
    /// Game the event belongs to.
    #[serde(rename = "gameId", skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
    /// Server time in Unix milliseconds.
    pub timestamp: i64,
    /// Full session state after the mutation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionSnapshot>,
}

impl ServerMessage {
    /// Stamp an event with the current time.
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event,
            game_id: None,
            timestamp: now_millis(),
            state: None,
        }
    }

    /// Tag with a game id.
    pub fn in_game(mut self, game_id: &GameId) -> Self {
        self.game_id = Some(game_id.clone());
        self
    }

    /// Attach a session snapshot.
    pub fn with_state(mut self, state: SessionSnapshot) -> Self {
        self.state = Some(state);
        self
    }

    /// Error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ServerEvent::Error {
            error: message.into(),
            code,
        })
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outbound event types.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Reply to `join_room`.
    RoomJoined {
        /// Joined room.
        room_id: GameId,
        /// Connections now in the room.
        members: usize,
    },

    /// Reply to `register_user`.
    UserRegistered {
        /// Bound address.
        address: PlayerAddress,
    },

    /// Viewer count changed.
    SpectatorUpdate {
        /// Attached connections.
        spectators: usize,
    },

    /// Creator seat bound.
    CreatorJoined {
        /// Creator address.
        creator: PlayerAddress,
        /// Series length.
        max_rounds: u32,
    },

    /// Joiner seat bound.
    PlayerJoined {
        /// Joiner address.
        joiner: PlayerAddress,
        /// Joiner's proof of payment.
        entry_fee_hash: Option<String>,
    },

    /// Series started.
    GameStarted {
        /// First turn holder.
        current_turn: PlayerAddress,
        /// Start time.
        started_at: chrono::DateTime<chrono::Utc>,
    },

    /// Reply to `join_game`; the snapshot travels in `state`.
    GameState {
        /// Seat granted to the requester.
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<JoinRole>,
    },

    /// A side was picked.
    PlayerChoiceMade {
        /// Who picked.
        player: PlayerAddress,
        /// Their seat.
        role: Role,
        /// Picked side.
        choice: CoinSide,
    },

    /// Sides locked; charging may begin.
    ChoiceMadeReadyToFlip {
        /// Round number.
        round: u32,
        /// Creator's side.
        creator_choice: CoinSide,
        /// Joiner's side.
        joiner_choice: CoinSide,
        /// Charger.
        current_turn: PlayerAddress,
    },

    /// Charging began.
    PowerChargeStarted {
        /// Charger.
        player: PlayerAddress,
    },

    /// Intermediate power.
    PowerUpdate {
        /// Charger.
        player: PlayerAddress,
        /// Clamped level.
        power_level: f64,
    },

    /// Final power.
    PowerCharged {
        /// Charger.
        player: PlayerAddress,
        /// Clamped level.
        power_level: f64,
    },

    /// The coin is in the air.
    #[serde(rename = "FLIP_STARTED")]
    FlipStarted {
        /// Round number.
        round: u32,
        /// Turn holder.
        flipper: PlayerAddress,
        /// Power used.
        power: f64,
        /// What triggered the flip.
        trigger: FlipTrigger,
    },

    /// The coin landed.
    FlipResult {
        /// Round number.
        round: u32,
        /// Outcome.
        result: CoinSide,
        /// Round winner.
        round_winner: PlayerAddress,
        /// Turn holder.
        flipper: PlayerAddress,
        /// Power used.
        power: f64,
        /// Creator's side.
        creator_choice: CoinSide,
        /// Joiner's side.
        joiner_choice: CoinSide,
        /// Always `round_complete`.
        phase: Phase,
    },

    /// Score after a round.
    ScoreUpdate {
        /// Creator round wins.
        creator_wins: u32,
        /// Joiner round wins.
        joiner_wins: u32,
    },

    /// Next round open.
    RoundStarted {
        /// Round number.
        round: u32,
        /// Turn holder.
        current_turn: PlayerAddress,
    },

    /// Server countdown ran out.
    TurnTimeout {
        /// Idle turn holder.
        player: PlayerAddress,
        /// Phase that timed out.
        phase: Phase,
    },

    /// Series decided.
    GameCompleted {
        /// Match winner.
        winner: PlayerAddress,
        /// Creator round wins.
        creator_wins: u32,
        /// Joiner round wins.
        joiner_wins: u32,
        /// Completion time.
        completed_at: chrono::DateTime<chrono::Utc>,
    },

    /// Chat line.
    ChatMessage {
        /// Room.
        room_id: GameId,
        /// Sender.
        from: Option<PlayerAddress>,
        /// Text.
        message: String,
    },

    /// NFT offer relayed to the room.
    NftOfferReceived {
        /// Who is offering.
        offerer_address: PlayerAddress,
        /// Opaque NFT description.
        nft: serde_json::Value,
        /// Offer time.
        offered_at: i64,
    },

    /// Offer acceptance relayed to the room and the offerer.
    NftOfferAccepted {
        /// Accepting creator.
        creator_address: PlayerAddress,
        /// The accepted offer.
        accepted_offer: serde_json::Value,
        /// Acceptance time.
        accepted_at: i64,
    },

    /// Reply to `get_game_data`.
    GameDataResponse {
        /// Stored record, if any.
        game: Option<GameRecord>,
    },

    /// Reply to `ping`.
    Pong {
        /// Echoed client time.
        client_timestamp: Option<i64>,
        /// Server time.
        server_time: i64,
    },

    /// Server going down.
    Shutdown {
        /// Why.
        reason: String,
    },

    /// Request rejected.
    Error {
        /// Human-readable message.
        error: String,
        /// Stable code.
        code: ErrorCode,
    },
}

impl ServerEvent {
    /// Wire `type` for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::RoomJoined { .. } => "room_joined",
            ServerEvent::UserRegistered { .. } => "user_registered",
            ServerEvent::SpectatorUpdate { .. } => "spectator_update",
            ServerEvent::CreatorJoined { .. } => "creator_joined",
            ServerEvent::PlayerJoined { .. } => "player_joined",
            ServerEvent::GameStarted { .. } => "game_started",
            ServerEvent::GameState { .. } => "game_state",
            ServerEvent::PlayerChoiceMade { .. } => "player_choice_made",
            ServerEvent::ChoiceMadeReadyToFlip { .. } => "choice_made_ready_to_flip",
            ServerEvent::PowerChargeStarted { .. } => "power_charge_started",
            ServerEvent::PowerUpdate { .. } => "power_update",
            ServerEvent::PowerCharged { .. } => "power_charged",
            ServerEvent::FlipStarted { .. } => "FLIP_STARTED",
            ServerEvent::FlipResult { .. } => "flip_result",
            ServerEvent::ScoreUpdate { .. } => "score_update",
            ServerEvent::RoundStarted { .. } => "round_started",
            ServerEvent::TurnTimeout { .. } => "turn_timeout",
            ServerEvent::GameCompleted { .. } => "game_completed",
            ServerEvent::ChatMessage { .. } => "chat_message",
            ServerEvent::NftOfferReceived { .. } => "nft_offer_received",
            ServerEvent::NftOfferAccepted { .. } => "nft_offer_accepted",
            ServerEvent::GameDataResponse { .. } => "game_data_response",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Shutdown { .. } => "shutdown",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Caller holds no seat.
    NotParticipant,
    /// Wrong phase for the action.
    WrongPhase,
    /// Another player holds the turn.
    NotYourTurn,
    /// Side already picked.
    AlreadyChosen,
    /// Round already decided.
    RoundAlreadyResolved,
    /// Joined own game.
    SelfPlay,
    /// Seat held by someone else.
    SeatTaken,
    /// No creator yet.
    NoCreator,
    /// Both players required.
    PlayersMissing,
    /// Bad series length.
    InvalidRounds,
    /// No such session.
    UnknownSession,
    /// Unparseable or incomplete message.
    MalformedMessage,
    /// Connection not registered.
    UnknownConnection,
    /// No connection bound to the identity.
    UnknownIdentity,
    /// Outbound queue full or closed.
    DeliveryFailure,
    /// Store unavailable.
    PersistenceFailure,
}

impl From<&GameError> for ErrorCode {
    fn from(e: &GameError) -> Self {
        match e {
            GameError::NotParticipant => ErrorCode::NotParticipant,
            GameError::WrongPhase { .. } => ErrorCode::WrongPhase,
            GameError::NotYourTurn => ErrorCode::NotYourTurn,
            GameError::AlreadyChosen => ErrorCode::AlreadyChosen,
            GameError::RoundAlreadyResolved => ErrorCode::RoundAlreadyResolved,
            GameError::SelfPlay => ErrorCode::SelfPlay,
            GameError::SeatTaken => ErrorCode::SeatTaken,
            GameError::NoCreator => ErrorCode::NoCreator,
            GameError::PlayersMissing => ErrorCode::PlayersMissing,
            GameError::InvalidRounds(_) => ErrorCode::InvalidRounds,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
