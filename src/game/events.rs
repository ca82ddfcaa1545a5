//! Game Events
//!
//! Discrete transitions reported by session operations, in the order they
//! happened. The router turns them into wire messages and persistence writes.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::coin::CoinSide;
use crate::core::ids::PlayerAddress;
use crate::game::state::{Phase, Role};

/// How a forced flip was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipTrigger {
    /// The turn holder finished charging.
    Charged,
    /// The turn holder asked for an immediate flip.
    AutoFlip,
    /// A participant reported the turn countdown expired.
    Timeout,
    /// The server countdown expired.
    ServerTimeout,
}

/// Something that happened inside a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GameEvent {
    /// Creator seat bound.
    CreatorJoined {
        /// Creator address.
        creator: PlayerAddress,
        /// Series length.
        max_rounds: u32,
    },

    /// Joiner seat bound.
    JoinerJoined {
        /// Joiner address.
        joiner: PlayerAddress,
        /// Entry fee transaction hash.
        entry_fee_hash: Option<String>,
    },

    /// Match started; round 1 begins.
    GameStarted {
        /// Start time.
        started_at: DateTime<Utc>,
        /// First turn holder.
        current_turn: PlayerAddress,
    },

    /// A player picked a side.
    ChoiceMade {
        /// Player who picked.
        player: PlayerAddress,
        /// Their seat.
        role: Role,
        /// Side picked.
        choice: CoinSide,
    },

    /// Both sides are locked in and charging may begin.
    ChoicesLocked {
        /// Round the sides apply to.
        round: u32,
        /// Creator's side.
        creator_choice: CoinSide,
        /// Joiner's side.
        joiner_choice: CoinSide,
        /// Player who charges.
        current_turn: PlayerAddress,
    },

    /// The turn holder began charging.
    ChargeStarted {
        /// Charging player.
        player: PlayerAddress,
    },

    /// Intermediate power level.
    PowerUpdated {
        /// Charging player.
        player: PlayerAddress,
        /// Clamped power level.
        level: f64,
    },

    /// Final power level before the flip.
    PowerCharged {
        /// Charging player.
        player: PlayerAddress,
        /// Clamped power level.
        level: f64,
    },

    /// The coin is in the air.
    FlipStarted {
        /// Round being flipped.
        round: u32,
        /// Player credited with the flip.
        flipper: PlayerAddress,
        /// Power used.
        power: f64,
        /// What caused the flip.
        trigger: FlipTrigger,
    },

    /// The coin landed and the round has a winner.
    FlipResolved {
        /// Round resolved.
        round: u32,
        /// Side that landed.
        outcome: CoinSide,
        /// Player whose side matched.
        round_winner: PlayerAddress,
        /// Player credited with the flip.
        flipper: PlayerAddress,
        /// Power used.
        power: f64,
        /// Creator's side.
        creator_choice: CoinSide,
        /// Joiner's side.
        joiner_choice: CoinSide,
    },

    /// Series score after a round.
    ScoreUpdated {
        /// Rounds won by the creator.
        creator_wins: u32,
        /// Rounds won by the joiner.
        joiner_wins: u32,
    },

    /// Next round is open for choosing.
    RoundStarted {
        /// New round number.
        round: u32,
        /// Player who picks.
        current_turn: PlayerAddress,
    },

    /// The turn countdown ran out.
    TurnExpired {
        /// Idle turn holder.
        player: PlayerAddress,
        /// Phase the countdown covered.
        phase: Phase,
    },

    /// A side reached the win threshold.
    GameCompleted {
        /// Match winner.
        winner: PlayerAddress,
        /// Final creator score.
        creator_wins: u32,
        /// Final joiner score.
        joiner_wins: u32,
        /// Completion time.
        completed_at: DateTime<Utc>,
    },
}

impl GameEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::CreatorJoined { .. } => "creator_joined",
            GameEvent::JoinerJoined { .. } => "joiner_joined",
            GameEvent::GameStarted { .. } => "game_started",
            GameEvent::ChoiceMade { .. } => "choice_made",
            GameEvent::ChoicesLocked { .. } => "choices_locked",
            GameEvent::ChargeStarted { .. } => "charge_started",
            GameEvent::PowerUpdated { .. } => "power_updated",
            GameEvent::PowerCharged { .. } => "power_charged",
            GameEvent::FlipStarted { .. } => "flip_started",
            GameEvent::FlipResolved { .. } => "flip_resolved",
            GameEvent::ScoreUpdated { .. } => "score_updated",
            GameEvent::RoundStarted { .. } => "round_started",
            GameEvent::TurnExpired { .. } => "turn_expired",
            GameEvent::GameCompleted { .. } => "game_completed",
        }
    }
}
