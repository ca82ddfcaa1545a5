//! Game State Definitions
//!
//! The authoritative per-match state. Mutation lives in `flow.rs`; this file
//! holds the data, configuration and the broadcastable snapshot.

use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::core::coin::CoinSide;
use crate::core::ids::{GameId, PlayerAddress};

/// Lowest power level a player can charge to.
pub const MIN_POWER: f64 = 0.0;

/// Highest power level a player can charge to.
pub const MAX_POWER: f64 = 10.0;

/// Default series length (best of five).
pub const DEFAULT_MAX_ROUNDS: u32 = 5;

/// Default per-turn countdown.
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(30);

/// Clamp a charge level into `[MIN_POWER, MAX_POWER]`. NaN counts as empty.
#[inline]
pub fn clamp_power(level: f64) -> f64 {
    if level.is_nan() {
        MIN_POWER
    } else {
        level.clamp(MIN_POWER, MAX_POWER)
    }
}

/// Wins needed to take a best-of-`max_rounds` series.
#[inline]
pub fn wins_needed(max_rounds: u32) -> u32 {
    max_rounds / 2 + 1
}

// =============================================================================
// PHASE / ROLE
// =============================================================================

/// Session state-machine phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum Phase {
    /// Waiting for players to bind and the match to start.
    #[default]
    Waiting,
    /// The turn holder picks a side.
    Choosing,
    /// Sides are locked in, waiting for the charge to begin.
    Charging,
    /// The turn holder is charging power.
    RoundActive,
    /// The coin landed; scores are being applied.
    RoundComplete,
    /// A side reached the win threshold. Terminal.
    GameComplete,
}

impl Phase {
    /// Whether charge operations are accepted.
    pub fn accepts_charge(self) -> bool {
        matches!(self, Phase::Charging | Phase::RoundActive)
    }

    /// Whether a countdown runs in this phase.
    pub fn is_timed(self) -> bool {
        matches!(self, Phase::Choosing | Phase::Charging | Phase::RoundActive)
    }
}

/// Seat of a participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Created the game and staked first.
    Creator,
    /// Accepted the wager.
    Joiner,
}

impl Role {
    /// The other seat.
    pub fn other(self) -> Self {
        match self {
            Role::Creator => Role::Joiner,
            Role::Joiner => Role::Creator,
        }
    }
}

/// Who acts after a round resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum TurnPolicy {
    /// The turn passes to the other player every round.
    #[default]
    Alternate,
    /// The creator chooses and charges every round.
    CreatorAlways,
}

// =============================================================================
// CONFIG
// =============================================================================

/// Per-session rules.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Series length, odd.
    pub max_rounds: u32,
    /// Countdown before the server acts for an idle turn holder.
    pub turn_timeout: Duration,
    /// Turn hand-off rule.
    pub turn_policy: TurnPolicy,
    /// Side assigned to a turn holder who lets the choice countdown expire.
    pub default_choice: CoinSide,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            turn_policy: TurnPolicy::Alternate,
            default_choice: CoinSide::Heads,
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Authoritative state of one match.
///
/// Fields are crate-visible for the transition code in `flow.rs`; outside
/// the game module everything goes through the operations and
/// [`GameSession::snapshot`].
#[derive(Debug, Clone)]
pub struct GameSession {
    pub(crate) game_id: GameId,
    pub(crate) config: SessionConfig,
    pub(crate) creator: Option<PlayerAddress>,
    pub(crate) joiner: Option<PlayerAddress>,
    pub(crate) entry_fee_hash: Option<String>,
    pub(crate) phase: Phase,
    pub(crate) max_rounds: u32,
    pub(crate) current_round: u32,
    pub(crate) creator_wins: u32,
    pub(crate) joiner_wins: u32,
    pub(crate) creator_choice: Option<CoinSide>,
    pub(crate) joiner_choice: Option<CoinSide>,
    pub(crate) creator_power: f64,
    pub(crate) joiner_power: f64,
    pub(crate) current_turn: Option<PlayerAddress>,
    pub(crate) winner: Option<PlayerAddress>,
    pub(crate) last_outcome: Option<CoinSide>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) turn_epoch: u64,
}

impl GameSession {
    /// Create an empty session in `Waiting`.
    pub fn new(game_id: GameId, config: SessionConfig) -> Self {
        let max_rounds = config.max_rounds;
        Self {
            game_id,
            config,
            creator: None,
            joiner: None,
            entry_fee_hash: None,
            phase: Phase::Waiting,
            max_rounds,
            current_round: 1,
            creator_wins: 0,
            joiner_wins: 0,
            creator_choice: None,
            joiner_choice: None,
            creator_power: MIN_POWER,
            joiner_power: MIN_POWER,
            current_turn: None,
            winner: None,
            last_outcome: None,
            started_at: None,
            turn_epoch: 0,
        }
    }

    /// Session identifier.
    pub fn game_id(&self) -> &GameId {
        &self.game_id
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Rules this session runs with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bound creator, if any.
    pub fn creator(&self) -> Option<&PlayerAddress> {
        self.creator.as_ref()
    }

    /// Bound joiner, if any.
    pub fn joiner(&self) -> Option<&PlayerAddress> {
        self.joiner.as_ref()
    }

    /// Player who acts next.
    pub fn current_turn(&self) -> Option<&PlayerAddress> {
        self.current_turn.as_ref()
    }

    /// Current round number (1-based).
    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    /// Round wins as `(creator, joiner)`.
    pub fn scores(&self) -> (u32, u32) {
        (self.creator_wins, self.joiner_wins)
    }

    /// Match winner, set only in `GameComplete`.
    pub fn winner(&self) -> Option<&PlayerAddress> {
        self.winner.as_ref()
    }

    /// Changes whenever the phase or turn holder changes.
    pub fn turn_epoch(&self) -> u64 {
        self.turn_epoch
    }

    /// Seat held by `who`, if they are a participant.
    pub fn role_of(&self, who: &PlayerAddress) -> Option<Role> {
        if self.creator.as_ref() == Some(who) {
            Some(Role::Creator)
        } else if self.joiner.as_ref() == Some(who) {
            Some(Role::Joiner)
        } else {
            None
        }
    }

    /// Address sitting in `role`.
    pub fn player_in(&self, role: Role) -> Option<&PlayerAddress> {
        match role {
            Role::Creator => self.creator.as_ref(),
            Role::Joiner => self.joiner.as_ref(),
        }
    }

    /// Side chosen by `role` this round.
    pub fn choice_of(&self, role: Role) -> Option<CoinSide> {
        match role {
            Role::Creator => self.creator_choice,
            Role::Joiner => self.joiner_choice,
        }
    }

    /// Power charged by `role` this round.
    pub fn power_of(&self, role: Role) -> f64 {
        match role {
            Role::Creator => self.creator_power,
            Role::Joiner => self.joiner_power,
        }
    }

    /// Number of rounds resolved so far.
    pub fn rounds_resolved(&self) -> u32 {
        self.creator_wins + self.joiner_wins
    }

    /// Immutable view for broadcast. `viewers` is the attached connection count.
    pub fn snapshot(&self, viewers: usize) -> SessionSnapshot {
        SessionSnapshot {
            game_id: self.game_id.clone(),
            creator: self.creator.clone(),
            joiner: self.joiner.clone(),
            phase: self.phase,
            max_rounds: self.max_rounds,
            current_round: self.current_round,
            creator_wins: self.creator_wins,
            joiner_wins: self.joiner_wins,
            creator_choice: self.creator_choice,
            joiner_choice: self.joiner_choice,
            creator_power: self.creator_power,
            joiner_power: self.joiner_power,
            current_turn: self.current_turn.clone(),
            winner: self.winner.clone(),
            last_outcome: self.last_outcome,
            started_at: self.started_at,
            spectators: viewers,
        }
    }
}

/// Full session state as sent to clients with every post-mutation broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session identifier.
    pub game_id: GameId,
    /// Creator address.
    pub creator: Option<PlayerAddress>,
    /// Joiner address.
    pub joiner: Option<PlayerAddress>,
    /// Current phase.
    pub phase: Phase,
    /// Series length.
    pub max_rounds: u32,
    /// Current round (1-based).
    pub current_round: u32,
    /// Rounds won by the creator.
    pub creator_wins: u32,
    /// Rounds won by the joiner.
    pub joiner_wins: u32,
    /// Creator's side this round.
    pub creator_choice: Option<CoinSide>,
    /// Joiner's side this round.
    pub joiner_choice: Option<CoinSide>,
    /// Creator's charge this round.
    pub creator_power: f64,
    /// Joiner's charge this round.
    pub joiner_power: f64,
    /// Player who acts next.
    pub current_turn: Option<PlayerAddress>,
    /// Match winner.
    pub winner: Option<PlayerAddress>,
    /// Most recent flip outcome.
    pub last_outcome: Option<CoinSide>,
    /// When the match started.
    pub started_at: Option<DateTime<Utc>>,
    /// Attached connections (players and spectators).
    pub spectators: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_power() {
        assert_eq!(clamp_power(7.0), 7.0);
        assert_eq!(clamp_power(-3.0), MIN_POWER);
        assert_eq!(clamp_power(42.0), MAX_POWER);
        assert_eq!(clamp_power(f64::NAN), MIN_POWER);
        assert_eq!(clamp_power(f64::INFINITY), MAX_POWER);
    }

    #[test]
    fn test_wins_needed() {
        assert_eq!(wins_needed(1), 1);
        assert_eq!(wins_needed(3), 2);
        assert_eq!(wins_needed(5), 3);
        assert_eq!(wins_needed(7), 4);
    }

    #[test]
    fn test_new_session_is_waiting() {
        let session = GameSession::new(GameId::new("g"), SessionConfig::default());
        assert_eq!(session.phase(), Phase::Waiting);
        assert_eq!(session.current_round(), 1);
        assert_eq!(session.scores(), (0, 0));
        assert!(session.winner().is_none());
        assert!(session.current_turn().is_none());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let session = GameSession::new(GameId::new("g-1"), SessionConfig::default());
        let json = serde_json::to_value(session.snapshot(3)).unwrap();
        assert_eq!(json["gameId"], "g-1");
        assert_eq!(json["phase"], "waiting");
        assert_eq!(json["maxRounds"], 5);
        assert_eq!(json["currentRound"], 1);
        assert_eq!(json["spectators"], 3);
        assert!(json["creatorChoice"].is_null());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(serde_json::to_string(&Phase::RoundActive).unwrap(), "\"round_active\"");
        assert_eq!(serde_json::to_string(&Phase::GameComplete).unwrap(), "\"game_complete\"");
    }
}
