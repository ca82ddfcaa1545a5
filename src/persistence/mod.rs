//! Game Persistence
//!
//! Durable record of matches: status changes, resolved rounds and chat.
//! Writes are fire-and-forget from the router's point of view; they run on
//! a dedicated blocking worker (see [`worker`]) so a slow store never holds
//! a session lock or stalls a connection.
//!
//! Two gateways ship with the server:
//! - [`MemoryGateway`]: in-process, used by tests and when no journal path
//!   is configured.
//! - [`JournalGateway`]: append-only JSON-lines file replayed on startup.

pub mod journal;
pub mod memory;
pub mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::coin::CoinSide;
use crate::core::ids::{GameId, PlayerAddress};

pub use journal::JournalGateway;
pub use memory::MemoryGateway;
pub use worker::{PersistenceCommand, PersistenceHandle};

// =============================================================================
// ERRORS
// =============================================================================

/// Persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Worker queue full or closed, or the reply timed out.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),

    /// Journal file I/O failed.
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal entry could not be encoded or decoded.
    #[error("journal encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// RECORDS
// =============================================================================

/// Lifecycle status of a stored game.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Creator bound, waiting for an opponent.
    #[default]
    Waiting,
    /// Joiner bound, not started.
    Joined,
    /// Rounds in progress.
    Active,
    /// Winner decided.
    Completed,
}

/// One resolved round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    /// Game the round belongs to.
    pub game_id: GameId,
    /// Round number (1-based).
    pub round: u32,
    /// Flip outcome.
    pub result: CoinSide,
    /// Round winner.
    pub winner: PlayerAddress,
    /// Power the flipper charged.
    pub power: f64,
    /// When the round resolved.
    pub recorded_at: DateTime<Utc>,
}

/// Partial update of a stored game. `None` fields are left unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatusUpdate {
    /// New status.
    pub status: GameStatus,
    /// Creator address.
    pub creator: Option<PlayerAddress>,
    /// Joiner address.
    pub joiner: Option<PlayerAddress>,
    /// Joiner's proof of payment.
    pub entry_fee_hash: Option<String>,
    /// Series length.
    pub max_rounds: Option<u32>,
    /// Match winner.
    pub winner: Option<PlayerAddress>,
    /// Final creator score.
    pub creator_wins: Option<u32>,
    /// Final joiner score.
    pub joiner_wins: Option<u32>,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl GameStatusUpdate {
    /// Update that only changes the status.
    pub fn status(status: GameStatus) -> Self {
        Self { status, ..Default::default() }
    }
}

/// A stored game as returned by [`PersistenceGateway::get_game`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    /// Game identifier.
    pub game_id: GameId,
    /// Latest status.
    pub status: GameStatus,
    /// Creator address.
    pub creator: Option<PlayerAddress>,
    /// Joiner address.
    pub joiner: Option<PlayerAddress>,
    /// Joiner's proof of payment.
    pub entry_fee_hash: Option<String>,
    /// Series length.
    pub max_rounds: Option<u32>,
    /// Match winner.
    pub winner: Option<PlayerAddress>,
    /// Creator score.
    pub creator_wins: u32,
    /// Joiner score.
    pub joiner_wins: u32,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Resolved rounds in order.
    pub rounds: Vec<RoundRecord>,
}

impl GameRecord {
    /// Empty record for a game seen for the first time.
    pub fn new(game_id: GameId) -> Self {
        Self {
            game_id,
            status: GameStatus::Waiting,
            creator: None,
            joiner: None,
            entry_fee_hash: None,
            max_rounds: None,
            winner: None,
            creator_wins: 0,
            joiner_wins: 0,
            started_at: None,
            completed_at: None,
            rounds: Vec::new(),
        }
    }

    /// Merge a status update.
    pub fn apply(&mut self, update: GameStatusUpdate) {
        self.status = update.status;
        if update.creator.is_some() {
            self.creator = update.creator;
        }
        if update.joiner.is_some() {
            self.joiner = update.joiner;
        }
        if update.entry_fee_hash.is_some() {
            self.entry_fee_hash = update.entry_fee_hash;
        }
        if update.max_rounds.is_some() {
            self.max_rounds = update.max_rounds;
        }
        if update.winner.is_some() {
            self.winner = update.winner;
        }
        if let Some(wins) = update.creator_wins {
            self.creator_wins = wins;
        }
        if let Some(wins) = update.joiner_wins {
            self.joiner_wins = wins;
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
    }
}

/// One chat line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    /// Room (game) the message was sent to.
    pub room: GameId,
    /// Sender identity, if registered.
    pub from: Option<PlayerAddress>,
    /// Message text.
    pub message: String,
    /// Server receive time.
    pub sent_at: DateTime<Utc>,
}

// =============================================================================
// GATEWAY
// =============================================================================

/// Backing store for game history.
///
/// Implementations are driven from a single blocking worker thread, so they
/// may block and need no internal synchronization.
pub trait PersistenceGateway: Send + 'static {
    /// Append a resolved round.
    fn record_round(&mut self, round: RoundRecord) -> Result<(), PersistenceError>;

    /// Merge a status update into the stored game, creating it if needed.
    fn update_game_status(
        &mut self,
        game_id: &GameId,
        update: GameStatusUpdate,
    ) -> Result<(), PersistenceError>;

    /// Look up a stored game.
    fn get_game(&self, game_id: &GameId) -> Result<Option<GameRecord>, PersistenceError>;

    /// Append a chat line.
    fn record_chat(&mut self, chat: ChatRecord) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_keeps_unset_fields() {
        let mut record = GameRecord::new(GameId::new("g"));
        record.apply(GameStatusUpdate {
            status: GameStatus::Waiting,
            creator: Some(PlayerAddress::new("0xa")),
            max_rounds: Some(5),
            ..Default::default()
        });
        record.apply(GameStatusUpdate {
            status: GameStatus::Joined,
            joiner: Some(PlayerAddress::new("0xb")),
            ..Default::default()
        });
        record.apply(GameStatusUpdate::status(GameStatus::Active));

        assert_eq!(record.status, GameStatus::Active);
        assert_eq!(record.creator, Some(PlayerAddress::new("0xa")));
        assert_eq!(record.joiner, Some(PlayerAddress::new("0xb")));
        assert_eq!(record.max_rounds, Some(5));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = GameRecord::new(GameId::new("g-9"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["gameId"], "g-9");
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["creatorWins"], 0);
    }
}
