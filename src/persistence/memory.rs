//! In-memory game history.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    ChatRecord, GameRecord, GameStatusUpdate, PersistenceError, PersistenceGateway, RoundRecord,
};
use crate::core::ids::GameId;

/// Game records and chat lines, keyed by game.
#[derive(Debug, Default, Clone)]
pub struct Ledger {
    games: BTreeMap<GameId, GameRecord>,
    chats: Vec<ChatRecord>,
}

impl Ledger {
    /// Append a round to its game, creating the record if needed.
    pub fn record_round(&mut self, round: RoundRecord) {
        let record = self
            .games
            .entry(round.game_id.clone())
            .or_insert_with(|| GameRecord::new(round.game_id.clone()));
        record.rounds.push(round);
    }

    /// Merge a status update.
    pub fn update_game_status(&mut self, game_id: &GameId, update: GameStatusUpdate) {
        self.games
            .entry(game_id.clone())
            .or_insert_with(|| GameRecord::new(game_id.clone()))
            .apply(update);
    }

    /// Append a chat line.
    pub fn record_chat(&mut self, chat: ChatRecord) {
        self.chats.push(chat);
    }

    /// Stored game, if any.
    pub fn game(&self, game_id: &GameId) -> Option<&GameRecord> {
        self.games.get(game_id)
    }

    /// Chat lines for a room, oldest first.
    pub fn chats_for(&self, room: &GameId) -> Vec<ChatRecord> {
        self.chats.iter().filter(|c| &c.room == room).cloned().collect()
    }

    /// Number of stored games.
    pub fn game_count(&self) -> usize {
        self.games.len()
    }
}

/// Gateway backed by a shared [`Ledger`].
///
/// Clones share the same ledger, so a test can keep one clone for
/// inspection while the worker owns the other.
#[derive(Debug, Default, Clone)]
pub struct MemoryGateway {
    ledger: Arc<Mutex<Ledger>>,
}

impl MemoryGateway {
    /// Create an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current ledger.
    pub fn ledger(&self) -> Ledger {
        self.ledger.lock().clone()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn record_round(&mut self, round: RoundRecord) -> Result<(), PersistenceError> {
        self.ledger.lock().record_round(round);
        Ok(())
    }

    fn update_game_status(
        &mut self,
        game_id: &GameId,
        update: GameStatusUpdate,
    ) -> Result<(), PersistenceError> {
        self.ledger.lock().update_game_status(game_id, update);
        Ok(())
    }

    fn get_game(&self, game_id: &GameId) -> Result<Option<GameRecord>, PersistenceError> {
        Ok(self.ledger.lock().game(game_id).cloned())
    }

    fn record_chat(&mut self, chat: ChatRecord) -> Result<(), PersistenceError> {
        self.ledger.lock().record_chat(chat);
        Ok(())
    }
}
