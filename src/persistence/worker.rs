//! Persistence Worker
//!
//! A single `spawn_blocking` task owns the gateway and drains commands in
//! submission order. The router only ever talks to the cloneable
//! [`PersistenceHandle`].

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ChatRecord, GameRecord, GameStatus, GameStatusUpdate, PersistenceError, PersistenceGateway,
    RoundRecord,
};
use crate::core::ids::GameId;
use crate::game::events::GameEvent;

/// How long `get_game` waits for the worker.
pub const GET_GAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Default command queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Work item for the persistence worker.
#[derive(Debug)]
pub enum PersistenceCommand {
    /// Append a resolved round.
    RecordRound(RoundRecord),
    /// Merge a status update.
    UpdateStatus {
        /// Target game.
        game_id: GameId,
        /// Fields to merge.
        update: GameStatusUpdate,
    },
    /// Append a chat line.
    RecordChat(ChatRecord),
    /// Read a game back.
    GetGame {
        /// Target game.
        game_id: GameId,
        /// Where to send the answer.
        reply: oneshot::Sender<Result<Option<GameRecord>, PersistenceError>>,
    },
}

impl PersistenceCommand {
    /// Durable write implied by a session event, if any.
    pub fn from_event(game_id: &GameId, event: &GameEvent) -> Option<Self> {
        let update = match event {
            GameEvent::CreatorJoined { creator, max_rounds } => GameStatusUpdate {
                status: GameStatus::Waiting,
                creator: Some(creator.clone()),
                max_rounds: Some(*max_rounds),
                ..Default::default()
            },
            GameEvent::JoinerJoined { joiner, entry_fee_hash } => GameStatusUpdate {
                status: GameStatus::Joined,
                joiner: Some(joiner.clone()),
                entry_fee_hash: entry_fee_hash.clone(),
                ..Default::default()
            },
            GameEvent::GameStarted { started_at, .. } => GameStatusUpdate {
                status: GameStatus::Active,
                started_at: Some(*started_at),
                ..Default::default()
            },
            GameEvent::FlipResolved { round, outcome, round_winner, power, .. } => {
                return Some(PersistenceCommand::RecordRound(RoundRecord {
                    game_id: game_id.clone(),
                    round: *round,
                    result: *outcome,
                    winner: round_winner.clone(),
                    power: *power,
                    recorded_at: Utc::now(),
                }));
            }
            GameEvent::GameCompleted { winner, creator_wins, joiner_wins, completed_at } => {
                GameStatusUpdate {
                    status: GameStatus::Completed,
                    winner: Some(winner.clone()),
                    creator_wins: Some(*creator_wins),
                    joiner_wins: Some(*joiner_wins),
                    completed_at: Some(*completed_at),
                    ..Default::default()
                }
            }
            _ => return None,
        };
        Some(PersistenceCommand::UpdateStatus {
            game_id: game_id.clone(),
            update,
        })
    }

    fn name(&self) -> &'static str {
        match self {
            PersistenceCommand::RecordRound(_) => "record_round",
            PersistenceCommand::UpdateStatus { .. } => "update_game_status",
            PersistenceCommand::RecordChat(_) => "record_chat",
            PersistenceCommand::GetGame { .. } => "get_game",
        }
    }
}

/// Sending side of the persistence queue.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistenceCommand>,
}

impl PersistenceHandle {
    /// Start the worker. It exits once every handle is dropped.
    pub fn spawn<G: PersistenceGateway>(gateway: G, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::task::spawn_blocking(move || run_worker(gateway, rx));
        (Self { tx }, worker)
    }

    /// Queue a write without waiting. A full or closed queue drops the
    /// command and logs it.
    pub fn submit(&self, command: PersistenceCommand) -> Result<(), PersistenceError> {
        let name = command.name();
        self.tx.try_send(command).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "worker stopped",
            };
            warn!(command = name, reason, "Dropping persistence command");
            PersistenceError::Unavailable(reason.to_string())
        })
    }

    /// Read a game back through the worker.
    pub async fn get_game(&self, game_id: GameId) -> Result<Option<GameRecord>, PersistenceError> {
        let (reply, rx) = oneshot::channel();
        let request = async {
            self.tx
                .send(PersistenceCommand::GetGame { game_id, reply })
                .await
                .map_err(|_| PersistenceError::Unavailable("worker stopped".into()))?;
            rx.await
                .map_err(|_| PersistenceError::Unavailable("worker dropped reply".into()))?
        };
        tokio::time::timeout(GET_GAME_TIMEOUT, request)
            .await
            .map_err(|_| PersistenceError::Unavailable("timed out".into()))?
    }
}

fn run_worker<G: PersistenceGateway>(mut gateway: G, mut rx: mpsc::Receiver<PersistenceCommand>) {
    info!("Persistence worker started");
    while let Some(command) = rx.blocking_recv() {
        let name = command.name();
        let result = match command {
            PersistenceCommand::RecordRound(round) => gateway.record_round(round),
            PersistenceCommand::UpdateStatus { game_id, update } => {
                gateway.update_game_status(&game_id, update)
            }
            PersistenceCommand::RecordChat(chat) => gateway.record_chat(chat),
            PersistenceCommand::GetGame { game_id, reply } => {
                // Requester may have timed out already
                let _ = reply.send(gateway.get_game(&game_id));
                Ok(())
            }
        };
        match result {
            Ok(()) => debug!(command = name, "Persistence command applied"),
            Err(e) => warn!(command = name, error = %e, "Persistence command failed"),
        }
    }
    info!("Persistence worker stopped");
}
