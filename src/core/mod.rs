//! Core primitives.
//!
//! Identifiers, coin sides and the injectable outcome source. Nothing in
//! here knows about sessions or the network.

pub mod coin;
pub mod ids;
pub mod rng;

// Re-export core types
pub use coin::CoinSide;
pub use ids::{ConnectionId, GameId, PlayerAddress};
pub use rng::{EntropySource, OutcomeSource, ScriptedSource, SeededSource};
