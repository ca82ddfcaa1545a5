//! # Coin Flip Session Server
//!
//! Authoritative server for best-of-N NFT coin flip matches between a
//! creator and a joiner, with any number of spectators watching live.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    COIN FLIP SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── ids.rs      - Game, player and connection identifiers   │
//! │  ├── coin.rs     - Coin sides                                │
//! │  └── rng.rs      - Injectable outcome sources                │
//! │                                                              │
//! │  game/           - Session rules (no I/O)                    │
//! │  ├── state.rs    - Session state, config, snapshots          │
//! │  ├── flow.rs     - Phase transitions and round resolution    │
//! │  └── events.rs   - Events emitted by transitions             │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server, config, idle sweep      │
//! │  ├── router.rs   - Message dispatch and turn countdowns      │
//! │  ├── hub.rs      - Connections, rooms, identities            │
//! │  ├── session.rs  - Live session registry                     │
//! │  └── protocol.rs - Message types                             │
//! │                                                              │
//! │  persistence/    - Durable game records                      │
//! │  ├── worker.rs   - Blocking writer fed by a bounded queue    │
//! │  ├── memory.rs   - In-process store                          │
//! │  └── journal.rs  - Append-only JSON-lines store              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Every mutation of a session runs under that session's lock and every
//! broadcast carries the snapshot taken before the lock was released, so
//! all connections in a room observe the same sequence of states. Sessions
//! are independent of each other.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod persistence;

// Re-export commonly used types
pub use crate::core::coin::CoinSide;
pub use crate::core::ids::{ConnectionId, GameId, PlayerAddress};
pub use crate::core::rng::{EntropySource, OutcomeSource, SeededSource};
pub use crate::game::state::{GameSession, Phase, Role, SessionConfig, SessionSnapshot};
pub use crate::network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
