//! Network Layer
//!
//! WebSocket server for real-time coin flip sessions.
//! Session rules live in `game/`; this layer owns connections, rooms,
//! countdowns and the wire protocol.

pub mod hub;
pub mod protocol;
pub mod router;
pub mod session;
pub mod server;

pub use hub::{ConnectionHub, HubError, OutboundFrame, OutboundSender};
pub use protocol::{
    ActionKind, ClientMessage, ErrorCode, GameAction, JoinRole, ServerEvent, ServerMessage,
};
pub use router::{Router, RouterError};
pub use session::{LiveSession, SessionError, SessionStore, SharedSession};
pub use server::{ConfigError, GameServer, GameServerError, ServerConfig};
