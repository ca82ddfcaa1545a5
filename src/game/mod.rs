//! Game Session Logic
//!
//! The per-match state machine. Pure and synchronous: no I/O, no clocks
//! beyond timestamps, randomness only through [`OutcomeSource`].
//!
//! [`OutcomeSource`]: crate::core::rng::OutcomeSource

pub mod events;
pub mod flow;
pub mod state;

pub use events::{FlipTrigger, GameEvent};
pub use flow::{FlowResult, GameError};
pub use state::{
    clamp_power, wins_needed, GameSession, Phase, Role, SessionConfig, SessionSnapshot,
    TurnPolicy, MAX_POWER, MIN_POWER,
};
