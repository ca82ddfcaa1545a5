//! Session Transitions
//!
//! Every operation validates first and mutates second, so a rejected call
//! leaves the session untouched. Successful calls return the events they
//! produced, in order.
//!
//! Round flow (turn-based, single charger):
//!
//! ```text
//! Waiting --start_game--> Choosing --submit_choice--> Charging
//!     --start_charging--> RoundActive --stop_charging--> RoundComplete
//!     --> Choosing (next round) | GameComplete
//! ```

use chrono::Utc;

use crate::core::coin::CoinSide;
use crate::core::ids::PlayerAddress;
use crate::core::rng::OutcomeSource;
use crate::game::events::{FlipTrigger, GameEvent};
use crate::game::state::{
    clamp_power, wins_needed, GameSession, Phase, Role, TurnPolicy, MIN_POWER,
};

/// Rejected session operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    /// Caller holds no seat in this session.
    #[error("not a participant in this game")]
    NotParticipant,

    /// Operation not valid in the current phase.
    #[error("action not allowed while the game is {phase:?}")]
    WrongPhase {
        /// Phase at the time of the call.
        phase: Phase,
    },

    /// Another player holds the turn.
    #[error("not your turn")]
    NotYourTurn,

    /// Caller already has a side this round.
    #[error("choice already made this round")]
    AlreadyChosen,

    /// The round (or the whole match) is already decided.
    #[error("round already resolved")]
    RoundAlreadyResolved,

    /// Joiner tried to join their own game.
    #[error("a player cannot play against themselves")]
    SelfPlay,

    /// Seat is held by someone else.
    #[error("seat already taken")]
    SeatTaken,

    /// Joiner arrived before any creator.
    #[error("game has no creator yet")]
    NoCreator,

    /// Start requested without both players.
    #[error("both players must join before the game starts")]
    PlayersMissing,

    /// Series length is not a positive odd number.
    #[error("invalid round count {0}: must be odd and at least 1")]
    InvalidRounds(u32),
}

/// Result of a session operation.
pub type FlowResult = Result<Vec<GameEvent>, GameError>;

fn check_rounds(max_rounds: u32) -> Result<(), GameError> {
    if max_rounds == 0 || max_rounds % 2 == 0 {
        Err(GameError::InvalidRounds(max_rounds))
    } else {
        Ok(())
    }
}

impl GameSession {
    // =========================================================================
    // SEATS
    // =========================================================================

    /// Bind the creator seat. Idempotent for the same address.
    pub fn set_creator(&mut self, who: &PlayerAddress) -> FlowResult {
        self.claim_creator(who, None)
    }

    /// Bind the creator seat and optionally fix the series length in one
    /// step. A returning creator after the start is accepted and the round
    /// count is ignored.
    pub fn claim_creator(&mut self, who: &PlayerAddress, max_rounds: Option<u32>) -> FlowResult {
        if let Some(n) = max_rounds {
            check_rounds(n)?;
        }
        if self.creator.as_ref() == Some(who) {
            if let (Some(n), Phase::Waiting) = (max_rounds, self.phase) {
                self.max_rounds = n;
            }
            return Ok(Vec::new());
        }
        if self.phase != Phase::Waiting {
            return Err(GameError::WrongPhase { phase: self.phase });
        }
        if self.creator.is_some() {
            return Err(GameError::SeatTaken);
        }
        if self.joiner.as_ref() == Some(who) {
            return Err(GameError::SelfPlay);
        }

        self.creator = Some(who.clone());
        if let Some(n) = max_rounds {
            self.max_rounds = n;
        }
        Ok(vec![GameEvent::CreatorJoined {
            creator: who.clone(),
            max_rounds: self.max_rounds,
        }])
    }

    /// Change the series length before the match starts.
    pub fn set_max_rounds(&mut self, max_rounds: u32) -> Result<(), GameError> {
        if self.phase != Phase::Waiting {
            return Err(GameError::WrongPhase { phase: self.phase });
        }
        check_rounds(max_rounds)?;
        self.max_rounds = max_rounds;
        Ok(())
    }

    /// Bind the joiner seat with their proof of payment.
    pub fn set_joiner(&mut self, who: &PlayerAddress, entry_fee_hash: Option<String>) -> FlowResult {
        if self.joiner.as_ref() == Some(who) {
            return Ok(Vec::new());
        }
        if self.phase != Phase::Waiting {
            return Err(GameError::WrongPhase { phase: self.phase });
        }
        let creator = self.creator.as_ref().ok_or(GameError::NoCreator)?;
        if creator == who {
            return Err(GameError::SelfPlay);
        }
        if self.joiner.is_some() {
            return Err(GameError::SeatTaken);
        }

        self.joiner = Some(who.clone());
        self.entry_fee_hash = entry_fee_hash.clone();
        Ok(vec![GameEvent::JoinerJoined {
            joiner: who.clone(),
            entry_fee_hash,
        }])
    }

    /// Start the series. Either participant may call it once both are seated.
    pub fn start_game(&mut self, who: &PlayerAddress) -> FlowResult {
        self.participant(who)?;
        if self.phase != Phase::Waiting {
            return Err(GameError::WrongPhase { phase: self.phase });
        }
        let (Some(creator), Some(_)) = (&self.creator, &self.joiner) else {
            return Err(GameError::PlayersMissing);
        };
        let creator = creator.clone();
        let started_at = Utc::now();

        self.current_round = 1;
        self.creator_wins = 0;
        self.joiner_wins = 0;
        self.winner = None;
        self.last_outcome = None;
        self.reset_round_fields();
        self.current_turn = Some(creator.clone());
        self.started_at = Some(started_at);
        self.enter(Phase::Choosing);

        Ok(vec![GameEvent::GameStarted {
            started_at,
            current_turn: creator,
        }])
    }

    // =========================================================================
    // CHOICE
    // =========================================================================

    /// The turn holder picks a side; the opponent gets the opposite one.
    pub fn submit_choice(&mut self, who: &PlayerAddress, choice: CoinSide) -> FlowResult {
        let role = self.participant(who)?;
        if self.choice_of(role).is_some()
            && matches!(self.phase, Phase::Choosing | Phase::Charging | Phase::RoundActive)
        {
            return Err(GameError::AlreadyChosen);
        }
        if self.phase != Phase::Choosing {
            return Err(GameError::WrongPhase { phase: self.phase });
        }
        self.require_turn(who)?;

        Ok(self.lock_in(role, choice))
    }

    // =========================================================================
    // CHARGE
    // =========================================================================

    /// The turn holder starts charging.
    pub fn start_charging(&mut self, who: &PlayerAddress) -> FlowResult {
        self.participant(who)?;
        self.charge_guard(who, None)?;

        if self.phase == Phase::RoundActive {
            return Ok(Vec::new());
        }
        self.enter(Phase::RoundActive);
        Ok(vec![GameEvent::ChargeStarted { player: who.clone() }])
    }

    /// Intermediate power level while charging.
    pub fn update_power(&mut self, who: &PlayerAddress, level: f64) -> FlowResult {
        let role = self.participant(who)?;
        self.charge_guard(who, None)?;

        let level = clamp_power(level);
        self.set_power(role, level);
        if self.phase == Phase::Charging {
            self.enter(Phase::RoundActive);
        }
        Ok(vec![GameEvent::PowerUpdated { player: who.clone(), level }])
    }

    /// Finish charging at `level` and flip.
    ///
    /// `round`, when the client sends it, pins the request to a round so a
    /// late duplicate is reported as [`GameError::RoundAlreadyResolved`].
    pub fn stop_charging(
        &mut self,
        who: &PlayerAddress,
        level: f64,
        round: Option<u32>,
        outcomes: &dyn OutcomeSource,
    ) -> FlowResult {
        let role = self.participant(who)?;
        self.charge_guard(who, round)?;

        let level = clamp_power(level);
        self.set_power(role, level);

        let mut events = vec![GameEvent::PowerCharged { player: who.clone(), level }];
        events.extend(self.resolve_round(who.clone(), level, FlipTrigger::Charged, outcomes));
        Ok(events)
    }

    /// `AUTO_FLIP` / `AUTO_FLIP_TIMEOUT`: resolve now with whatever power
    /// has been charged.
    ///
    /// Only the turn holder may force a flip. If sides are not locked in
    /// yet, `choice` (or the default side) becomes the turn holder's side.
    pub fn force_flip(
        &mut self,
        who: &PlayerAddress,
        choice: Option<CoinSide>,
        trigger: FlipTrigger,
        round: Option<u32>,
        outcomes: &dyn OutcomeSource,
    ) -> FlowResult {
        self.participant(who)?;
        self.check_round_tag(round)?;
        match self.phase {
            Phase::GameComplete => return Err(GameError::RoundAlreadyResolved),
            Phase::Choosing | Phase::Charging | Phase::RoundActive => {}
            phase => return Err(GameError::WrongPhase { phase }),
        }
        self.require_turn(who)?;
        let (flipper, turn_role) = self.turn_holder()?;

        let mut events = Vec::new();
        if self.phase == Phase::Choosing {
            let side = choice.unwrap_or(self.config.default_choice);
            events.extend(self.lock_in(turn_role, side));
        }
        let power = self.power_of(turn_role);
        events.extend(self.resolve_round(flipper, power, trigger, outcomes));
        Ok(events)
    }

    /// Countdown expiry: pick for an idle chooser, or flip for an idle charger.
    pub fn expire_turn(&mut self, outcomes: &dyn OutcomeSource) -> FlowResult {
        if !self.phase.is_timed() {
            return Err(GameError::WrongPhase { phase: self.phase });
        }
        let (holder, turn_role) = self.turn_holder()?;

        let mut events = vec![GameEvent::TurnExpired {
            player: holder.clone(),
            phase: self.phase,
        }];
        if self.phase == Phase::Choosing {
            events.extend(self.lock_in(turn_role, self.config.default_choice));
        } else {
            let power = self.power_of(turn_role);
            events.extend(self.resolve_round(holder, power, FlipTrigger::ServerTimeout, outcomes));
        }
        Ok(events)
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn participant(&self, who: &PlayerAddress) -> Result<Role, GameError> {
        self.role_of(who).ok_or(GameError::NotParticipant)
    }

    fn require_turn(&self, who: &PlayerAddress) -> Result<(), GameError> {
        if self.current_turn.as_ref() == Some(who) {
            Ok(())
        } else {
            Err(GameError::NotYourTurn)
        }
    }

    fn turn_holder(&self) -> Result<(PlayerAddress, Role), GameError> {
        self.current_turn
            .as_ref()
            .and_then(|holder| self.role_of(holder).map(|role| (holder.clone(), role)))
            .ok_or(GameError::WrongPhase { phase: self.phase })
    }

    fn check_round_tag(&self, round: Option<u32>) -> Result<(), GameError> {
        match round {
            Some(r) if r < self.current_round => Err(GameError::RoundAlreadyResolved),
            Some(r) if r > self.current_round => Err(GameError::WrongPhase { phase: self.phase }),
            _ => Ok(()),
        }
    }

    fn charge_guard(&self, who: &PlayerAddress, round: Option<u32>) -> Result<(), GameError> {
        self.check_round_tag(round)?;
        if self.phase == Phase::GameComplete {
            return Err(GameError::RoundAlreadyResolved);
        }
        if !self.phase.accepts_charge() {
            return Err(GameError::WrongPhase { phase: self.phase });
        }
        self.require_turn(who)
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.turn_epoch = self.turn_epoch.wrapping_add(1);
    }

    fn set_power(&mut self, role: Role, level: f64) {
        match role {
            Role::Creator => self.creator_power = level,
            Role::Joiner => self.joiner_power = level,
        }
    }

    fn reset_round_fields(&mut self) {
        self.creator_choice = None;
        self.joiner_choice = None;
        self.creator_power = MIN_POWER;
        self.joiner_power = MIN_POWER;
    }

    /// `role` takes `side`, the other seat takes the opposite; on to charging.
    fn lock_in(&mut self, role: Role, side: CoinSide) -> Vec<GameEvent> {
        let (creator_choice, joiner_choice) = match role {
            Role::Creator => (side, side.opposite()),
            Role::Joiner => (side.opposite(), side),
        };
        self.creator_choice = Some(creator_choice);
        self.joiner_choice = Some(joiner_choice);
        self.enter(Phase::Charging);

        let mut events = Vec::with_capacity(2);
        if let Some(player) = self.player_in(role).cloned() {
            events.push(GameEvent::ChoiceMade { player, role, choice: side });
        }
        if let Some(current_turn) = self.current_turn.clone() {
            events.push(GameEvent::ChoicesLocked {
                round: self.current_round,
                creator_choice,
                joiner_choice,
                current_turn,
            });
        }
        events
    }

    /// Flip, score, and either finish the match or open the next round.
    fn resolve_round(
        &mut self,
        flipper: PlayerAddress,
        power: f64,
        trigger: FlipTrigger,
        outcomes: &dyn OutcomeSource,
    ) -> Vec<GameEvent> {
        let round = self.current_round;
        let mut events = vec![GameEvent::FlipStarted {
            round,
            flipper: flipper.clone(),
            power,
            trigger,
        }];

        let outcome = outcomes.flip();
        let creator_choice = self.creator_choice.unwrap_or(self.config.default_choice);
        let joiner_choice = self.joiner_choice.unwrap_or(creator_choice.opposite());
        let winner_role = if creator_choice == outcome {
            Role::Creator
        } else {
            Role::Joiner
        };
        match winner_role {
            Role::Creator => self.creator_wins += 1,
            Role::Joiner => self.joiner_wins += 1,
        }
        self.last_outcome = Some(outcome);
        self.enter(Phase::RoundComplete);

        let round_winner = self.player_in(winner_role).cloned().unwrap_or_else(|| flipper.clone());
        events.push(GameEvent::FlipResolved {
            round,
            outcome,
            round_winner: round_winner.clone(),
            flipper,
            power,
            creator_choice,
            joiner_choice,
        });
        events.push(GameEvent::ScoreUpdated {
            creator_wins: self.creator_wins,
            joiner_wins: self.joiner_wins,
        });

        let needed = wins_needed(self.max_rounds);
        if self.creator_wins >= needed || self.joiner_wins >= needed {
            self.winner = Some(round_winner.clone());
            self.current_turn = None;
            self.enter(Phase::GameComplete);
            events.push(GameEvent::GameCompleted {
                winner: round_winner,
                creator_wins: self.creator_wins,
                joiner_wins: self.joiner_wins,
                completed_at: Utc::now(),
            });
            return events;
        }

        let next_turn = match self.config.turn_policy {
            TurnPolicy::CreatorAlways => self.creator.clone(),
            TurnPolicy::Alternate => self
                .current_turn
                .as_ref()
                .and_then(|holder| self.role_of(holder))
                .and_then(|role| self.player_in(role.other()).cloned()),
        };
        self.current_round += 1;
        self.reset_round_fields();
        self.current_turn = next_turn.or_else(|| self.creator.clone());
        self.enter(Phase::Choosing);

        if let Some(current_turn) = self.current_turn.clone() {
            events.push(GameEvent::RoundStarted {
                round: self.current_round,
                current_turn,
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::GameId;
    use crate::core::rng::ScriptedSource;
    use crate::game::state::{SessionConfig, MAX_POWER};
    use proptest::prelude::*;

    fn creator() -> PlayerAddress {
        PlayerAddress::new("0xcreator")
    }

    fn joiner() -> PlayerAddress {
        PlayerAddress::new("0xjoiner")
    }

    fn started_session(config: SessionConfig) -> GameSession {
        let mut session = GameSession::new(GameId::new("game-1"), config);
        session.set_creator(&creator()).unwrap();
        session.set_joiner(&joiner(), Some("0xfee".into())).unwrap();
        session.start_game(&creator()).unwrap();
        session
    }

    /// Choose and charge for whoever holds the turn.
    fn play_round(session: &mut GameSession, side: CoinSide, outcomes: &ScriptedSource) -> Vec<GameEvent> {
        let holder = session.current_turn().cloned().unwrap();
        session.submit_choice(&holder, side).unwrap();
        session.start_charging(&holder).unwrap();
        session.stop_charging(&holder, 5.0, None, outcomes).unwrap()
    }

    #[test]
    fn test_seat_binding() {
        let mut session = GameSession::new(GameId::new("g"), SessionConfig::default());

        assert_eq!(session.set_joiner(&joiner(), None), Err(GameError::NoCreator));

        let events = session.set_creator(&creator()).unwrap();
        assert!(matches!(events[0], GameEvent::CreatorJoined { .. }));
        assert!(session.set_creator(&creator()).unwrap().is_empty());
        assert_eq!(session.set_creator(&joiner()), Err(GameError::SeatTaken));

        assert_eq!(session.set_joiner(&creator(), None), Err(GameError::SelfPlay));
        session.set_joiner(&joiner(), Some("0xfee".into())).unwrap();
        assert!(session.set_joiner(&joiner(), None).unwrap().is_empty());
        assert_eq!(
            session.set_joiner(&PlayerAddress::new("0xother"), None),
            Err(GameError::SeatTaken)
        );
        assert_eq!(session.entry_fee_hash.as_deref(), Some("0xfee"));
    }

    #[test]
    fn test_max_rounds_validation() {
        let mut session = GameSession::new(GameId::new("g"), SessionConfig::default());
        assert_eq!(session.set_max_rounds(4), Err(GameError::InvalidRounds(4)));
        assert_eq!(session.set_max_rounds(0), Err(GameError::InvalidRounds(0)));
        session.set_max_rounds(3).unwrap();
        assert_eq!(session.snapshot(0).max_rounds, 3);
    }

    #[test]
    fn test_claim_creator_is_atomic() {
        let mut session = GameSession::new(GameId::new("g"), SessionConfig::default());
        assert_eq!(
            session.claim_creator(&creator(), Some(2)),
            Err(GameError::InvalidRounds(2))
        );
        assert!(session.creator().is_none());

        let events = session.claim_creator(&creator(), Some(7)).unwrap();
        assert!(matches!(events[0], GameEvent::CreatorJoined { max_rounds: 7, .. }));

        assert_eq!(session.claim_creator(&joiner(), Some(3)), Err(GameError::SeatTaken));
        assert_eq!(session.snapshot(0).max_rounds, 7);
    }

    #[test]
    fn test_start_requires_both_players() {
        let mut session = GameSession::new(GameId::new("g"), SessionConfig::default());
        session.set_creator(&creator()).unwrap();
        assert_eq!(session.start_game(&creator()), Err(GameError::PlayersMissing));
        assert_eq!(session.start_game(&joiner()), Err(GameError::NotParticipant));

        session.set_joiner(&joiner(), None).unwrap();
        session.start_game(&joiner()).unwrap();
        assert_eq!(session.phase(), Phase::Choosing);
        assert_eq!(session.current_turn(), Some(&creator()));
        assert!(session.started_at.is_some());

        assert_eq!(
            session.start_game(&creator()),
            Err(GameError::WrongPhase { phase: Phase::Choosing })
        );
        assert_eq!(
            session.set_max_rounds(3),
            Err(GameError::WrongPhase { phase: Phase::Choosing })
        );
    }

    #[test]
    fn test_choice_auto_assigns_opposite() {
        let mut session = started_session(SessionConfig::default());

        let events = session.submit_choice(&creator(), CoinSide::Heads).unwrap();
        assert_eq!(session.phase(), Phase::Charging);
        assert_eq!(session.choice_of(Role::Creator), Some(CoinSide::Heads));
        assert_eq!(session.choice_of(Role::Joiner), Some(CoinSide::Tails));
        assert_eq!(session.current_turn(), Some(&creator()));
        assert!(matches!(events.last(), Some(GameEvent::ChoicesLocked { round: 1, .. })));
    }

    #[test]
    fn test_choice_rejections() {
        let mut session = started_session(SessionConfig::default());

        assert_eq!(
            session.submit_choice(&PlayerAddress::new("0xspectator"), CoinSide::Heads),
            Err(GameError::NotParticipant)
        );
        assert_eq!(session.submit_choice(&joiner(), CoinSide::Heads), Err(GameError::NotYourTurn));

        session.submit_choice(&creator(), CoinSide::Heads).unwrap();
        assert_eq!(session.submit_choice(&creator(), CoinSide::Tails), Err(GameError::AlreadyChosen));
        assert_eq!(session.submit_choice(&joiner(), CoinSide::Heads), Err(GameError::AlreadyChosen));
    }

    #[test]
    fn test_charge_rejections() {
        let mut session = started_session(SessionConfig::default());
        let outcomes = ScriptedSource::always(CoinSide::Heads);

        assert_eq!(
            session.start_charging(&creator()),
            Err(GameError::WrongPhase { phase: Phase::Choosing })
        );
        session.submit_choice(&creator(), CoinSide::Heads).unwrap();
        assert_eq!(session.start_charging(&joiner()), Err(GameError::NotYourTurn));
        assert_eq!(
            session.stop_charging(&joiner(), 5.0, None, &outcomes),
            Err(GameError::NotYourTurn)
        );
        assert_eq!(session.scores(), (0, 0));
    }

    #[test]
    fn test_update_power_clamps() {
        let mut session = started_session(SessionConfig::default());
        session.submit_choice(&creator(), CoinSide::Tails).unwrap();

        let events = session.update_power(&creator(), 14.5).unwrap();
        assert_eq!(session.power_of(Role::Creator), MAX_POWER);
        assert_eq!(session.phase(), Phase::RoundActive);
        assert!(matches!(events[0], GameEvent::PowerUpdated { level, .. } if level == MAX_POWER));

        session.update_power(&creator(), -1.0).unwrap();
        assert_eq!(session.power_of(Role::Creator), 0.0);
    }

    #[test]
    fn test_scenario_a_creator_wins_first_round() {
        let mut session = started_session(SessionConfig::default());
        let outcomes = ScriptedSource::new([CoinSide::Heads]);

        session.submit_choice(&creator(), CoinSide::Heads).unwrap();
        assert_eq!(session.phase(), Phase::Charging);
        assert_eq!(session.current_turn(), Some(&creator()));

        session.start_charging(&creator()).unwrap();
        session.update_power(&creator(), 7.0).unwrap();
        let events = session.stop_charging(&creator(), 7.0, Some(1), &outcomes).unwrap();

        assert_eq!(session.scores(), (1, 0));
        assert_eq!(session.phase(), Phase::Choosing);
        assert_eq!(session.current_round(), 2);
        assert_eq!(session.choice_of(Role::Creator), None);
        assert_eq!(session.power_of(Role::Creator), 0.0);
        assert_eq!(session.current_turn(), Some(&joiner()));

        let resolved = events.iter().find_map(|e| match e {
            GameEvent::FlipResolved { outcome, round_winner, power, .. } => {
                Some((*outcome, round_winner.clone(), *power))
            }
            _ => None,
        });
        assert_eq!(resolved, Some((CoinSide::Heads, creator(), 7.0)));
    }

    #[test]
    fn test_creator_always_policy_keeps_turn() {
        let config = SessionConfig {
            turn_policy: TurnPolicy::CreatorAlways,
            ..Default::default()
        };
        let mut session = started_session(config);
        let outcomes = ScriptedSource::always(CoinSide::Tails);

        play_round(&mut session, CoinSide::Heads, &outcomes);
        assert_eq!(session.current_turn(), Some(&creator()));
        assert_eq!(session.scores(), (0, 1));
    }

    #[test]
    fn test_scenario_b_best_of_five_ends_at_three() {
        let mut session = started_session(SessionConfig::default());
        // The turn holder always picks heads and the coin always lands tails,
        // so the other seat takes every round: joiner, creator, joiner, ...
        let outcomes = ScriptedSource::always(CoinSide::Tails);

        let mut completed_at_round = None;
        for round in 1..=5 {
            let events = play_round(&mut session, CoinSide::Heads, &outcomes);
            let (c, j) = session.scores();
            if c.max(j) < 3 {
                assert_ne!(session.phase(), Phase::GameComplete);
                assert!(session.winner().is_none());
            } else {
                assert_eq!(session.phase(), Phase::GameComplete);
                assert!(events.iter().any(|e| matches!(e, GameEvent::GameCompleted { .. })));
                completed_at_round = Some(round);
                break;
            }
        }

        assert_eq!(completed_at_round, Some(5));
        assert_eq!(session.scores(), (2, 3));
        assert_eq!(session.winner(), Some(&joiner()));
        assert!(session.current_turn().is_none());
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let config = SessionConfig { max_rounds: 1, ..Default::default() };
        let mut session = started_session(config);
        let outcomes = ScriptedSource::always(CoinSide::Heads);

        play_round(&mut session, CoinSide::Heads, &outcomes);
        assert_eq!(session.phase(), Phase::GameComplete);
        let before = session.snapshot(0);

        assert_eq!(
            session.stop_charging(&creator(), 3.0, None, &outcomes),
            Err(GameError::RoundAlreadyResolved)
        );
        assert_eq!(
            session.force_flip(&joiner(), None, FlipTrigger::Timeout, None, &outcomes),
            Err(GameError::RoundAlreadyResolved)
        );
        assert!(session.submit_choice(&creator(), CoinSide::Tails).is_err());
        assert!(session.expire_turn(&outcomes).is_err());
        assert_eq!(session.snapshot(0), before);
    }

    #[test]
    fn test_duplicate_stop_charging_scores_once() {
        let mut session = started_session(SessionConfig::default());
        let outcomes = ScriptedSource::always(CoinSide::Heads);

        session.submit_choice(&creator(), CoinSide::Heads).unwrap();
        session.stop_charging(&creator(), 4.0, Some(1), &outcomes).unwrap();
        assert_eq!(
            session.stop_charging(&creator(), 4.0, Some(1), &outcomes),
            Err(GameError::RoundAlreadyResolved)
        );
        assert_eq!(
            session.stop_charging(&creator(), 4.0, None, &outcomes),
            Err(GameError::WrongPhase { phase: Phase::Choosing })
        );
        assert_eq!(session.scores(), (1, 0));
    }

    #[test]
    fn test_auto_flip_from_choosing() {
        let mut session = started_session(SessionConfig::default());
        let outcomes = ScriptedSource::always(CoinSide::Tails);

        assert_eq!(
            session.force_flip(&joiner(), Some(CoinSide::Heads), FlipTrigger::AutoFlip, None, &outcomes),
            Err(GameError::NotYourTurn)
        );

        let events = session
            .force_flip(&creator(), Some(CoinSide::Tails), FlipTrigger::AutoFlip, None, &outcomes)
            .unwrap();
        assert!(events.iter().any(|e| matches!(e, GameEvent::ChoicesLocked { .. })));
        assert_eq!(session.scores(), (1, 0));
        assert_eq!(session.current_round(), 2);
    }

    #[test]
    fn test_timeout_flip_requires_turn_holder() {
        let mut session = started_session(SessionConfig::default());
        let outcomes = ScriptedSource::always(CoinSide::Heads);
        let before = session.snapshot(0);

        assert_eq!(
            session.force_flip(&joiner(), Some(CoinSide::Heads), FlipTrigger::Timeout, None, &outcomes),
            Err(GameError::NotYourTurn)
        );
        assert_eq!(session.snapshot(0), before);
        assert_eq!(session.choice_of(Role::Joiner), None);

        session.submit_choice(&creator(), CoinSide::Tails).unwrap();
        session.update_power(&creator(), 6.0).unwrap();
        assert_eq!(
            session.force_flip(&joiner(), None, FlipTrigger::Timeout, None, &outcomes),
            Err(GameError::NotYourTurn)
        );
        assert_eq!(session.scores(), (0, 0));

        let events = session
            .force_flip(&creator(), None, FlipTrigger::Timeout, None, &outcomes)
            .unwrap();
        let flip = events.iter().find_map(|e| match e {
            GameEvent::FlipStarted { flipper, power, trigger, .. } => Some((flipper.clone(), *power, *trigger)),
            _ => None,
        });
        assert_eq!(flip, Some((creator(), 6.0, FlipTrigger::Timeout)));
        assert_eq!(session.scores(), (0, 1));
    }

    #[test]
    fn test_timeout_flip_from_choosing_locks_holder_side() {
        let mut session = started_session(SessionConfig::default());
        let outcomes = ScriptedSource::always(CoinSide::Tails);

        session
            .force_flip(&creator(), Some(CoinSide::Tails), FlipTrigger::Timeout, None, &outcomes)
            .unwrap();
        assert_eq!(session.scores(), (1, 0));
    }

    #[test]
    fn test_expire_turn_assigns_then_flips() {
        let mut session = started_session(SessionConfig::default());
        let outcomes = ScriptedSource::always(CoinSide::Heads);

        let events = session.expire_turn(&outcomes).unwrap();
        assert!(matches!(events[0], GameEvent::TurnExpired { phase: Phase::Choosing, .. }));
        assert_eq!(session.phase(), Phase::Charging);
        assert_eq!(session.choice_of(Role::Creator), Some(CoinSide::Heads));

        let events = session.expire_turn(&outcomes).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            GameEvent::FlipStarted { trigger: FlipTrigger::ServerTimeout, .. }
        )));
        assert_eq!(session.scores(), (1, 0));
        assert_eq!(session.phase(), Phase::Choosing);
    }

    #[test]
    fn test_epoch_changes_on_transitions() {
        let mut session = started_session(SessionConfig::default());
        let epoch = session.turn_epoch();
        session.submit_choice(&creator(), CoinSide::Heads).unwrap();
        assert_ne!(session.turn_epoch(), epoch);

        let epoch = session.turn_epoch();
        assert!(session.submit_choice(&creator(), CoinSide::Heads).is_err());
        assert_eq!(session.turn_epoch(), epoch);
    }

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Choose(bool, CoinSide),
        StartCharge(bool),
        Power(bool, f64),
        Stop(bool, f64, Option<u32>),
        AutoFlip(bool, Option<CoinSide>),
        Timeout(bool),
        Expire,
    }

    fn side_strategy() -> impl Strategy<Value = CoinSide> {
        any::<bool>().prop_map(|h| if h { CoinSide::Heads } else { CoinSide::Tails })
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), side_strategy()).prop_map(|(c, s)| Op::Choose(c, s)),
            any::<bool>().prop_map(Op::StartCharge),
            (any::<bool>(), -5.0f64..15.0).prop_map(|(c, p)| Op::Power(c, p)),
            (any::<bool>(), 0.0f64..10.0, proptest::option::of(1u32..6))
                .prop_map(|(c, p, r)| Op::Stop(c, p, r)),
            (any::<bool>(), proptest::option::of(side_strategy())).prop_map(|(c, s)| Op::AutoFlip(c, s)),
            any::<bool>().prop_map(Op::Timeout),
            Just(Op::Expire),
        ]
    }

    fn apply(session: &mut GameSession, op: &Op, outcomes: &ScriptedSource) -> FlowResult {
        let who = |c: bool| if c { creator() } else { joiner() };
        match op {
            Op::Choose(c, side) => session.submit_choice(&who(*c), *side),
            Op::StartCharge(c) => session.start_charging(&who(*c)),
            Op::Power(c, p) => session.update_power(&who(*c), *p),
            Op::Stop(c, p, r) => session.stop_charging(&who(*c), *p, *r, outcomes),
            Op::AutoFlip(c, s) => session.force_flip(&who(*c), *s, FlipTrigger::AutoFlip, None, outcomes),
            Op::Timeout(c) => session.force_flip(&who(*c), None, FlipTrigger::Timeout, None, outcomes),
            Op::Expire => session.expire_turn(outcomes),
        }
    }

    proptest! {
        #[test]
        fn prop_session_invariants(
            max_rounds in prop_oneof![Just(1u32), Just(3u32), Just(5u32), Just(7u32)],
            flips in prop::collection::vec(side_strategy(), 0..40),
            ops in prop::collection::vec(op_strategy(), 0..80),
        ) {
            let config = SessionConfig { max_rounds, ..Default::default() };
            let mut session = started_session(config);
            let outcomes = ScriptedSource::new(flips);
            let mut resolved = 0u32;
            let needed = wins_needed(max_rounds);

            for op in &ops {
                let before = session.snapshot(0);
                let phase_before = session.phase();
                match apply(&mut session, op, &outcomes) {
                    Ok(events) => {
                        let flips_seen = events
                            .iter()
                            .filter(|e| matches!(e, GameEvent::FlipResolved { .. }))
                            .count() as u32;
                        prop_assert!(flips_seen <= 1);
                        if flips_seen == 1 {
                            let locked_now = events.iter().any(|e| matches!(e, GameEvent::ChoicesLocked { .. }));
                            prop_assert!(phase_before.accepts_charge() || locked_now);
                        }
                        resolved += flips_seen;
                        if before.phase == Phase::GameComplete {
                            prop_assert!(false, "terminal session accepted {:?}", op);
                        }
                    }
                    Err(_) => {
                        prop_assert_eq!(&session.snapshot(0), &before);
                    }
                }

                let (c, j) = session.scores();
                prop_assert_eq!(c + j, resolved);
                prop_assert!(c + j <= session.current_round());
                prop_assert!(!(c >= needed && j >= needed));
                prop_assert_eq!(session.winner().is_some(), session.phase() == Phase::GameComplete);
                prop_assert_ne!(session.phase(), Phase::Waiting);
                prop_assert_ne!(session.phase(), Phase::RoundComplete);
                if session.phase() == Phase::Choosing {
                    prop_assert!(session.choice_of(Role::Creator).is_none());
                    prop_assert!(session.choice_of(Role::Joiner).is_none());
                }
                if session.phase().accepts_charge() {
                    let cc = session.choice_of(Role::Creator);
                    let jc = session.choice_of(Role::Joiner);
                    prop_assert!(cc.is_some() && jc.is_some());
                    prop_assert_eq!(cc.map(CoinSide::opposite), jc);
                }
                let power = session.power_of(Role::Creator).max(session.power_of(Role::Joiner));
                prop_assert!((0.0..=MAX_POWER).contains(&power));
            }
        }
    }
}
