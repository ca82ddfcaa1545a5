//! Coin Flip Outcomes
//!
//! The single source of randomness for round resolution. Sessions only see
//! the [`OutcomeSource`] trait, so tests and replays can inject a seeded or
//! scripted generator without touching game logic.

use std::collections::VecDeque;
use parking_lot::Mutex;
use rand::Rng;

use super::coin::CoinSide;

/// Produces uniformly random coin flip outcomes.
pub trait OutcomeSource: Send + Sync {
    /// Flip the coin once.
    fn flip(&self) -> CoinSide;
}

/// Thread-local entropy. The production source.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntropySource;

impl OutcomeSource for EntropySource {
    fn flip(&self) -> CoinSide {
        if rand::thread_rng().gen_bool(0.5) {
            CoinSide::Heads
        } else {
            CoinSide::Tails
        }
    }
}

/// Xorshift128+ generator.
///
/// Given the same seed, produces the exact same sequence on any platform.
#[derive(Clone, Debug)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a fair coin side from the top bit.
    #[inline]
    pub fn next_side(&mut self) -> CoinSide {
        if self.next_u64() >> 63 == 0 {
            CoinSide::Heads
        } else {
            CoinSide::Tails
        }
    }
}

/// SplitMix64 for seed initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Reproducible outcomes from a fixed seed (`COINFLIP_RNG_SEED`).
#[derive(Debug)]
pub struct SeededSource {
    rng: Mutex<DeterministicRng>,
}

impl SeededSource {
    /// Create a seeded source.
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(DeterministicRng::new(seed)) }
    }
}

impl OutcomeSource for SeededSource {
    fn flip(&self) -> CoinSide {
        self.rng.lock().next_side()
    }
}

/// Plays back a fixed list of outcomes, then repeats `fallback`.
#[derive(Debug)]
pub struct ScriptedSource {
    queue: Mutex<VecDeque<CoinSide>>,
    fallback: CoinSide,
}

impl ScriptedSource {
    /// Outcomes in order, falling back to heads when exhausted.
    pub fn new(outcomes: impl IntoIterator<Item = CoinSide>) -> Self {
        Self::with_fallback(outcomes, CoinSide::Heads)
    }

    /// Outcomes in order, then `fallback` forever.
    pub fn with_fallback(outcomes: impl IntoIterator<Item = CoinSide>, fallback: CoinSide) -> Self {
        Self {
            queue: Mutex::new(outcomes.into_iter().collect()),
            fallback,
        }
    }

    /// Always the same side.
    pub fn always(side: CoinSide) -> Self {
        Self::with_fallback(std::iter::empty(), side)
    }

    /// Outcomes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.queue.lock().len()
    }
}

impl OutcomeSource for ScriptedSource {
    fn flip(&self) -> CoinSide {
        self.queue.lock().pop_front().unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_determinism() {
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(12345);

        for _ in 0..1000 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_different_seeds() {
        let mut rng1 = DeterministicRng::new(12345);
        let mut rng2 = DeterministicRng::new(54321);

        assert_ne!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_seeded_source_is_roughly_fair() {
        let source = SeededSource::new(42);
        let heads = (0..10_000)
            .filter(|_| source.flip() == CoinSide::Heads)
            .count();
        assert!((4_500..=5_500).contains(&heads), "heads = {}", heads);
    }

    #[test]
    fn test_seeded_sources_agree() {
        let a = SeededSource::new(7);
        let b = SeededSource::new(7);
        for _ in 0..100 {
            assert_eq!(a.flip(), b.flip());
        }
    }

    #[test]
    fn test_entropy_source_produces_both_sides() {
        let source = EntropySource;
        let flips: Vec<_> = (0..200).map(|_| source.flip()).collect();
        assert!(flips.contains(&CoinSide::Heads));
        assert!(flips.contains(&CoinSide::Tails));
    }

    #[test]
    fn test_scripted_source_plays_back_then_falls_back() {
        let source = ScriptedSource::with_fallback(
            [CoinSide::Tails, CoinSide::Heads],
            CoinSide::Tails,
        );
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.flip(), CoinSide::Tails);
        assert_eq!(source.flip(), CoinSide::Heads);
        assert_eq!(source.flip(), CoinSide::Tails);
        assert_eq!(source.flip(), CoinSide::Tails);
        assert_eq!(source.remaining(), 0);
    }
}
