//! Seeded random number generation.
//!
//! All narrative randomness flows through [`GameRng`] so a story run is
//! reproducible from its seed. Tie-breaks use a per-turn generator derived
//! from the base seed and the turn number, so a turn resolves the same way
//! no matter how many draws earlier turns made.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Default seed when none is configured.
pub const DEFAULT_SEED: u64 = 1337;

/// A seeded, deterministic random source.
#[derive(Debug, Clone)]
pub struct GameRng {
    seed: u64,
    rng: StdRng,
}

impl GameRng {
    /// Create a generator from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Restart the sequence from a new seed.
    pub fn reseed(&mut self, seed: u64) {
        *self = Self::new(seed);
    }

    /// A fresh generator for one turn, independent of prior draws.
    pub fn for_turn(&self, turn: u64) -> GameRng {
        // splitmix64 finalizer keeps nearby turns from producing correlated streams
        let mut z = self.seed ^ turn.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        GameRng {
            seed: self.seed,
            rng: StdRng::seed_from_u64(z),
        }
    }

    /// Pick an index in `0..len`. Returns `None` for an empty range.
    pub fn pick_index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            None
        } else {
            Some(self.rng.gen_range(0..len))
        }
    }
}

impl Default for GameRng {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}
