//! Process-wide engine context.
//!
//! Holds the configuration, the seeded RNG and the generation backend. One
//! context is built per process and passed to the orchestrator; tests build
//! their own to get isolated, reproducible runs.

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::rng::GameRng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared state injected into every turn.
#[derive(Clone)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    rng: Arc<Mutex<GameRng>>,
    backend: Arc<dyn Backend>,
}

impl EngineContext {
    /// Create a context; the RNG is seeded from `config.rng_seed`.
    pub fn new(config: EngineConfig, backend: Arc<dyn Backend>) -> Self {
        let rng = GameRng::new(config.rng_seed);
        Self {
            config: Arc::new(config),
            rng: Arc::new(Mutex::new(rng)),
            backend,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Restart the shared RNG from a new seed.
    pub fn reseed(&self, seed: u64) {
        self.lock_rng().reseed(seed);
    }

    /// Generator used for tie-breaks in the given turn.
    pub fn turn_rng(&self, turn: u64) -> GameRng {
        self.lock_rng().for_turn(turn)
    }

    fn lock_rng(&self) -> MutexGuard<'_, GameRng> {
        // a panic while holding the lock cannot leave GameRng half-updated
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    #[test]
    fn test_reseed_makes_turn_rng_reproducible() {
        let ctx = EngineContext::new(EngineConfig::default(), Arc::new(ScriptedBackend::new()));
        let a = ctx.turn_rng(4).pick_index(1000);

        ctx.reseed(2024);
        assert_eq!(
            ctx.turn_rng(4).pick_index(1000),
            GameRng::new(2024).for_turn(4).pick_index(1000)
        );

        ctx.reseed(1337);
        let c = ctx.turn_rng(4).pick_index(1000);

        assert_eq!(a, c);
    }
}
