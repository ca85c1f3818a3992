//! Engine configuration.
//!
//! Everything the turn pipeline reads at runtime lives in [`EngineConfig`].
//! Build one with [`EngineConfig::default`] and the `with_*` methods, or read
//! overrides from the environment with [`EngineConfig::from_env`].

use crate::rng::DEFAULT_SEED;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Generation parameters for one role (director, storyteller, characters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoleParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
    /// Whether replies are expected to be a JSON object.
    pub json_mode: bool,
}

impl RoleParams {
    pub fn director() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.9,
            max_tokens: 512,
            json_mode: true,
        }
    }

    pub fn storyteller() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            max_tokens: 700,
            json_mode: false,
        }
    }

    pub fn character() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 180,
            json_mode: true,
        }
    }

    /// Same parameters with a different temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Configuration for the story engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum character agents queried concurrently in one turn.
    pub max_concurrent_agents: usize,

    /// Capacity of each agent's rolling turn-memory buffer.
    pub turn_memory_size: usize,

    /// Seed for the process-wide RNG.
    pub rng_seed: u64,

    /// Approximate token budget for the context sent with one request.
    pub max_context_tokens: usize,

    /// Turns of player/narrative exchange the storyteller keeps.
    pub storyteller_history_turns: usize,

    /// Per-invocation timeout for a character agent's backend call.
    pub agent_timeout: Duration,

    /// Director generation parameters.
    pub director: RoleParams,

    /// Storyteller generation parameters.
    pub storyteller: RoleParams,

    /// Default character generation parameters.
    pub character: RoleParams,

    /// Root directory for the file store.
    pub saves_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 4,
            turn_memory_size: 20,
            rng_seed: DEFAULT_SEED,
            max_context_tokens: 8192,
            storyteller_history_turns: 10,
            agent_timeout: Duration::from_secs(60),
            director: RoleParams::director(),
            storyteller: RoleParams::storyteller(),
            character: RoleParams::character(),
            saves_dir: PathBuf::from("./saves"),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any of the recognised environment variables.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("MAX_ACTIVE_CHARACTERS_PER_TURN") {
            config.max_concurrent_agents = v;
        }
        if let Some(v) = env_parse("TURN_MEMORY_SIZE") {
            config.turn_memory_size = v;
        }
        if let Some(v) = env_parse("RNG_SEED") {
            config.rng_seed = v;
        }
        if let Some(v) = env_parse("MAX_CONTEXT_TOKENS") {
            config.max_context_tokens = v;
        }
        if let Some(v) = env_parse("STORYTELLER_MAX_HISTORY_TURNS") {
            config.storyteller_history_turns = v;
        }
        if let Some(secs) = env_parse::<u64>("AGENT_TIMEOUT_SECS") {
            config.agent_timeout = Duration::from_secs(secs);
        }
        if let Some(t) = env_parse("DIRECTOR_TEMPERATURE") {
            config.director.temperature = t;
        }
        if let Some(t) = env_parse("STORYTELLER_TEMPERATURE") {
            config.storyteller.temperature = t;
        }
        if let Some(t) = env_parse("CHARACTER_DEFAULT_TEMPERATURE") {
            config.character.temperature = t;
        }
        if let Ok(dir) = std::env::var("SAVES_DIR") {
            config.saves_dir = PathBuf::from(dir);
        }

        config
    }

    /// Set the concurrent agent cap (minimum 1).
    pub fn with_max_concurrent_agents(mut self, cap: usize) -> Self {
        self.max_concurrent_agents = cap.max(1);
        self
    }

    /// Set the turn-memory buffer capacity (minimum 1).
    pub fn with_turn_memory_size(mut self, size: usize) -> Self {
        self.turn_memory_size = size.max(1);
        self
    }

    /// Set the RNG seed.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    /// Set the context token budget.
    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    /// Set the per-agent invocation timeout.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Set the storyteller history length in turns.
    pub fn with_storyteller_history_turns(mut self, turns: usize) -> Self {
        self.storyteller_history_turns = turns;
        self
    }

    /// Set the file store root.
    pub fn with_saves_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.saves_dir = dir.into();
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_agents, 4);
        assert_eq!(config.turn_memory_size, 20);
        assert_eq!(config.rng_seed, 1337);
        assert_eq!(config.max_context_tokens, 8192);
        assert!(config.director.json_mode);
        assert!(!config.storyteller.json_mode);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_max_concurrent_agents(0)
            .with_turn_memory_size(5)
            .with_rng_seed(99)
            .with_agent_timeout(Duration::from_millis(250));

        assert_eq!(config.max_concurrent_agents, 1);
        assert_eq!(config.turn_memory_size, 5);
        assert_eq!(config.rng_seed, 99);
        assert_eq!(config.agent_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_role_params_temperature_override() {
        let params = RoleParams::character().with_temperature(0.55);
        assert_eq!(params.temperature, 0.55);
        assert_eq!(params.max_tokens, 180);
    }
}
