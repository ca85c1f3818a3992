//! Multi-agent interactive fiction engine.
//!
//! This crate provides:
//! - Perception routing from a player action to every character agent
//! - Character agents with bounded turn memory and long-term memory
//! - A deterministic director that validates proposed moves
//! - A storyteller that weaves accepted moves into narrative
//! - Snapshot plus event log persistence with crash reconciliation
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use story_core::{
//!     CompletionsBackend, EngineConfig, EngineContext, FileStore, Orchestrator,
//!     PlayerCharacter, StoryConfig, StoryPreferences, TurnOutcome,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env();
//!     let client = completions::Client::from_env()?;
//!     let store = Arc::new(FileStore::new(&config.saves_dir));
//!     let ctx = EngineContext::new(config, Arc::new(CompletionsBackend::new(client)));
//!     let engine = Orchestrator::new(ctx, store);
//!
//!     let id = engine
//!         .create(StoryConfig::new(
//!             PlayerCharacter::new("Eleanor Blackwood", "Royal physician"),
//!             StoryPreferences::new("mystery", "tense"),
//!         ))
//!         .await?;
//!     println!("{}", engine.start(&id).await?);
//!
//!     if let TurnOutcome::Turn(report) = engine.continue_story(&id, "I examine the cup").await? {
//!         println!("{}", report.narrative);
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod backend;
pub mod config;
pub mod context;
pub mod director;
pub mod orchestrator;
pub mod parse;
pub mod persist;
pub mod rng;
pub mod router;
pub mod story;
pub mod storyteller;
pub mod testing;

// Primary public API
pub use agent::{AgentState, CharacterMove, CharacterResponse, Dossier, Intent, StyleCard, StyleUpdate};
pub use backend::{Backend, BackendError, CompletionsBackend, GenerationRequest, GenerationRole};
pub use config::{EngineConfig, RoleParams};
pub use context::EngineContext;
pub use director::DirectorValidation;
pub use orchestrator::{Inspect, Inspection, Orchestrator, StoryError, TurnOutcome, TurnReport};
pub use persist::{FileStore, MemoryStore, PersistError, ReconcileReport, StoryStore};
pub use router::{AttentionLevel, InformationPacket};
pub use story::{
    CharacterId, PlayerCharacter, Scene, Story, StoryConfig, StoryId, StoryPreferences,
    StoryStatus,
};
pub use testing::{FaultyStore, Scripted, ScriptedBackend, TestHarness};
