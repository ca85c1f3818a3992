//! Story persistence.
//!
//! A story is stored as three things: a versioned snapshot of the
//! [`Story`] aggregate, an append-only event log with one [`Event`] per
//! committed turn, and one record per character agent. Loading merges them
//! back into a consistent state (see [`load_story`]).

mod file;
mod memory;
mod reconcile;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use reconcile::{load_story, save_agents, LoadedStory, ReconcileReport};

use crate::agent::AgentState;
use crate::story::{CharacterId, Event, Story, StoryId, StorySummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Story not found: {0}")]
    NotFound(StoryId),
}

/// Versioned snapshot envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorySnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub story: Story,
}

impl StorySnapshot {
    pub fn encode(story: &Story) -> Result<String, PersistError> {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            version: u32,
            saved_at: DateTime<Utc>,
            story: &'a Story,
        }
        Ok(serde_json::to_string_pretty(&Borrowed {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            story,
        })?)
    }

    /// Parse and version-check a snapshot.
    pub fn decode(content: &str) -> Result<Self, PersistError> {
        #[derive(Deserialize)]
        struct Header {
            version: u32,
        }

        let header: Header = serde_json::from_str(content)?;
        if header.version != SNAPSHOT_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: header.version,
            });
        }
        Ok(serde_json::from_str(content)?)
    }
}

/// Durable storage for stories.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Replace the snapshot of a story.
    async fn save_snapshot(&self, story: &Story) -> Result<(), PersistError>;

    /// Load the latest snapshot. Missing stories are [`PersistError::NotFound`].
    async fn load_snapshot(&self, id: &StoryId) -> Result<Story, PersistError>;

    /// Append one event to the story's log.
    async fn append_event(&self, event: &Event) -> Result<(), PersistError>;

    /// Drop every event with a turn greater than `keep_through`, or every
    /// event when it is `None`.
    async fn truncate_events(
        &self,
        id: &StoryId,
        keep_through: Option<u64>,
    ) -> Result<(), PersistError>;

    /// All events of a story, oldest first.
    async fn load_events(&self, id: &StoryId) -> Result<Vec<Event>, PersistError>;

    /// Replace one agent record.
    async fn save_agent(&self, id: &StoryId, state: &AgentState) -> Result<(), PersistError>;

    /// Load one agent record. `Ok(None)` when there is none.
    async fn load_agent(
        &self,
        id: &StoryId,
        character: &CharacterId,
    ) -> Result<Option<AgentState>, PersistError>;

    /// Summaries of every stored story, most recently updated first.
    async fn list(&self) -> Result<Vec<StorySummary>, PersistError>;
}
