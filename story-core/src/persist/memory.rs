//! In-process story store.
//!
//! Keeps serialized records in memory so it exercises the same encode and
//! decode paths as [`super::FileStore`].

use super::{PersistError, StorySnapshot, StoryStore};
use crate::agent::AgentState;
use crate::story::{CharacterId, Event, Story, StoryId, StorySummary};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Stored {
    snapshot: Option<String>,
    events: Vec<String>,
    agents: HashMap<CharacterId, String>,
}

/// A [`StoryStore`] that lives and dies with the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    stories: Arc<RwLock<HashMap<StoryId, Stored>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an agent record with arbitrary text.
    pub async fn put_raw_agent(&self, id: &StoryId, character: &CharacterId, raw: &str) {
        self.stories
            .write()
            .await
            .entry(id.clone())
            .or_default()
            .agents
            .insert(character.clone(), raw.to_string());
    }

    /// Remove an agent record.
    pub async fn remove_agent(&self, id: &StoryId, character: &CharacterId) {
        if let Some(stored) = self.stories.write().await.get_mut(id) {
            stored.agents.remove(character);
        }
    }
}

#[async_trait]
impl StoryStore for MemoryStore {
    async fn save_snapshot(&self, story: &Story) -> Result<(), PersistError> {
        let content = StorySnapshot::encode(story)?;
        self.stories
            .write()
            .await
            .entry(story.id.clone())
            .or_default()
            .snapshot = Some(content);
        Ok(())
    }

    async fn load_snapshot(&self, id: &StoryId) -> Result<Story, PersistError> {
        let stories = self.stories.read().await;
        let content = stories
            .get(id)
            .and_then(|s| s.snapshot.as_deref())
            .ok_or_else(|| PersistError::NotFound(id.clone()))?;
        Ok(StorySnapshot::decode(content)?.story)
    }

    async fn append_event(&self, event: &Event) -> Result<(), PersistError> {
        let line = serde_json::to_string(event)?;
        self.stories
            .write()
            .await
            .entry(event.story_id.clone())
            .or_default()
            .events
            .push(line);
        Ok(())
    }

    async fn truncate_events(
        &self,
        id: &StoryId,
        keep_through: Option<u64>,
    ) -> Result<(), PersistError> {
        let mut stories = self.stories.write().await;
        let Some(stored) = stories.get_mut(id) else {
            return Ok(());
        };
        let mut kept = Vec::with_capacity(stored.events.len());
        for line in &stored.events {
            let event: Event = serde_json::from_str(line)?;
            if keep_through.is_some_and(|turn| event.turn <= turn) {
                kept.push(line.clone());
            }
        }
        stored.events = kept;
        Ok(())
    }

    async fn load_events(&self, id: &StoryId) -> Result<Vec<Event>, PersistError> {
        let stories = self.stories.read().await;
        let mut events = match stories.get(id) {
            Some(stored) => stored
                .events
                .iter()
                .map(|line| serde_json::from_str(line))
                .collect::<Result<Vec<Event>, _>>()?,
            None => Vec::new(),
        };
        events.sort_by_key(|e| e.turn);
        Ok(events)
    }

    async fn save_agent(&self, id: &StoryId, state: &AgentState) -> Result<(), PersistError> {
        let content = serde_json::to_string(state)?;
        self.stories
            .write()
            .await
            .entry(id.clone())
            .or_default()
            .agents
            .insert(state.id().clone(), content);
        Ok(())
    }

    async fn load_agent(
        &self,
        id: &StoryId,
        character: &CharacterId,
    ) -> Result<Option<AgentState>, PersistError> {
        let stories = self.stories.read().await;
        match stories.get(id).and_then(|s| s.agents.get(character)) {
            Some(content) => Ok(Some(serde_json::from_str(content)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<StorySummary>, PersistError> {
        let stories = self.stories.read().await;
        let mut summaries = Vec::new();
        for stored in stories.values() {
            if let Some(content) = &stored.snapshot {
                summaries.push(StorySnapshot::decode(content)?.story.summary());
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
