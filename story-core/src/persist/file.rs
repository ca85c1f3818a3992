//! File-backed story store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<story_id>/snapshot.json
//! <root>/<story_id>/events.jsonl
//! <root>/<story_id>/agents/<character_id>.json
//! ```
//!
//! Whole-file writes go through a temporary file and a rename so a crash
//! never leaves a half-written snapshot or agent record behind.

use super::{PersistError, StorySnapshot, StoryStore};
use crate::agent::AgentState;
use crate::story::{CharacterId, Event, Story, StoryId, StorySummary};
use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// A [`StoryStore`] on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn story_dir(&self, id: &StoryId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn snapshot_path(&self, id: &StoryId) -> PathBuf {
        self.story_dir(id).join("snapshot.json")
    }

    fn events_path(&self, id: &StoryId) -> PathBuf {
        self.story_dir(id).join("events.jsonl")
    }

    pub fn agent_path(&self, id: &StoryId, character: &CharacterId) -> PathBuf {
        self.story_dir(id)
            .join("agents")
            .join(format!("{}.json", character.as_str()))
    }
}

/// Write a file via a sibling temp file and a rename.
async fn write_atomic(path: &Path, content: &str) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>, PersistError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_optional_bytes(path: &Path) -> Result<Option<Vec<u8>>, PersistError> {
    match fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether a log is empty, missing, or ends with a complete line.
async fn ends_cleanly(path: &Path) -> Result<bool, PersistError> {
    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

fn parse_events(content: &str) -> Vec<Event> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Event>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "Skipping corrupted event entry");
                None
            }
        })
        .collect()
}

#[async_trait]
impl StoryStore for FileStore {
    async fn save_snapshot(&self, story: &Story) -> Result<(), PersistError> {
        let content = StorySnapshot::encode(story)?;
        write_atomic(&self.snapshot_path(&story.id), &content).await?;
        debug!(story = %story.id, turn = story.turn, "Snapshot written");
        Ok(())
    }

    async fn load_snapshot(&self, id: &StoryId) -> Result<Story, PersistError> {
        if !id.is_well_formed() {
            return Err(PersistError::NotFound(id.clone()));
        }
        let content = read_optional(&self.snapshot_path(id))
            .await?
            .ok_or_else(|| PersistError::NotFound(id.clone()))?;
        Ok(StorySnapshot::decode(&content)?.story)
    }

    async fn append_event(&self, event: &Event) -> Result<(), PersistError> {
        let path = self.events_path(&event.story_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // a torn tail from a crashed append must not swallow this event
        let mut line = if ends_cleanly(&path).await? {
            String::new()
        } else {
            warn!(story = %event.story_id, "Event log ends mid-line, starting a new line");
            "\n".to_string()
        };
        line.push_str(&serde_json::to_string(event)?);
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn truncate_events(
        &self,
        id: &StoryId,
        keep_through: Option<u64>,
    ) -> Result<(), PersistError> {
        let path = self.events_path(id);
        let Some(content) = read_optional(&path).await? else {
            return Ok(());
        };

        let mut kept = String::new();
        for event in parse_events(&content) {
            if keep_through.is_some_and(|turn| event.turn <= turn) {
                kept.push_str(&serde_json::to_string(&event)?);
                kept.push('\n');
            }
        }
        write_atomic(&path, &kept).await
    }

    async fn load_events(&self, id: &StoryId) -> Result<Vec<Event>, PersistError> {
        let content = read_optional(&self.events_path(id)).await?;
        let mut events = content.as_deref().map(parse_events).unwrap_or_default();
        events.sort_by_key(|e| e.turn);
        Ok(events)
    }

    async fn save_agent(&self, id: &StoryId, state: &AgentState) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(state)?;
        write_atomic(&self.agent_path(id, state.id()), &content).await
    }

    async fn load_agent(
        &self,
        id: &StoryId,
        character: &CharacterId,
    ) -> Result<Option<AgentState>, PersistError> {
        // decoded from bytes so invalid UTF-8 reads as a corrupt record
        match read_optional_bytes(&self.agent_path(id, character)).await? {
            Some(content) => Ok(Some(serde_json::from_slice(&content)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<StorySummary>, PersistError> {
        let mut summaries = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(summaries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let snapshot = entry.path().join("snapshot.json");
            let Some(content) = read_optional(&snapshot).await? else {
                continue;
            };
            match StorySnapshot::decode(&content) {
                Ok(snapshot) => summaries.push(snapshot.story.summary()),
                Err(e) => warn!(path = %snapshot.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::CharacterConcept;
    use crate::testing::fixtures;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let story = fixtures::story();

        store.save_snapshot(&story).await.unwrap();
        let loaded = store.load_snapshot(&story.id).await.unwrap();
        assert_eq!(loaded, story);
        assert!(!store.story_dir(&story.id).join("snapshot.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_story_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let err = store.load_snapshot(&StoryId::from("nobody_00000000")).await.unwrap_err();
        assert!(matches!(err, PersistError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_events_append_and_truncate() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let story = fixtures::story();

        for turn in 0..4 {
            store.append_event(&fixtures::event(&story, turn)).await.unwrap();
        }
        assert_eq!(store.load_events(&story.id).await.unwrap().len(), 4);

        store.truncate_events(&story.id, Some(1)).await.unwrap();
        let turns: Vec<u64> = store
            .load_events(&story.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.turn)
            .collect();
        assert_eq!(turns, vec![0, 1]);

        store.truncate_events(&story.id, None).await.unwrap();
        assert!(store.load_events(&story.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_torn_event_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let story = fixtures::story();
        store.append_event(&fixtures::event(&story, 0)).await.unwrap();

        let path = store.story_dir(&story.id).join("events.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"story_id\": \"half");
        std::fs::write(&path, content).unwrap();
        assert_eq!(store.load_events(&story.id).await.unwrap().len(), 1);

        // the next commit starts on a fresh line instead of extending the torn one
        store.append_event(&fixtures::event(&story, 1)).await.unwrap();
        let turns: Vec<u64> = store
            .load_events(&story.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.turn)
            .collect();
        assert_eq!(turns, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_agent_records() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let story = fixtures::story();
        let agent = AgentState::spawn(&CharacterConcept::new("Lord Ashford", "antagonist"));

        assert!(store.load_agent(&story.id, agent.id()).await.unwrap().is_none());
        store.save_agent(&story.id, &agent).await.unwrap();
        assert_eq!(
            store.load_agent(&story.id, agent.id()).await.unwrap(),
            Some(agent.clone())
        );

        std::fs::write(store.agent_path(&story.id, agent.id()), "{ not json").unwrap();
        assert!(matches!(
            store.load_agent(&story.id, agent.id()).await,
            Err(PersistError::Json(_))
        ));

        std::fs::write(store.agent_path(&story.id, agent.id()), [0xff, 0xfe, 0x00, 0x80]).unwrap();
        assert!(matches!(
            store.load_agent(&story.id, agent.id()).await,
            Err(PersistError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_ids_outside_the_root_are_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("saves"));
        std::fs::create_dir_all(dir.path().join("saves")).unwrap();
        let story = fixtures::story();
        FileStore::new(dir.path()).save_snapshot(&story).await.unwrap();

        let escaping = StoryId::from(format!("../{}", story.id).as_str());
        assert!(matches!(
            store.load_snapshot(&escaping).await,
            Err(PersistError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let story = fixtures::story();
        store.save_snapshot(&story).await.unwrap();

        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join("snapshot.json"), "garbage").unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, story.id);
    }
}
