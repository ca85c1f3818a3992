//! Testing utilities for the story engine.
//!
//! This module provides tools for integration testing:
//! - `ScriptedBackend` for deterministic generation without API calls
//! - `FaultyStore` for injecting persistence failures
//! - `fixtures` with a small ready-made story
//! - `TestHarness` wiring an orchestrator to both
//! - Assertion helpers for verifying story state

use crate::agent::AgentState;
use crate::backend::{Backend, BackendError, GenerationRequest, GenerationRole};
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::orchestrator::{Orchestrator, StoryError, TurnOutcome, TurnReport};
use crate::persist::{MemoryStore, PersistError, StoryStore};
use crate::router::{AttentionLevel, InformationPacket};
use crate::story::{CharacterId, Event, Story, StoryId, StoryStatus, StorySummary};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ============================================================================
// Scripted backend
// ============================================================================

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    Fail(BackendError),
    /// Reply after sleeping.
    Delayed(Duration, String),
}

/// A backend that answers from per-label queues.
///
/// Requests are matched by their label: a character id for character
/// agents, or a storyteller stage such as `"outline"` or `"compose"`. When
/// a queue runs dry a plausible default is returned, so tests only script
/// the replies they care about.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the named character.
    pub fn with_character(self, name: &str, reply: &str) -> Self {
        self.with_character_reply(name, Scripted::Reply(reply.to_string()))
    }

    pub fn with_character_reply(self, name: &str, reply: Scripted) -> Self {
        self.queue_character(name, reply);
        self
    }

    /// Queue a reply for a storyteller stage.
    pub fn with_storyteller(self, label: &str, reply: &str) -> Self {
        self.queue(label, Scripted::Reply(reply.to_string()));
        self
    }

    pub fn queue_character(&self, name: &str, reply: Scripted) {
        self.queue(CharacterId::from_name(name).as_str(), reply);
    }

    pub fn queue(&self, label: &str, reply: Scripted) {
        lock(&self.queues)
            .entry(label.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Every request received with this label, oldest first.
    pub fn requests_for(&self, label: &str) -> Vec<GenerationRequest> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.label == label)
            .cloned()
            .collect()
    }

    pub fn calls_for(&self, label: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.label == label)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Highest number of requests that were ever outstanding at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &GenerationRequest) -> Scripted {
        let scripted = lock(&self.queues)
            .get_mut(&request.label)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Scripted::Reply(default_reply(request)))
    }
}

fn default_reply(request: &GenerationRequest) -> String {
    if request.role == GenerationRole::Character {
        return r#"{"intent": "observe"}"#.to_string();
    }
    match request.label.as_str() {
        "outline" => fixtures::outline_json(),
        "world_context" => serde_json::json!({
            "cultural_context": "A court where every kindness is a debt",
            "established_facts": ["The king has been ill since the spring thaw"],
        })
        .to_string(),
        "opening_scene" => serde_json::json!({
            "scene_id": "opening",
            "when": "Late evening",
            "where": "The royal apothecary",
            "atmosphere": "Candle smoke and bitter herbs",
            "present_characters": ["Eleanor Blackwood"],
            "ongoing_events": ["The court waits for news of the king"],
        })
        .to_string(),
        "opening" => "Candle smoke hangs low over the royal apothecary. Eleanor Blackwood \
                      grinds a bitter root while the palace holds its breath."
            .to_string(),
        "scene_update" => "{}".to_string(),
        _ => "The moment stretches, heavy with consequence.".to_string(),
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn complete(&self, request: GenerationRequest) -> Result<String, BackendError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self.next_reply(&request);
        lock(&self.requests).push(request);

        match reply {
            Scripted::Reply(text) => Ok(text),
            Scripted::Fail(e) => Err(e),
            Scripted::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Faulty store
// ============================================================================

/// A [`MemoryStore`] whose writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_append: AtomicBool,
    fail_agent_save: AtomicBool,
    fail_snapshot: AtomicBool,
    fail_truncate: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// The underlying store, which never fails.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::SeqCst);
    }

    pub fn fail_agent_saves(&self, fail: bool) {
        self.fail_agent_save.store(fail, Ordering::SeqCst);
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshot.store(fail, Ordering::SeqCst);
    }

    pub fn fail_truncates(&self, fail: bool) {
        self.fail_truncate.store(fail, Ordering::SeqCst);
    }

    /// Clear every injected fault.
    pub fn heal(&self) {
        for flag in [
            &self.fail_append,
            &self.fail_agent_save,
            &self.fail_snapshot,
            &self.fail_truncate,
        ] {
            flag.store(false, Ordering::SeqCst);
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), PersistError> {
        if flag.load(Ordering::SeqCst) {
            Err(PersistError::Io(io::Error::other(format!(
                "injected {what} failure"
            ))))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoryStore for FaultyStore {
    async fn save_snapshot(&self, story: &Story) -> Result<(), PersistError> {
        Self::check(&self.fail_snapshot, "snapshot")?;
        self.inner.save_snapshot(story).await
    }

    async fn load_snapshot(&self, id: &StoryId) -> Result<Story, PersistError> {
        self.inner.load_snapshot(id).await
    }

    async fn append_event(&self, event: &Event) -> Result<(), PersistError> {
        Self::check(&self.fail_append, "append")?;
        self.inner.append_event(event).await
    }

    async fn truncate_events(
        &self,
        id: &StoryId,
        keep_through: Option<u64>,
    ) -> Result<(), PersistError> {
        Self::check(&self.fail_truncate, "truncate")?;
        self.inner.truncate_events(id, keep_through).await
    }

    async fn load_events(&self, id: &StoryId) -> Result<Vec<Event>, PersistError> {
        self.inner.load_events(id).await
    }

    async fn save_agent(&self, id: &StoryId, state: &AgentState) -> Result<(), PersistError> {
        Self::check(&self.fail_agent_save, "agent save")?;
        self.inner.save_agent(id, state).await
    }

    async fn load_agent(
        &self,
        id: &StoryId,
        character: &CharacterId,
    ) -> Result<Option<AgentState>, PersistError> {
        self.inner.load_agent(id, character).await
    }

    async fn list(&self) -> Result<Vec<StorySummary>, PersistError> {
        self.inner.list().await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A small court-intrigue story.
///
/// Eleanor Blackwood is the player; Lord Ashford and Captain Reyes are the
/// two major characters.
pub mod fixtures {
    use crate::story::{
        CharacterConcept, Event, EventKind, NarrativeExchange, PlayerCharacter, Scene, Story,
        StoryConfig, StoryOutline, StoryPreferences, StoryStatus,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    pub fn story_config() -> StoryConfig {
        let mut player = PlayerCharacter::new(
            "Eleanor Blackwood",
            "Royal physician to a king who is not getting better",
        );
        player.traits = vec!["observant".into(), "stubborn".into()];
        player.motivations = vec!["Find out who is poisoning the king".into()];

        let mut preferences = StoryPreferences::new("mystery", "tense");
        preferences.themes = vec!["loyalty".into(), "betrayal".into()];
        StoryConfig::new(player, preferences)
    }

    pub fn outline() -> StoryOutline {
        let mut ashford = CharacterConcept::new("Lord Ashford", "antagonist");
        ashford.description = "The king's chancellor, patient and cold".into();
        ashford.personality = vec!["calculating".into(), "proud".into()];
        ashford.goals = vec!["Take the regency".into()];
        ashford.secrets = vec!["He supplies the poison".into()];
        ashford.relationship_to_player = "Polite contempt".into();

        let mut reyes = CharacterConcept::new("Captain Reyes", "ally");
        reyes.description = "Captain of the palace guard".into();
        reyes.personality = vec!["loyal".into(), "blunt".into()];
        reyes.goals = vec!["Keep the king alive".into()];
        reyes.relationship_to_player = "Wary respect".into();

        StoryOutline {
            premise: "A physician races to unmask the king's poisoner".into(),
            acts: vec![
                "Suspicion".into(),
                "The chancellor's game".into(),
                "The antidote".into(),
            ],
            major_characters: vec![ashford, reyes],
            key_locations: vec!["The royal apothecary".into(), "The throne room".into()],
            potential_endings: vec!["The king lives".into(), "Ashford rules".into()],
        }
    }

    pub fn outline_json() -> String {
        serde_json::to_string(&outline()).unwrap_or_default()
    }

    /// Lord Ashford present, Captain Reyes just outside.
    pub fn scene() -> Scene {
        let mut scene = Scene::new("The royal apothecary");
        scene.when = "Late evening".into();
        scene.atmosphere = "Candle smoke and bitter herbs".into();
        scene.present = vec!["Eleanor Blackwood".into(), "Lord Ashford".into()];
        scene.nearby = vec!["Captain Reyes".into()];
        scene
    }

    /// A created story that already has its outline.
    pub fn story() -> Story {
        let mut story = Story::new(story_config());
        story.outline = Some(outline());
        story
    }

    /// An active story at turn 0 with both characters on the roster.
    pub fn active_story() -> Story {
        let mut story = story();
        story.scene = Some(scene());
        story.roster = outline().major_characters.iter().map(|c| c.id()).collect();
        story.status = StoryStatus::Active;
        story.narrative_history.push(NarrativeExchange {
            player_action: crate::storyteller::OPENING_MARKER.into(),
            narrative: "The apothecary smells of smoke.".into(),
        });
        story
    }

    /// An event for `turn`; turn 0 is the opening.
    pub fn event(story: &Story, turn: u64) -> Event {
        let kind = if turn == 0 {
            EventKind::Opening
        } else {
            EventKind::Turn
        };
        Event {
            story_id: story.id.clone(),
            turn,
            kind,
            player_input: (turn > 0).then(|| format!("action {turn}")),
            narrative: format!("narrative {turn}"),
            accepted_moves: Vec::new(),
            perceptions: BTreeMap::new(),
            scene: story.scene.clone().unwrap_or_else(scene),
            departed: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// An orchestrator wired to a scripted backend and a faulty store.
pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub backend: Arc<ScriptedBackend>,
    pub store: Arc<FaultyStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_parts(config, ScriptedBackend::new(), MemoryStore::new())
    }

    /// Use a pre-scripted backend and an existing store.
    pub fn with_parts(config: EngineConfig, backend: ScriptedBackend, store: MemoryStore) -> Self {
        let backend = Arc::new(backend);
        let store = Arc::new(FaultyStore::new(store));
        let ctx = EngineContext::new(config, backend.clone());
        let orchestrator = Orchestrator::new(ctx, store.clone());
        Self {
            orchestrator,
            backend,
            store,
        }
    }

    /// Create and start the fixture story.
    pub async fn start_story(&self) -> Result<StoryId, StoryError> {
        let id = self.orchestrator.create(fixtures::story_config()).await?;
        self.orchestrator.start(&id).await?;
        Ok(id)
    }

    /// Persist a prepared story and load it into the orchestrator.
    pub async fn seed_story(&self, story: &Story) -> Result<StoryId, StoryError> {
        self.store.inner().save_snapshot(story).await?;
        self.orchestrator.load(&story.id).await?;
        Ok(story.id.clone())
    }

    /// Play one turn that must commit.
    pub async fn play(&self, id: &StoryId, input: &str) -> Result<TurnReport, StoryError> {
        match self.orchestrator.continue_story(id, input).await? {
            TurnOutcome::Turn(report) => Ok(report),
            TurnOutcome::Meta(reply) => Err(StoryError::Generation(format!(
                "expected a turn, got meta reply: {reply}"
            ))),
        }
    }

    pub async fn events(&self, id: &StoryId) -> Result<Vec<Event>, StoryError> {
        Ok(self.store.inner().load_events(id).await?)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertions
// ============================================================================

/// Assert the attention level a character received.
#[track_caller]
pub fn assert_attention(
    packets: &BTreeMap<CharacterId, InformationPacket>,
    name: &str,
    expected: AttentionLevel,
) {
    let id = CharacterId::from_name(name);
    let actual = packets.get(&id).map(|p| p.attention);
    assert_eq!(
        actual,
        Some(expected),
        "{name} should have {expected:?} attention, got {actual:?}"
    );
}

/// Assert a story's turn and status.
#[track_caller]
pub fn assert_story_at(story: &Story, turn: u64, status: StoryStatus) {
    assert_eq!(story.turn, turn, "story should be at turn {turn}");
    assert_eq!(story.status, status, "story should be {status:?}");
}

/// Assert every line appears verbatim in the narrative.
#[track_caller]
pub fn assert_narrative_contains(narrative: &str, lines: &[&str]) {
    for line in lines {
        assert!(
            narrative.contains(line),
            "narrative is missing {line:?}:\n{narrative}"
        );
    }
}

/// Assert the turns present in an event log.
#[track_caller]
pub fn assert_event_turns(events: &[Event], expected: &[u64]) {
    let turns: Vec<u64> = events.iter().map(|e| e.turn).collect();
    assert_eq!(turns, expected, "unexpected event log");
}
