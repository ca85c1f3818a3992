//! Story data model.
//!
//! The [`Story`] aggregate, its [`Scene`], the outline it was generated
//! from, and the append-only [`Event`] records every committed turn leaves
//! behind.

use crate::agent::{CharacterMove, SpecialPerception};
use crate::router::InformationPacket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a story.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(String);

impl StoryId {
    /// Create a new id of the form `<player_slug>_<8 hex digits>`.
    pub fn generate(player_name: &str) -> Self {
        let mut slug = slugify(player_name);
        if slug.is_empty() {
            slug = "story".to_string();
        }
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{slug}_{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id can name a single directory: non-empty, and only
    /// alphanumerics, `_` and `-`.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    }
}

impl From<&str> for StoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for a major character, derived from the character's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(String);

impl CharacterId {
    /// Derive the id for a character name ("Lord Ashford" -> "lord_ashford").
    pub fn from_name(name: &str) -> Self {
        Self(slugify(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CharacterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

// ============================================================================
// Story configuration
// ============================================================================

/// The player's character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerCharacter {
    pub name: String,
    pub background: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub motivations: Vec<String>,
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
}

impl PlayerCharacter {
    pub fn new(name: impl Into<String>, background: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            background: background.into(),
            traits: Vec::new(),
            motivations: Vec::new(),
            appearance: String::new(),
            skills: Vec::new(),
            relationships: BTreeMap::new(),
        }
    }
}

/// Target story length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryLength {
    #[default]
    Short,
    Medium,
    Long,
}

/// Player preferences for story generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPreferences {
    pub genre: String,
    pub tone: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub length: StoryLength,
    /// Stored and shown to the storyteller; not enforced.
    #[serde(default)]
    pub content_boundaries: Vec<String>,
}

impl StoryPreferences {
    pub fn new(genre: impl Into<String>, tone: impl Into<String>) -> Self {
        Self {
            genre: genre.into(),
            tone: tone.into(),
            themes: Vec::new(),
            length: StoryLength::Short,
            content_boundaries: Vec::new(),
        }
    }
}

/// Per-story temperature overrides. Unset roles use the engine defaults.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RoleTemperatures {
    #[serde(default)]
    pub director: Option<f32>,
    #[serde(default)]
    pub storyteller: Option<f32>,
    #[serde(default)]
    pub character: Option<f32>,
}

/// Everything the player chooses when creating a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryConfig {
    pub player_character: PlayerCharacter,
    pub preferences: StoryPreferences,
    #[serde(default)]
    pub temperatures: RoleTemperatures,
    /// Tie-break seed for this story; the engine seed when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl StoryConfig {
    pub fn new(player_character: PlayerCharacter, preferences: StoryPreferences) -> Self {
        Self {
            player_character,
            preferences,
            temperatures: RoleTemperatures::default(),
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_temperatures(mut self, temperatures: RoleTemperatures) -> Self {
        self.temperatures = temperatures;
        self
    }
}

// ============================================================================
// Outline
// ============================================================================

/// High-level concept for a character that will be spawned as an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterConcept {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub relationship_to_player: String,
    /// Ways this character can learn of events away from the scene.
    #[serde(default)]
    pub perception: Vec<SpecialPerception>,
}

impl CharacterConcept {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            description: String::new(),
            personality: Vec::new(),
            goals: Vec::new(),
            secrets: Vec::new(),
            relationship_to_player: String::new(),
            perception: Vec::new(),
        }
    }

    pub fn id(&self) -> CharacterId {
        CharacterId::from_name(&self.name)
    }
}

/// Generated story structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryOutline {
    pub premise: String,
    #[serde(default)]
    pub acts: Vec<String>,
    #[serde(default)]
    pub major_characters: Vec<CharacterConcept>,
    #[serde(default)]
    pub key_locations: Vec<String>,
    #[serde(default)]
    pub potential_endings: Vec<String>,
}

impl StoryOutline {
    /// Look up a major character concept by id.
    pub fn concept(&self, id: &CharacterId) -> Option<&CharacterConcept> {
        self.major_characters.iter().find(|c| &c.id() == id)
    }
}

// ============================================================================
// Scene
// ============================================================================

/// Where a character stands relative to the current scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Present,
    Nearby,
    Remote,
}

/// The live scene of a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub scene_id: String,
    #[serde(default)]
    pub when: String,
    #[serde(rename = "where")]
    pub location: String,
    #[serde(default)]
    pub atmosphere: String,
    #[serde(default, alias = "present_characters")]
    pub present: Vec<String>,
    #[serde(default, alias = "nearby_characters")]
    pub nearby: Vec<String>,
    #[serde(default, alias = "remote_characters")]
    pub remote: Vec<String>,
    #[serde(default)]
    pub ongoing_events: Vec<String>,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub revision: u64,
}

impl Scene {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            scene_id: "opening".to_string(),
            when: String::new(),
            location: location.into(),
            atmosphere: String::new(),
            present: Vec::new(),
            nearby: Vec::new(),
            remote: Vec::new(),
            ongoing_events: Vec::new(),
            facts: Vec::new(),
            revision: 0,
        }
    }

    /// Partition rule: present wins over nearby; anyone else is remote.
    pub fn position_of(&self, name: &str) -> Position {
        let id = CharacterId::from_name(name);
        let listed = |names: &[String]| names.iter().any(|n| CharacterId::from_name(n) == id);

        if listed(&self.present) {
            Position::Present
        } else if listed(&self.nearby) {
            Position::Nearby
        } else {
            Position::Remote
        }
    }

    /// Move a character into the present list.
    pub fn bring_into_scene(&mut self, name: &str) {
        let id = CharacterId::from_name(name);
        self.nearby.retain(|n| CharacterId::from_name(n) != id);
        self.remote.retain(|n| CharacterId::from_name(n) != id);
        if !self.present.iter().any(|n| CharacterId::from_name(n) == id) {
            self.present.push(name.to_string());
        }
    }

    /// Remove a character from every membership list.
    pub fn remove_character(&mut self, name: &str) {
        let id = CharacterId::from_name(name);
        for list in [&mut self.present, &mut self.nearby, &mut self.remote] {
            list.retain(|n| CharacterId::from_name(n) != id);
        }
    }

    /// Human-readable summary used by the `/scene` meta command.
    pub fn describe(&self) -> String {
        let or_none = |names: &[String]| {
            if names.is_empty() {
                "None".to_string()
            } else {
                names.join(", ")
            }
        };
        format!(
            "CURRENT SCENE (revision {}):\nWhere: {}\nWhen: {}\nAtmosphere: {}\nPresent: {}\nNearby: {}",
            self.revision,
            self.location,
            self.when,
            self.atmosphere,
            or_none(&self.present),
            or_none(&self.nearby),
        )
    }
}

// ============================================================================
// Story aggregate
// ============================================================================

/// Lifecycle status of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Created,
    Initializing,
    Active,
    Ended,
}

/// One exchange the storyteller remembers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeExchange {
    pub player_action: String,
    pub narrative: String,
}

/// The root aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub config: StoryConfig,
    pub outline: Option<StoryOutline>,
    pub scene: Option<Scene>,
    /// Spawned character ids in spawn order; this order drives the director.
    pub roster: Vec<CharacterId>,
    /// Number of committed player turns (the opening is turn 0).
    pub turn: u64,
    pub status: StoryStatus,
    #[serde(default)]
    pub world_context: Option<serde_json::Value>,
    #[serde(default)]
    pub narrative_history: Vec<NarrativeExchange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    pub fn new(config: StoryConfig) -> Self {
        let now = Utc::now();
        Self {
            id: StoryId::generate(&config.player_character.name),
            config,
            outline: None,
            scene: None,
            roster: Vec::new(),
            turn: 0,
            status: StoryStatus::Created,
            world_context: None,
            narrative_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn player_name(&self) -> &str {
        &self.config.player_character.name
    }

    /// Record one storyteller exchange, keeping at most `max_turns`.
    pub fn push_narrative(&mut self, exchange: NarrativeExchange, max_turns: usize) {
        self.narrative_history.push(exchange);
        let excess = self.narrative_history.len().saturating_sub(max_turns);
        self.narrative_history.drain(..excess);
    }

    pub fn summary(&self) -> StorySummary {
        StorySummary {
            id: self.id.clone(),
            player_name: self.player_name().to_string(),
            genre: self.config.preferences.genre.clone(),
            tone: self.config.preferences.tone.clone(),
            status: self.status,
            turn: self.turn,
            updated_at: self.updated_at,
        }
    }
}

/// Short description of a stored story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySummary {
    pub id: StoryId,
    pub player_name: String,
    pub genre: String,
    pub tone: String,
    pub status: StoryStatus,
    pub turn: u64,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Event log
// ============================================================================

/// What produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Opening,
    Turn,
}

/// An immutable record of one committed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub story_id: StoryId,
    pub turn: u64,
    pub kind: EventKind,
    pub player_input: Option<String>,
    pub narrative: String,
    #[serde(default)]
    pub accepted_moves: Vec<CharacterMove>,
    /// What each informed character perceived this turn.
    #[serde(default)]
    pub perceptions: BTreeMap<CharacterId, Perception>,
    /// The scene as it stood after this turn.
    pub scene: Scene,
    /// Characters who left the story for good this turn.
    #[serde(default)]
    pub departed: Vec<CharacterId>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Stable id of the event for a given turn, used by information packets.
    pub fn id_for(story_id: &StoryId, turn: u64) -> String {
        format!("{story_id}#{turn}")
    }

    pub fn id(&self) -> String {
        Self::id_for(&self.story_id, self.turn)
    }
}

/// A character's perception of one turn, as stored in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perception {
    pub packet: InformationPacket,
    /// One-line summary of the character's own response.
    pub response: String,
    #[serde(default)]
    pub key_memory: Option<String>,
    #[serde(default)]
    pub emotional_state: Option<String>,
    #[serde(default)]
    pub beliefs: BTreeMap<String, String>,
}
