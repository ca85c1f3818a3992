//! Storyteller composition.
//!
//! Generates the outline, world context and opening scene, and turns each
//! validated turn into prose. It also decides who enters and leaves the
//! scene after each turn. World context, the opening scene and scene updates
//! are structured calls issued under the director's low-temperature
//! parameters.
//!
//! The storyteller is omniscient: it sees every accepted move and keeps a
//! bounded history of player actions and the narrative it wrote for them.

use crate::agent::Dossier;
use crate::backend::{Backend, BackendError, ContextMessage, GenerationRequest, GenerationRole};
use crate::config::RoleParams;
use crate::director::DirectorValidation;
use crate::parse::{clean_prose, parse_structured};
use crate::story::{
    CharacterId, NarrativeExchange, PlayerCharacter, Position, Scene, StoryConfig, StoryOutline,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are the storyteller of an interactive story. You write vivid, \
consistent third-person past tense prose and never contradict established facts.";

/// Marker used as the player action of the opening exchange.
pub const OPENING_MARKER: &str = "[OPENING SCENE]";

/// Errors from story generation.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("could not generate {stage}: {reason}")]
    Malformed { stage: &'static str, reason: String },
}

/// Cast movement decided after a turn.
///
/// Names are matched against the active cast; anything else is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneUpdate {
    /// New location, when the player has gone somewhere else.
    #[serde(default, rename = "where")]
    pub location: Option<String>,
    /// Characters who step into the scene.
    #[serde(default)]
    pub enter: Vec<String>,
    /// Characters who come within earshot without joining.
    #[serde(default)]
    pub approach: Vec<String>,
    /// Characters who leave the scene.
    #[serde(default)]
    pub leave: Vec<String>,
    /// Characters who leave the story for good.
    #[serde(default)]
    pub depart: Vec<String>,
}

/// What applying a [`SceneUpdate`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneChanges {
    pub arrived: Vec<String>,
    pub departed: Vec<String>,
}

impl SceneChanges {
    pub fn is_empty(&self) -> bool {
        self.arrived.is_empty() && self.departed.is_empty()
    }

    pub fn departed_ids(&self) -> Vec<CharacterId> {
        self.departed.iter().map(|n| CharacterId::from_name(n)).collect()
    }
}

impl SceneUpdate {
    /// Apply to `scene`, using the canonical spelling from `cast`.
    pub fn apply(&self, scene: &mut Scene, cast: &[&str]) -> SceneChanges {
        let canonical = |name: &String| {
            let id = CharacterId::from_name(name);
            cast.iter().copied().find(|c| CharacterId::from_name(c) == id)
        };
        let mut changes = SceneChanges::default();

        if let Some(location) = self.location.as_deref().map(str::trim) {
            if !location.is_empty() {
                scene.location = location.to_string();
            }
        }

        for name in self.depart.iter().filter_map(canonical) {
            scene.remove_character(name);
            if !changes.departed.iter().any(|d| d == name) {
                changes.departed.push(name.to_string());
            }
        }
        let staying = |name: &&str| !changes.departed.iter().any(|d| d == name);

        for name in self.leave.iter().filter_map(canonical) {
            scene.remove_character(name);
        }
        for name in self.approach.iter().filter_map(canonical).filter(staying) {
            if scene.position_of(name) == Position::Remote {
                scene.remote.retain(|n| CharacterId::from_name(n) != CharacterId::from_name(name));
                scene.nearby.push(name.to_string());
            }
        }
        let mut arrived = Vec::new();
        for name in self.enter.iter().filter_map(canonical).filter(staying) {
            if scene.position_of(name) != Position::Present {
                scene.bring_into_scene(name);
                arrived.push(name.to_string());
            }
        }
        changes.arrived = arrived;
        changes
    }
}

/// Narrative compositor bound to one backend and parameter set.
pub struct Storyteller<'a> {
    backend: &'a dyn Backend,
    /// Parameters for prose.
    narration: RoleParams,
    /// Parameters for low-temperature structured output.
    structured: RoleParams,
    max_context_tokens: usize,
}

impl<'a> Storyteller<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        narration: RoleParams,
        structured: RoleParams,
        max_context_tokens: usize,
    ) -> Self {
        Self {
            backend,
            narration,
            structured,
            max_context_tokens,
        }
    }

    /// Generate the story outline.
    pub async fn outline(&self, config: &StoryConfig) -> Result<StoryOutline, GenerationError> {
        let player = &config.player_character;
        let prefs = &config.preferences;
        let prompt = format!(
            r#"Create a story outline for an interactive narrative.

PLAYER CHARACTER:
Name: {name}
Background: {background}
Traits: {traits}
Motivations: {motivations}

STORY PREFERENCES:
Genre: {genre}
Tone: {tone}
Themes: {themes}
Length: {length:?}
Content boundaries: {boundaries}

Give a premise that involves the player character, 3-5 acts, 2-4 major characters with goals
that create tension with the player, key locations and 2-3 potential endings.

Return JSON:
{{
  "premise": "one paragraph",
  "acts": ["act 1", "act 2"],
  "major_characters": [
    {{
      "name": "Character Name",
      "role": "antagonist/ally/rival/romantic interest",
      "description": "brief description",
      "personality": ["trait"],
      "goals": ["goal"],
      "secrets": ["secret"],
      "relationship_to_player": "how they relate to the player"
    }}
  ],
  "key_locations": ["location"],
  "potential_endings": ["ending"]
}}"#,
            name = player.name,
            background = player.background,
            traits = join_or(&player.traits, "None specified"),
            motivations = join_or(&player.motivations, "None specified"),
            genre = prefs.genre,
            tone = prefs.tone,
            themes = join_or(&prefs.themes, "None specified"),
            length = prefs.length,
            boundaries = join_or(&prefs.content_boundaries, "None"),
        );

        let params = RoleParams {
            json_mode: true,
            ..self.narration
        };
        let outline: StoryOutline = self
            .structured_with_retry(
                GenerationRole::Storyteller,
                "outline",
                SYSTEM_PROMPT.to_string(),
                prompt,
                params,
            )
            .await?;

        if outline.major_characters.is_empty() {
            warn!("Outline has no major characters");
        }
        Ok(outline)
    }

    /// Generate world-building details. Falls back to a minimal object.
    pub async fn world_context(
        &self,
        outline: &StoryOutline,
        config: &StoryConfig,
    ) -> Result<serde_json::Value, GenerationError> {
        let names: Vec<String> = outline
            .major_characters
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let prompt = format!(
            r#"Generate world-building for this interactive story.

PREMISE: {premise}
GENRE: {genre}
TONE: {tone}
KEY LOCATIONS: {locations}
MAJOR CHARACTERS: {names}

Return JSON with: cultural_context, historical_background, world_rules, factions, locations,
established_facts (10-15 facts that must stay true), tone_guidelines, npc_types."#,
            premise = outline.premise,
            genre = config.preferences.genre,
            tone = config.preferences.tone,
            locations = outline.key_locations.join(", "),
            names = names.join(", "),
        );

        let request = GenerationRequest::new(
            GenerationRole::Director,
            "world_context",
            SYSTEM_PROMPT,
            self.structured,
        )
        .with_user(prompt);
        let reply = self.backend.complete(request).await?;

        match parse_structured::<serde_json::Value>(&reply) {
            Ok(value) if value.is_object() => Ok(value),
            Ok(_) | Err(_) => {
                warn!("World context was not a JSON object, using fallback");
                Ok(json!({
                    "cultural_context": "Details to be established during play",
                    "established_facts": [],
                }))
            }
        }
    }

    /// Generate the opening scene.
    ///
    /// Major characters are kept out of it and the player is always present.
    pub async fn opening_scene(
        &self,
        outline: &StoryOutline,
        player: &PlayerCharacter,
    ) -> Result<Scene, GenerationError> {
        let first_act = outline
            .acts
            .first()
            .map(String::as_str)
            .unwrap_or("Beginning of the story");
        let prompt = format!(
            r#"Create the opening scene for this story.

PREMISE: {premise}
FIRST ACT: {first_act}
PLAYER CHARACTER: {name} - {background}

The scene introduces the player character in their element, establishes atmosphere and stakes,
and gives clear hooks for action. Do NOT include any major character yet.

Return JSON:
{{
  "scene_id": "opening",
  "when": "time of day and context",
  "where": "location",
  "atmosphere": "mood and sensory details",
  "present_characters": ["{name}"],
  "nearby_characters": [],
  "ongoing_events": ["event"],
  "facts": ["fact"]
}}"#,
            premise = outline.premise,
            name = player.name,
            background = player.background,
        );

        let generated: Result<Scene, GenerationError> = self
            .structured_with_retry(
                GenerationRole::Director,
                "opening scene",
                SYSTEM_PROMPT.to_string(),
                prompt,
                self.structured,
            )
            .await;

        let mut scene = match generated {
            Ok(scene) => scene,
            Err(GenerationError::Malformed { reason, .. }) => {
                warn!(%reason, "Opening scene unusable, using a minimal scene");
                let location = outline
                    .key_locations
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "an unfamiliar place".to_string());
                Scene::new(location)
            }
            Err(e) => return Err(e),
        };

        for concept in &outline.major_characters {
            scene.remove_character(&concept.name);
        }
        scene.bring_into_scene(&player.name);
        if scene.scene_id.is_empty() {
            scene.scene_id = "opening".to_string();
        }
        scene.revision = 0;
        Ok(scene)
    }

    /// Write the opening narrative.
    pub async fn compose_opening(
        &self,
        scene: &Scene,
        outline: &StoryOutline,
        world_context: Option<&serde_json::Value>,
    ) -> Result<String, GenerationError> {
        let prompt = format!(
            r#"Compose the opening narrative for this interactive story.

SCENE:
When: {when}
Where: {location}
Atmosphere: {atmosphere}
Ongoing: {ongoing}

PREMISE: {premise}

Write 300-500 words that establish the setting, introduce the player character in action and end
on a moment where the player can make a choice. No dialogue from major characters."#,
            when = scene.when,
            location = scene.location,
            atmosphere = scene.atmosphere,
            ongoing = scene.ongoing_events.join(", "),
            premise = outline.premise,
        );

        let request = GenerationRequest::new(
            GenerationRole::Storyteller,
            "opening",
            system_with_world(world_context),
            self.narration,
        )
        .with_user(prompt)
        .fit_to_budget(self.max_context_tokens);

        let reply = self.backend.complete(request).await?;
        non_empty_prose("opening narrative", &reply)
    }

    /// Decide who enters, approaches or leaves after a validated turn.
    ///
    /// An unusable reply leaves the scene as it is.
    pub async fn scene_update(
        &self,
        player_action: &str,
        scene: &Scene,
        validation: &DirectorValidation,
        cast: &[&Dossier],
    ) -> Result<SceneUpdate, GenerationError> {
        if cast.is_empty() {
            return Ok(SceneUpdate::default());
        }
        let roster = cast
            .iter()
            .map(|d| {
                let position = match scene.position_of(&d.name) {
                    Position::Present => "present",
                    Position::Nearby => "nearby",
                    Position::Remote => "off-stage",
                };
                format!(
                    "- {} ({}, {position}): {}. Goals: {}",
                    d.name,
                    d.role,
                    d.description,
                    join_or(&d.goals, "none stated")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let moves = validation
            .accepted
            .iter()
            .map(|mv| format!("- {}", mv.summary()))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"Decide how the cast moves after this turn.

SCENE: {location}
PRESENT: {present}
NEARBY: {nearby}

PLAYER ACTION: {player_action}

ACCEPTED MOVES:
{moves}

MAJOR CHARACTERS:
{roster}

An off-stage character enters when the player seeks them out, goes where they are, or their
goals draw them here. Characters may also drift within earshot, walk away, or, rarely, leave
the story for good. Use only the names listed above. Give "where" only if the player moved to
a new location.

Return JSON:
{{"where": null, "enter": [], "approach": [], "leave": [], "depart": []}}"#,
            location = scene.location,
            present = join_or(&scene.present, "Nobody"),
            nearby = join_or(&scene.nearby, "Nobody"),
            moves = if moves.is_empty() { "None".to_string() } else { moves },
        );

        let request = GenerationRequest::new(
            GenerationRole::Director,
            "scene_update",
            SYSTEM_PROMPT,
            self.structured,
        )
        .with_user(prompt);
        let reply = self.backend.complete(request).await?;

        match parse_structured::<SceneUpdate>(&reply) {
            Ok(update) => Ok(update),
            Err(e) => {
                warn!(reason = %e.reason, "Scene update unusable, keeping the scene");
                Ok(SceneUpdate::default())
            }
        }
    }

    /// Write the narrative for one turn.
    ///
    /// `scene` is the scene as it stands after the turn. Every accepted line
    /// of dialogue appears verbatim in the result.
    pub async fn compose(
        &self,
        player_action: &str,
        scene: &Scene,
        validation: &DirectorValidation,
        changes: &SceneChanges,
        history: &[NarrativeExchange],
        world_context: Option<&serde_json::Value>,
    ) -> Result<String, GenerationError> {
        let moves = if validation.accepted.is_empty() {
            "None - characters observe silently".to_string()
        } else {
            validation
                .accepted
                .iter()
                .map(|mv| format!("- {}", mv.summary()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let reactions = if validation.npc_reactions.is_empty() {
            "None".to_string()
        } else {
            validation
                .npc_reactions
                .iter()
                .map(|r| format!("- {r}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            r#"Compose the narrative for this turn.

SCENE: {location} - {atmosphere}
PRESENT: {present}

PLAYER ACTION: {player_action}

CHARACTER RESPONSES:
{moves}

NPC REACTIONS NEEDED:
{reactions}

ARRIVING: {arriving}
LEAVING THE STORY: {departing}

Write 200-500 words of third-person past tense narrative that describes the player's action and
its effects, weaves in the character responses, shows the NPC reactions, brings arriving
characters on stage and ends on a natural pause. Preserve character dialogue EXACTLY as given."#,
            location = scene.location,
            atmosphere = scene.atmosphere,
            present = scene.present.join(", "),
            arriving = join_or(&changes.arrived, "Nobody"),
            departing = join_or(&changes.departed, "Nobody"),
        );

        let mut messages = history_messages(history);
        messages.push(ContextMessage::user(prompt.clone()));

        let request = GenerationRequest::new(
            GenerationRole::Storyteller,
            "compose",
            system_with_world(world_context),
            self.narration,
        )
        .with_messages(messages.clone())
        .fit_to_budget(self.max_context_tokens);

        let lines = validation.dialogue();
        let mut narrative = non_empty_prose("narrative", &self.backend.complete(request).await?)?;

        let missing = missing_dialogue(&narrative, &lines);
        if missing.is_empty() {
            return Ok(narrative);
        }

        debug!(missing = missing.len(), "Dialogue missing from narrative, retrying");
        let required = missing
            .iter()
            .map(|(name, line)| format!("- {name}: \"{line}\""))
            .collect::<Vec<_>>()
            .join("\n");
        messages.pop();
        messages.push(ContextMessage::user(format!(
            "{prompt}\n\nYour previous draft dropped required dialogue. Include each of these lines \
word for word, inside quotation marks:\n{required}"
        )));
        let retry = GenerationRequest::new(
            GenerationRole::Storyteller,
            "compose",
            system_with_world(world_context),
            self.narration,
        )
        .with_messages(messages)
        .fit_to_budget(self.max_context_tokens);

        if let Ok(text) = non_empty_prose("narrative", &self.backend.complete(retry).await?) {
            narrative = text;
        }

        let still_missing = missing_dialogue(&narrative, &lines);
        if !still_missing.is_empty() {
            warn!(
                missing = still_missing.len(),
                "Splicing dropped dialogue into narrative"
            );
            for (name, line) in still_missing {
                narrative.push_str(&format!("\n\n{name} said, \"{line}\""));
            }
        }
        Ok(narrative)
    }

    async fn structured_with_retry<T: DeserializeOwned>(
        &self,
        role: GenerationRole,
        stage: &'static str,
        system: String,
        prompt: String,
        params: RoleParams,
    ) -> Result<T, GenerationError> {
        let label = stage.replace(' ', "_");
        let request = GenerationRequest::new(role, &label, &system, params)
            .with_user(prompt.clone());

        let reason = match parse_structured::<T>(&self.backend.complete(request).await?) {
            Ok(value) => return Ok(value),
            Err(e) => e.reason,
        };

        debug!(stage, %reason, "Structured reply malformed, retrying");
        let stricter = format!(
            "{prompt}\n\nYour previous reply was not valid JSON for this structure ({reason}). \
Reply with ONLY the JSON object."
        );
        let request = GenerationRequest::new(role, &label, &system, params).with_user(stricter);

        parse_structured::<T>(&self.backend.complete(request).await?).map_err(|e| {
            GenerationError::Malformed {
                stage,
                reason: e.reason,
            }
        })
    }
}

/// Lines of accepted dialogue that do not appear verbatim in `text`.
pub fn missing_dialogue<'v>(text: &str, lines: &[(&'v str, &'v str)]) -> Vec<(&'v str, &'v str)> {
    lines
        .iter()
        .copied()
        .filter(|(_, line)| !text.contains(line))
        .collect()
}

fn history_messages(history: &[NarrativeExchange]) -> Vec<ContextMessage> {
    let mut messages = Vec::with_capacity(history.len() * 2);
    for exchange in history {
        let action = if exchange.player_action == OPENING_MARKER {
            OPENING_MARKER.to_string()
        } else {
            format!("PLAYER ACTION: {}", exchange.player_action)
        };
        messages.push(ContextMessage::user(action));
        messages.push(ContextMessage::assistant(exchange.narrative.clone()));
    }
    messages
}

fn system_with_world(world_context: Option<&serde_json::Value>) -> String {
    match world_context.and_then(|w| serde_json::to_string_pretty(w).ok()) {
        Some(world) => format!(
            "{SYSTEM_PROMPT}\n\nWORLD CONTEXT (maintain consistency with these details):\n{world}"
        ),
        None => SYSTEM_PROMPT.to_string(),
    }
}

fn non_empty_prose(stage: &'static str, reply: &str) -> Result<String, GenerationError> {
    let text = clean_prose(reply);
    if text.is_empty() {
        return Err(GenerationError::Malformed {
            stage,
            reason: "empty reply".to_string(),
        });
    }
    Ok(text)
}

fn join_or(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        empty.to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{CharacterMove, Intent};
    use crate::story::{CharacterId, PlayerCharacter};
    use crate::testing::{fixtures, ScriptedBackend};

    fn storyteller(backend: &ScriptedBackend) -> Storyteller<'_> {
        Storyteller::new(backend, RoleParams::storyteller(), RoleParams::director(), 8192)
    }

    fn validation_with(line: &str) -> DirectorValidation {
        DirectorValidation {
            accepted: vec![CharacterMove {
                character: CharacterId::from_name("Lord Ashford"),
                name: "Lord Ashford".into(),
                intent: Intent::Speak {
                    dialogue: line.into(),
                },
                targets: vec![],
                rationale: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_outline_retries_once() {
        let backend = ScriptedBackend::new()
            .with_storyteller("outline", "Once upon a time...")
            .with_storyteller("outline", &fixtures::outline_json());
        let outline = storyteller(&backend)
            .outline(&fixtures::story_config())
            .await
            .unwrap();
        assert_eq!(outline.major_characters.len(), 2);
        assert_eq!(backend.calls_for("outline"), 2);
    }

    #[tokio::test]
    async fn test_outline_fails_after_retry() {
        let backend = ScriptedBackend::new()
            .with_storyteller("outline", "nope")
            .with_storyteller("outline", "still nope");
        let err = storyteller(&backend)
            .outline(&fixtures::story_config())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Malformed { stage: "outline", .. }));
    }

    #[tokio::test]
    async fn test_world_context_fallback() {
        let backend = ScriptedBackend::new().with_storyteller("world_context", "A rich world.");
        let outline = fixtures::outline();
        let world = storyteller(&backend)
            .world_context(&outline, &fixtures::story_config())
            .await
            .unwrap();
        assert_eq!(world["cultural_context"], "Details to be established during play");
    }

    #[tokio::test]
    async fn test_opening_scene_excludes_major_characters() {
        let backend = ScriptedBackend::new().with_storyteller(
            "opening_scene",
            r#"{"where": "The apothecary", "present_characters": ["Lord Ashford"], "nearby_characters": ["Captain Reyes"]}"#,
        );
        let player = PlayerCharacter::new("Eleanor Blackwood", "Royal physician");
        let scene = storyteller(&backend)
            .opening_scene(&fixtures::outline(), &player)
            .await
            .unwrap();

        assert_eq!(scene.present, vec!["Eleanor Blackwood".to_string()]);
        assert!(scene.nearby.is_empty());
        assert_eq!(scene.scene_id, "opening");
    }

    #[tokio::test]
    async fn test_compose_keeps_dialogue() {
        let backend = ScriptedBackend::new().with_storyteller(
            "compose",
            "Lord Ashford straightened. \"I will not yield.\" The candles guttered.",
        );
        let text = storyteller(&backend)
            .compose(
                "I draw a sword",
                &fixtures::scene(),
                &validation_with("I will not yield."),
                &SceneChanges::default(),
                &[],
                None,
            )
            .await
            .unwrap();
        assert!(text.contains("I will not yield."));
        assert_eq!(backend.calls_for("compose"), 1);
    }

    #[tokio::test]
    async fn test_compose_splices_missing_dialogue() {
        let backend = ScriptedBackend::new()
            .with_storyteller("compose", "Lord Ashford refused, loudly.")
            .with_storyteller("compose", "Lord Ashford refused again.");
        let text = storyteller(&backend)
            .compose(
                "I draw a sword",
                &fixtures::scene(),
                &validation_with("I will not yield."),
                &SceneChanges::default(),
                &[],
                None,
            )
            .await
            .unwrap();

        assert!(text.contains("Lord Ashford said, \"I will not yield.\""));
        assert_eq!(backend.calls_for("compose"), 2);
        let requests = backend.requests_for("compose");
        assert!(requests[1].prompt().contains("word for word"));
    }

    #[tokio::test]
    async fn test_compose_sends_history() {
        let backend = ScriptedBackend::new();
        let history = vec![NarrativeExchange {
            player_action: "I open the door".into(),
            narrative: "The door creaked open.".into(),
        }];
        storyteller(&backend)
            .compose(
                "I step inside",
                &fixtures::scene(),
                &DirectorValidation::default(),
                &SceneChanges::default(),
                &history,
                Some(&serde_json::json!({"established_facts": ["The king is ill"]})),
            )
            .await
            .unwrap();

        let request = &backend.requests_for("compose")[0];
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0].content, "PLAYER ACTION: I open the door");
        assert!(request.system.contains("The king is ill"));
    }

    #[test]
    fn test_scene_update_moves_only_the_cast() {
        let mut scene = fixtures::scene();
        scene.present.retain(|n| n != "Lord Ashford");
        let update = SceneUpdate {
            location: Some("the chapel crypt".into()),
            enter: vec!["lord ashford".into(), "A Stranger".into()],
            approach: vec![],
            leave: vec!["Captain Reyes".into()],
            depart: vec![],
        };

        let changes = update.apply(&mut scene, &["Lord Ashford", "Captain Reyes"]);

        assert_eq!(scene.location, "the chapel crypt");
        assert_eq!(scene.present, vec!["Eleanor Blackwood", "Lord Ashford"]);
        assert!(scene.nearby.is_empty());
        assert_eq!(scene.position_of("A Stranger"), Position::Remote);
        assert_eq!(changes.arrived, vec!["Lord Ashford".to_string()]);
        assert!(changes.departed.is_empty());
    }

    #[test]
    fn test_departure_wins_over_entry() {
        let mut scene = fixtures::scene();
        let update = SceneUpdate {
            enter: vec!["Captain Reyes".into()],
            depart: vec!["Captain Reyes".into()],
            ..Default::default()
        };

        let changes = update.apply(&mut scene, &["Lord Ashford", "Captain Reyes"]);

        assert_eq!(scene.position_of("Captain Reyes"), Position::Remote);
        assert!(changes.arrived.is_empty());
        assert_eq!(changes.departed_ids(), vec![CharacterId::from_name("Captain Reyes")]);
    }

    #[tokio::test]
    async fn test_scene_update_request() {
        let backend = ScriptedBackend::new().with_storyteller(
            "scene_update",
            r#"Sure. {"where": null, "enter": ["Lord Ashford"], "approach": [], "leave": [], "depart": []}"#,
        );
        let outline = fixtures::outline();
        let dossiers: Vec<Dossier> = outline
            .major_characters
            .iter()
            .map(Dossier::from_concept)
            .collect();
        let cast: Vec<&Dossier> = dossiers.iter().collect();

        let update = storyteller(&backend)
            .scene_update(
                "I send for Lord Ashford",
                &fixtures::scene(),
                &DirectorValidation::default(),
                &cast,
            )
            .await
            .unwrap();

        assert_eq!(update.enter, vec!["Lord Ashford".to_string()]);
        assert_eq!(update.location, None);
        let request = &backend.requests_for("scene_update")[0];
        assert_eq!(request.role, GenerationRole::Director);
        assert!(request.prompt().contains("- Captain Reyes (ally, nearby)"));
    }

    #[tokio::test]
    async fn test_unusable_scene_update_keeps_the_scene() {
        let backend =
            ScriptedBackend::new().with_storyteller("scene_update", "Everyone stays put.");
        let dossier = Dossier::from_concept(&fixtures::outline().major_characters[0]);

        let update = storyteller(&backend)
            .scene_update("I wait", &fixtures::scene(), &DirectorValidation::default(), &[&dossier])
            .await
            .unwrap();

        assert_eq!(update, SceneUpdate::default());
    }

    #[test]
    fn test_missing_dialogue() {
        let lines = vec![("A", "Hello there."), ("B", "Begone!")];
        assert_eq!(
            missing_dialogue("She said \"Hello there.\"", &lines),
            vec![("B", "Begone!")]
        );
    }
}
