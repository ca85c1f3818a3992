//! Character identity: dossier and style card.

use crate::story::{CharacterConcept, CharacterId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reveal condition recorded for secrets that arrive without one.
const DEFAULT_REVEAL_CONDITION: &str = "only when it serves their goals";

/// Ways a character can learn of events away from the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialPerception {
    /// Watches distant places; remote events arrive as partial glimpses.
    Scrying,
    /// A network of spies; remote events arrive as peripheral rumors.
    Informants,
}

/// How a character sounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleCard {
    pub voice: Vec<String>,
    pub speech_patterns: Vec<String>,
    #[serde(default)]
    pub catchphrases: Vec<String>,
    #[serde(default)]
    pub taboo_topics: Vec<String>,
    /// Replaces the default character temperature when set.
    #[serde(default)]
    pub temperature_override: Option<f32>,
}

impl StyleCard {
    /// Derive a starting style from the concept's personality.
    pub fn from_concept(concept: &CharacterConcept) -> Self {
        let voice: Vec<String> = concept.personality.iter().take(2).cloned().collect();
        let speech_patterns = match concept.personality.first() {
            Some(trait_) => vec![format!("Tends to be {trait_}")],
            None => vec!["Neutral".to_string()],
        };
        Self {
            voice,
            speech_patterns,
            catchphrases: Vec::new(),
            taboo_topics: Vec::new(),
            temperature_override: None,
        }
    }
}

/// Explicit changes to a style card, applied by `customize_style`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleUpdate {
    pub voice: Option<Vec<String>>,
    pub speech_patterns: Option<Vec<String>>,
    pub catchphrases: Option<Vec<String>>,
    pub taboo_topics: Option<Vec<String>>,
    /// `Some(None)` clears the override.
    pub temperature_override: Option<Option<f32>>,
}

impl StyleUpdate {
    pub fn apply(self, card: &mut StyleCard) {
        if let Some(voice) = self.voice {
            card.voice = voice;
        }
        if let Some(patterns) = self.speech_patterns {
            card.speech_patterns = patterns;
        }
        if let Some(catchphrases) = self.catchphrases {
            card.catchphrases = catchphrases;
        }
        if let Some(taboos) = self.taboo_topics {
            card.taboo_topics = taboos;
        }
        if let Some(temperature) = self.temperature_override {
            card.temperature_override = temperature;
        }
    }
}

/// A character's identity and mutable inner state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dossier {
    pub id: CharacterId,
    pub name: String,
    pub role: String,
    pub description: String,
    #[serde(default)]
    pub personality: Vec<String>,
    /// Goals in priority order.
    pub goals: Vec<String>,
    /// Secret -> condition under which it may be revealed.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    /// Topic -> what the character believes about it.
    #[serde(default)]
    pub beliefs: BTreeMap<String, String>,
    /// Other character -> disposition toward them.
    #[serde(default)]
    pub relationships: BTreeMap<String, String>,
    pub emotional_state: String,
    #[serde(default)]
    pub perception: Vec<SpecialPerception>,
}

impl Dossier {
    pub fn from_concept(concept: &CharacterConcept) -> Self {
        let secrets = concept
            .secrets
            .iter()
            .map(|s| (s.clone(), DEFAULT_REVEAL_CONDITION.to_string()))
            .collect();

        let mut relationships = BTreeMap::new();
        if !concept.relationship_to_player.is_empty() {
            relationships.insert("player".to_string(), concept.relationship_to_player.clone());
        }

        Self {
            id: concept.id(),
            name: concept.name.clone(),
            role: concept.role.clone(),
            description: concept.description.clone(),
            personality: concept.personality.clone(),
            goals: concept.goals.clone(),
            secrets,
            beliefs: BTreeMap::new(),
            relationships,
            emotional_state: "neutral".to_string(),
            perception: concept.perception.clone(),
        }
    }

    pub fn has_perception(&self, ability: SpecialPerception) -> bool {
        self.perception.contains(&ability)
    }

    /// Prompt block describing who this character is.
    pub fn render(&self) -> String {
        let list = |items: &[String]| {
            if items.is_empty() {
                "None specified".to_string()
            } else {
                items.join(", ")
            }
        };
        let map = |entries: &BTreeMap<String, String>, empty: &str| {
            if entries.is_empty() {
                empty.to_string()
            } else {
                entries
                    .iter()
                    .map(|(k, v)| format!("- {k}: {v}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        format!(
            "CHARACTER: {}\nRole: {}\nDescription: {}\nPersonality: {}\nCurrent Goals: {}\nEmotional State: {}\n\nBELIEFS:\n{}\n\nSECRETS (reveal condition):\n{}\n\nRELATIONSHIPS:\n{}",
            self.name,
            self.role,
            self.description,
            list(&self.personality),
            list(&self.goals),
            self.emotional_state,
            map(&self.beliefs, "None established yet"),
            map(&self.secrets, "None"),
            map(&self.relationships, "None established yet"),
        )
    }
}
