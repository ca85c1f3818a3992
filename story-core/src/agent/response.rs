//! Character responses.
//!
//! Agents reply with loosely structured JSON ([`ResponseWire`]); it is
//! validated into the closed [`Intent`] enum before anything downstream sees
//! it, so the director never handles a half-formed move.

use crate::parse::ParseError;
use crate::story::CharacterId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a character decided to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// A physical action, optionally with words spoken while doing it.
    Act {
        action: String,
        #[serde(default)]
        dialogue: Option<String>,
    },
    /// Words only.
    Speak { dialogue: String },
    /// Watch without acting.
    Observe {
        #[serde(default)]
        notes: Option<String>,
    },
}

impl Intent {
    pub fn dialogue(&self) -> Option<&str> {
        match self {
            Intent::Act { dialogue, .. } => dialogue.as_deref(),
            Intent::Speak { dialogue } => Some(dialogue),
            Intent::Observe { .. } => None,
        }
    }

    pub fn is_observe(&self) -> bool {
        matches!(self, Intent::Observe { .. })
    }
}

/// A character's proposed move for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterMove {
    pub character: CharacterId,
    pub name: String,
    #[serde(flatten)]
    pub intent: Intent,
    #[serde(default)]
    pub targets: Vec<String>,
    /// Private reasoning; never shown to the player.
    #[serde(default)]
    pub rationale: Option<String>,
}

impl CharacterMove {
    pub fn observe(character: CharacterId, name: impl Into<String>) -> Self {
        Self {
            character,
            name: name.into(),
            intent: Intent::Observe { notes: None },
            targets: Vec::new(),
            rationale: None,
        }
    }

    /// One-line description used in memories and prompts.
    pub fn summary(&self) -> String {
        match &self.intent {
            Intent::Act { action, dialogue } => match dialogue {
                Some(d) => format!("{} {} and says \"{}\"", self.name, action, d),
                None => format!("{} {}", self.name, action),
            },
            Intent::Speak { dialogue } => format!("{} says \"{}\"", self.name, dialogue),
            Intent::Observe { notes: Some(n) } => format!("{} watches: {}", self.name, n),
            Intent::Observe { notes: None } => format!("{} watches silently", self.name),
        }
    }
}

/// A validated agent reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterResponse {
    #[serde(rename = "move")]
    pub mv: CharacterMove,
    /// Whether this turn should be kept in long-term memory.
    #[serde(default)]
    pub key_event: bool,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub emotional_state: Option<String>,
    /// Topic -> new belief.
    #[serde(default)]
    pub beliefs: BTreeMap<String, String>,
}

impl CharacterResponse {
    /// The fallback when an agent cannot produce a usable reply.
    pub fn default_observe(character: CharacterId, name: impl Into<String>) -> Self {
        Self {
            mv: CharacterMove::observe(character, name),
            key_event: false,
            memory: None,
            emotional_state: None,
            beliefs: BTreeMap::new(),
        }
    }

    /// Memory text to keep long-term, if this response flagged a key event.
    pub fn key_memory(&self) -> Option<String> {
        if !self.key_event {
            return None;
        }
        Some(
            self.memory
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.mv.summary()),
        )
    }
}

/// The JSON an agent is asked to produce.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseWire {
    pub intent: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub dialogue: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub key_event: bool,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub emotional_state: Option<String>,
    #[serde(default)]
    pub beliefs: BTreeMap<String, String>,
}

impl ResponseWire {
    /// Validate into a typed response for the given character.
    pub fn into_response(
        self,
        character: CharacterId,
        name: &str,
    ) -> Result<CharacterResponse, ParseError> {
        let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let action = non_empty(self.action);
        let dialogue = non_empty(self.dialogue);
        let notes = non_empty(self.notes);

        let intent = match self.intent.trim().to_ascii_lowercase().as_str() {
            "act" | "action" => Intent::Act {
                action: action.ok_or_else(|| ParseError {
                    reason: "act intent without an action".into(),
                })?,
                dialogue,
            },
            "speak" | "say" => Intent::Speak {
                dialogue: dialogue.ok_or_else(|| ParseError {
                    reason: "speak intent without dialogue".into(),
                })?,
            },
            "observe" | "none" | "wait" => Intent::Observe { notes },
            other => {
                return Err(ParseError {
                    reason: format!("unknown intent '{other}'"),
                })
            }
        };

        let mut targets: Vec<String> = self
            .target
            .into_iter()
            .chain(self.targets)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        targets.dedup_by(|a, b| a.eq_ignore_ascii_case(b));

        Ok(CharacterResponse {
            mv: CharacterMove {
                character,
                name: name.to_string(),
                intent,
                targets,
                rationale: non_empty(self.rationale),
            },
            key_event: self.key_event,
            memory: non_empty(self.memory),
            emotional_state: non_empty(self.emotional_state),
            beliefs: self.beliefs,
        })
    }
}
