//! Information routing.
//!
//! Decides what each character perceives of the player's action. Routing is
//! a pure function of the scene, the roster and the action text: the same
//! inputs always produce the same packets.

use crate::agent::{AgentState, SpecialPerception};
use crate::story::{CharacterId, Position, Scene};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Words too common to serve as the gist of overheard speech.
const FILLER: &[&str] = &[
    "that", "this", "with", "have", "will", "your", "what", "there", "they", "them", "then",
    "would", "could", "should", "about", "from", "into", "were", "been", "here",
];

/// Verbs that introduce speech, reported or quoted.
const SPEECH_VERBS: &[&str] = &[
    "say", "tell", "ask", "whisper", "shout", "mutter", "murmur", "yell", "reply", "explain",
    "confess", "reveal", "warn", "announce", "admit", "insist", "hiss", "plead", "promise",
    "answer", "declare", "exclaim", "suggest", "mention", "speak",
];

/// Irregular forms of [`SPEECH_VERBS`].
const SPEECH_FORMS: &[&str] = &["said", "told", "spoke", "admitted"];

/// Words skipped before the verb of an action.
const SUBJECTS: &[&str] = &["i", "you", "he", "she", "they", "we", "then", "and", "now", "also"];

/// How much of an event a character takes in.
///
/// Ordered from least to most so levels can be compared directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionLevel {
    None,
    Peripheral,
    Partial,
    Full,
}

/// What one character perceives of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformationPacket {
    pub attention: AttentionLevel,
    pub content: String,
    pub source_event: String,
}

impl InformationPacket {
    pub fn none(source_event: &str) -> Self {
        Self {
            attention: AttentionLevel::None,
            content: String::new(),
            source_event: source_event.to_string(),
        }
    }

    pub fn is_perceived(&self) -> bool {
        self.attention > AttentionLevel::None
    }
}

/// The player's action as routed in one turn.
#[derive(Debug, Clone, Copy)]
pub struct PlayerAction<'a> {
    pub player: &'a str,
    pub text: &'a str,
    pub source_event: &'a str,
}

/// Produce one packet per roster member.
pub fn route(
    scene: &Scene,
    agents: &[&AgentState],
    action: PlayerAction<'_>,
) -> BTreeMap<CharacterId, InformationPacket> {
    let mut packets = BTreeMap::new();

    for agent in agents {
        let dossier = &agent.dossier;
        let position = scene.position_of(&dossier.name);

        let packet = match position {
            Position::Present => InformationPacket {
                attention: AttentionLevel::Full,
                content: full_view(scene, action),
                source_event: action.source_event.to_string(),
            },
            Position::Nearby => InformationPacket {
                attention: AttentionLevel::Partial,
                content: format!(
                    "From just outside {}, you catch part of it. {}",
                    scene.location,
                    degraded_view(action)
                ),
                source_event: action.source_event.to_string(),
            },
            Position::Remote if dossier.has_perception(SpecialPerception::Scrying) => {
                InformationPacket {
                    attention: AttentionLevel::Partial,
                    content: format!(
                        "Through your scrying you glimpse {}. {}",
                        scene.location,
                        degraded_view(action)
                    ),
                    source_event: action.source_event.to_string(),
                }
            }
            Position::Remote if dossier.has_perception(SpecialPerception::Informants) => {
                InformationPacket {
                    attention: AttentionLevel::Peripheral,
                    content: format!(
                        "Your informants whisper that something is happening at {}.",
                        scene.location
                    ),
                    source_event: action.source_event.to_string(),
                }
            }
            Position::Remote => InformationPacket::none(action.source_event),
        };

        debug!(
            character = %dossier.id,
            ?position,
            attention = ?packet.attention,
            "Routed player action"
        );
        packets.insert(dossier.id.clone(), packet);
    }

    packets
}

fn full_view(scene: &Scene, action: PlayerAction<'_>) -> String {
    let mut text = format!("At {}", scene.location);
    if !scene.atmosphere.is_empty() {
        text.push_str(&format!(" ({})", scene.atmosphere));
    }
    text.push_str(&format!(", {} acts: {}", action.player, action.text.trim()));
    text
}

/// Describe an action without reproducing the player's words.
///
/// Quoted speech and anything reported after a speech verb collapse to one
/// topic word. The rest of the action collapses to its verb and topic.
fn degraded_view(action: PlayerAction<'_>) -> String {
    let (remainder, quoted) = split_speech(action.text);
    let unquoted: Vec<&str> = words(&remainder).collect();
    let (deed, reported) = match unquoted.iter().position(|w| is_speech_verb(w)) {
        Some(at) => (&unquoted[..at], Some(&unquoted[at + 1..])),
        None => (&unquoted[..], None),
    };

    let mut parts = Vec::new();
    let player_words: Vec<String> = words(action.player).map(str::to_lowercase).collect();
    let mut acts = deed.iter().copied().skip_while(|w| {
        let w = w.to_lowercase();
        SUBJECTS.contains(&w.as_str()) || player_words.contains(&w)
    });
    if let Some(verb) = acts.next() {
        let verb = verb.to_lowercase();
        parts.push(match gist(acts) {
            Some(topic) => format!(
                "You catch only fragments of what {} does: {verb}, {topic}.",
                action.player
            ),
            None => format!("You catch only fragments of what {} does: {verb}.", action.player),
        });
    }

    if reported.is_some() || !quoted.is_empty() {
        let said = quoted
            .iter()
            .flat_map(|s| words(s))
            .chain(reported.unwrap_or_default().iter().copied());
        match gist(said) {
            Some(topic) => parts.push(format!(
                "You overheard {} say something about {}.",
                action.player, topic
            )),
            None => parts.push(format!(
                "You hear {} speaking but cannot make out the words.",
                action.player
            )),
        }
    }
    if parts.is_empty() {
        parts.push(format!("{} is doing something you cannot make out.", action.player));
    }
    parts.join(" ")
}

fn words(text: &str) -> impl Iterator<Item = &str> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

fn is_speech_verb(word: &str) -> bool {
    let word = word.to_lowercase();
    if SPEECH_FORMS.contains(&word.as_str()) {
        return true;
    }
    SPEECH_VERBS.iter().any(|stem| {
        let inflected = |base: &str, suffixes: &[&str]| {
            suffixes
                .iter()
                .any(|suffix| word.strip_prefix(base) == Some(*suffix))
        };
        inflected(stem, &["", "s", "es", "ed", "ing"])
            || stem
                .strip_suffix('e')
                .is_some_and(|base| inflected(base, &["ed", "ing"]))
            || stem
                .strip_suffix('y')
                .is_some_and(|base| inflected(base, &["ies", "ied"]))
    })
}

/// Split text into the unquoted remainder and the quoted segments.
fn split_speech(text: &str) -> (String, Vec<String>) {
    let mut remainder = String::new();
    let mut speech = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in text.chars() {
        match c {
            '"' | '\u{201C}' | '\u{201D}' => {
                if quoted {
                    speech.push(std::mem::take(&mut current));
                } else {
                    remainder.push(' ');
                }
                quoted = !quoted;
            }
            _ if quoted => current.push(c),
            _ => remainder.push(c),
        }
    }
    // an unterminated quote is still speech
    if quoted && !current.is_empty() {
        speech.push(current);
    }

    (remainder, speech)
}

/// The single most telling word: the longest that is not filler, earliest
/// on ties.
fn gist<'a>(words: impl Iterator<Item = &'a str>) -> Option<String> {
    words
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 4 && !FILLER.contains(&w.as_str()))
        .fold(None, |best: Option<String>, w| match best {
            Some(b) if b.chars().count() >= w.chars().count() => Some(b),
            _ => Some(w),
        })
}
