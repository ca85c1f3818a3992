//! Snapshot and event log reconciliation.
//!
//! The snapshot is written last in a commit, so after a crash it can lag the
//! event log. Events newer than the snapshot are replayed onto it, then each
//! agent record is brought to exactly the reconciled turn:
//!
//! * missing or unreadable records are respawned from the character concept
//!   and rebuilt from the perceptions stored in the event log,
//! * records ahead of the story are rebuilt the same way, keeping only their
//!   style card,
//! * records behind it replay the perceptions they missed.

use super::{PersistError, StoryStore};
use crate::agent::{AgentManager, AgentState, TurnMemory};
use crate::config::EngineConfig;
use crate::storyteller::OPENING_MARKER;
use crate::story::{CharacterId, Event, EventKind, NarrativeExchange, Story, StoryId, StoryStatus};
use tracing::{info, warn};

/// What reconciliation had to repair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Turns replayed from the event log onto the snapshot.
    pub replayed_turns: Vec<u64>,
    pub respawned: Vec<CharacterId>,
    /// Records found ahead of the story and rebuilt from the event log.
    pub rebuilt: Vec<CharacterId>,
    pub caught_up: Vec<CharacterId>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// A story restored from a store.
#[derive(Debug, Clone)]
pub struct LoadedStory {
    pub story: Story,
    pub agents: AgentManager,
    pub report: ReconcileReport,
}

/// Load a story and merge its snapshot, event log and agent records.
pub async fn load_story(
    store: &dyn StoryStore,
    id: &StoryId,
    config: &EngineConfig,
) -> Result<LoadedStory, PersistError> {
    let mut story = store.load_snapshot(id).await?;
    let events = store.load_events(id).await?;
    let mut report = ReconcileReport::default();

    for event in &events {
        let pending = match event.kind {
            EventKind::Opening => story.scene.is_none(),
            EventKind::Turn => event.turn > story.turn,
        };
        if pending {
            replay_event(&mut story, event, config.storyteller_history_turns);
            report.replayed_turns.push(event.turn);
        }
    }

    let mut agents = AgentManager::new();
    for character in story.roster.clone() {
        let record = match store.load_agent(id, &character).await {
            Ok(record) => record,
            Err(PersistError::Json(e)) => {
                warn!(story = %id, %character, error = %e, "Agent record unreadable");
                None
            }
            Err(e) => return Err(e),
        };

        let concept = story.outline.as_ref().and_then(|o| o.concept(&character));
        let state = match record {
            Some(ahead) if ahead.last_turn > story.turn => {
                // emotional state and beliefs may come from an uncommitted turn
                let Some(concept) = concept else {
                    warn!(story = %id, %character, "No concept to rebuild record from, dropping");
                    continue;
                };
                let mut state = AgentState::spawn(concept);
                state.style = ahead.style;
                replay_perceptions(&mut state, &events, story.turn, config.turn_memory_size);
                report.rebuilt.push(character.clone());
                state
            }
            Some(mut state) if state.last_turn < story.turn => {
                replay_perceptions(&mut state, &events, story.turn, config.turn_memory_size);
                report.caught_up.push(character.clone());
                state
            }
            Some(state) => state,
            None => {
                let Some(concept) = concept else {
                    warn!(story = %id, %character, "No concept for roster character, dropping");
                    continue;
                };
                let mut state = AgentState::spawn(concept);
                replay_perceptions(&mut state, &events, story.turn, config.turn_memory_size);
                report.respawned.push(character.clone());
                state
            }
        };
        agents.insert(state);
    }

    if report.is_clean() {
        info!(story = %id, turn = story.turn, "Story loaded");
    } else {
        warn!(story = %id, turn = story.turn, ?report, "Story loaded with repairs");
    }

    Ok(LoadedStory {
        story,
        agents,
        report,
    })
}

/// Persist every agent record of a story.
pub async fn save_agents(
    store: &dyn StoryStore,
    id: &StoryId,
    agents: &AgentManager,
) -> Result<(), PersistError> {
    for state in agents.iter() {
        store.save_agent(id, state).await?;
    }
    Ok(())
}

fn replay_event(story: &mut Story, event: &Event, history_turns: usize) {
    story.scene = Some(event.scene.clone());
    story.turn = event.turn;
    story.updated_at = event.timestamp;

    let player_action = match event.kind {
        EventKind::Opening => OPENING_MARKER.to_string(),
        EventKind::Turn => event.player_input.clone().unwrap_or_default(),
    };
    story.push_narrative(
        NarrativeExchange {
            player_action,
            narrative: event.narrative.clone(),
        },
        history_turns,
    );

    if event.kind == EventKind::Opening {
        if story.roster.is_empty() {
            if let Some(outline) = &story.outline {
                for concept in &outline.major_characters {
                    let id = concept.id();
                    if !story.roster.contains(&id) {
                        story.roster.push(id);
                    }
                }
            }
        }
        if matches!(story.status, StoryStatus::Created | StoryStatus::Initializing) {
            story.status = StoryStatus::Active;
        }
    }
}

fn replay_perceptions(state: &mut AgentState, events: &[Event], up_to: u64, capacity: usize) {
    let from = state.last_turn;
    for event in events {
        if event.turn <= from || event.turn > up_to {
            continue;
        }
        if let Some(perception) = event.perceptions.get(state.id()) {
            state.remember_turn(
                TurnMemory {
                    turn: event.turn,
                    perceived: perception.packet.content.clone(),
                    response: perception.response.clone(),
                },
                capacity,
            );
            if let Some(memory) = &perception.key_memory {
                state.add_long_term(event.turn, memory.clone());
            }
            if let Some(emotion) = &perception.emotional_state {
                state.dossier.emotional_state = emotion.clone();
            }
            for (topic, belief) in &perception.beliefs {
                state.dossier.beliefs.insert(topic.clone(), belief.clone());
            }
        }
        if event.departed.contains(state.id()) {
            state.active = false;
        }
    }
    state.last_turn = up_to;
}
