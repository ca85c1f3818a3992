//! Persistent agent state.
//!
//! Each character keeps two memories: a bounded FIFO of recent turns and an
//! append-only long-term memory of key events. The record's `last_turn` says
//! which committed turn it reflects, which is what reconciliation checks.

use super::dossier::{Dossier, StyleCard};
use super::response::CharacterResponse;
use crate::story::{CharacterConcept, CharacterId};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Words ignored when matching memories against a query.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "your", "you", "are", "was",
    "were", "has", "have", "had", "not", "but", "his", "her", "their", "they", "she", "him",
];

/// One turn as a character experienced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMemory {
    pub turn: u64,
    /// What the character perceived.
    pub perceived: String,
    /// What the character did in response.
    pub response: String,
}

/// A key event kept indefinitely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermMemory {
    pub turn: u64,
    pub text: String,
}

/// Everything persisted for one character agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub dossier: Dossier,
    pub style: StyleCard,
    pub turn_memory: VecDeque<TurnMemory>,
    pub long_term: Vec<LongTermMemory>,
    /// Most recent committed turn reflected in this record.
    pub last_turn: u64,
    pub active: bool,
}

impl AgentState {
    /// A fresh agent for a character concept.
    pub fn spawn(concept: &CharacterConcept) -> Self {
        Self {
            dossier: Dossier::from_concept(concept),
            style: StyleCard::from_concept(concept),
            turn_memory: VecDeque::new(),
            long_term: Vec::new(),
            last_turn: 0,
            active: true,
        }
    }

    pub fn id(&self) -> &CharacterId {
        &self.dossier.id
    }

    pub fn name(&self) -> &str {
        &self.dossier.name
    }

    /// Push a turn into the rolling buffer, evicting the oldest past `capacity`.
    pub fn remember_turn(&mut self, memory: TurnMemory, capacity: usize) {
        self.turn_memory.push_back(memory);
        while self.turn_memory.len() > capacity.max(1) {
            self.turn_memory.pop_front();
        }
    }

    /// Append to long-term memory unless the same text is already there.
    pub fn add_long_term(&mut self, turn: u64, text: impl Into<String>) {
        let text = text.into();
        if !self.long_term.iter().any(|m| m.text == text) {
            self.long_term.push(LongTermMemory { turn, text });
        }
    }

    /// The `n` most recent turn memories, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &TurnMemory> {
        let skip = self.turn_memory.len().saturating_sub(n);
        self.turn_memory.iter().skip(skip)
    }

    /// Long-term memories sharing the most keywords with `query`.
    ///
    /// Ties keep the more recent memory first. Memories with no overlap are
    /// never returned.
    pub fn recall(&self, query: &str, limit: usize) -> Vec<&LongTermMemory> {
        let wanted = keywords(query);
        if wanted.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, usize, &LongTermMemory)> = self
            .long_term
            .iter()
            .enumerate()
            .filter_map(|(i, m)| {
                let score = keywords(&m.text).intersection(&wanted).count();
                (score > 0).then_some((score, i, m))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        scored.into_iter().take(limit).map(|(_, _, m)| m).collect()
    }

    /// Fold one committed turn into this record.
    pub fn record_turn(
        &mut self,
        turn: u64,
        perceived: &str,
        response: &CharacterResponse,
        capacity: usize,
    ) {
        self.remember_turn(
            TurnMemory {
                turn,
                perceived: perceived.to_string(),
                response: response.mv.summary(),
            },
            capacity,
        );

        if let Some(memory) = response.key_memory() {
            self.add_long_term(turn, memory);
        }
        if let Some(state) = &response.emotional_state {
            self.dossier.emotional_state = state.clone();
        }
        for (topic, belief) in &response.beliefs {
            self.dossier.beliefs.insert(topic.clone(), belief.clone());
        }

        self.last_turn = self.last_turn.max(turn);
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}
