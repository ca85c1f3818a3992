//! The set of live agents for one story.

use super::character::{respond, InvokeOptions};
use super::dossier::StyleUpdate;
use super::response::CharacterResponse;
use super::state::AgentState;
use crate::backend::{Backend, BackendError};
use crate::router::InformationPacket;
use crate::story::{CharacterConcept, CharacterId, Perception};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Agents keyed by character id, in spawn order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentManager {
    agents: BTreeMap<CharacterId, AgentState>,
    order: Vec<CharacterId>,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn an agent for a concept. Returns `None` if it already exists.
    pub fn spawn(&mut self, concept: &CharacterConcept) -> Option<CharacterId> {
        let id = concept.id();
        if self.agents.contains_key(&id) {
            debug!(character = %id, "Agent already spawned");
            return None;
        }
        info!(character = %id, role = %concept.role, "Spawned agent");
        self.insert(AgentState::spawn(concept));
        Some(id)
    }

    /// Insert a restored record, replacing any agent with the same id.
    pub fn insert(&mut self, state: AgentState) {
        let id = state.id().clone();
        if !self.order.contains(&id) {
            self.order.push(id.clone());
        }
        self.agents.insert(id, state);
    }

    pub fn get(&self, id: &CharacterId) -> Option<&AgentState> {
        self.agents.get(id)
    }

    /// Retire a character that has left the story. Retired agents keep
    /// their record but are never invoked again.
    pub fn deactivate(&mut self, id: &CharacterId) -> bool {
        match self.agents.get_mut(id) {
            Some(state) => {
                info!(character = %id, "Agent retired");
                state.active = false;
                true
            }
            None => false,
        }
    }

    /// Active agents following an explicit roster order.
    pub fn active_in_order<'a>(&'a self, roster: &'a [CharacterId]) -> Vec<&'a AgentState> {
        roster
            .iter()
            .filter_map(|id| self.agents.get(id))
            .filter(|s| s.active)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents in spawn order.
    pub fn iter(&self) -> impl Iterator<Item = &AgentState> {
        self.order.iter().filter_map(|id| self.agents.get(id))
    }

    /// Agents following an explicit roster order.
    pub fn in_order<'a>(&'a self, roster: &'a [CharacterId]) -> Vec<&'a AgentState> {
        roster.iter().filter_map(|id| self.agents.get(id)).collect()
    }

    /// Apply an explicit style change. Returns `false` for an unknown id.
    pub fn customize_style(&mut self, id: &CharacterId, update: StyleUpdate) -> bool {
        match self.agents.get_mut(id) {
            Some(state) => {
                update.apply(&mut state.style);
                true
            }
            None => false,
        }
    }

    /// Query every active agent that perceived something, at most `cap` at once.
    ///
    /// Responses come back in roster order. The first backend error aborts
    /// the whole batch.
    pub async fn invoke_all(
        &self,
        backend: &dyn Backend,
        roster: &[CharacterId],
        packets: &BTreeMap<CharacterId, InformationPacket>,
        options: InvokeOptions,
        cap: usize,
    ) -> Result<Vec<CharacterResponse>, BackendError> {
        let jobs: Vec<(usize, &AgentState, &InformationPacket)> = roster
            .iter()
            .enumerate()
            .filter_map(|(position, id)| {
                let state = self.agents.get(id).filter(|s| s.active)?;
                let packet = packets.get(id).filter(|p| p.is_perceived())?;
                Some((position, state, packet))
            })
            .collect();

        debug!(agents = jobs.len(), cap, "Invoking agents");

        let mut results: Vec<(usize, CharacterResponse)> = stream::iter(jobs)
            .map(|(position, state, packet)| async move {
                respond(backend, state, packet, options)
                    .await
                    .map(|response| (position, response))
            })
            .buffer_unordered(cap.max(1))
            .try_collect()
            .await?;

        results.sort_by_key(|(position, _)| *position);
        Ok(results.into_iter().map(|(_, response)| response).collect())
    }

    /// Fold a committed turn into every informed agent.
    ///
    /// Every record is marked as reflecting `turn`, informed or not.
    pub fn record_turn(
        &mut self,
        turn: u64,
        perceptions: &BTreeMap<CharacterId, Perception>,
        responses: &[CharacterResponse],
        capacity: usize,
    ) {
        for response in responses {
            let id = &response.mv.character;
            let (Some(state), Some(perception)) = (self.agents.get_mut(id), perceptions.get(id))
            else {
                continue;
            };
            state.record_turn(turn, &perception.packet.content, response, capacity);
        }
        for state in self.agents.values_mut() {
            state.last_turn = state.last_turn.max(turn);
        }
    }
}
