//! Director validation.
//!
//! Reconciles proposed character moves against the scene with fixed rules:
//!
//! 1. Remote characters cannot act or speak, and nobody can act on a roster
//!    character who is remote.
//! 2. Act moves sharing a target conflict. Present claimants beat nearby
//!    ones; any remaining tie is settled by one draw from the turn RNG.
//!    Conflict groups are settled in roster order of their first claimant.
//! 3. Every accepted target that is neither the player nor a roster
//!    character needs an NPC reaction.
//! 4. A nearby character whose act is accepted steps into the scene.

use crate::agent::{CharacterMove, CharacterResponse, Intent};
use crate::rng::GameRng;
use crate::story::{CharacterId, Position, Scene};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// A move the director refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedMove {
    #[serde(rename = "move")]
    pub mv: CharacterMove,
    pub reason: String,
}

/// The director's verdict on one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorValidation {
    /// Accepted act/speak moves in roster order; dialogue untouched.
    pub accepted: Vec<CharacterMove>,
    pub rejected: Vec<RejectedMove>,
    /// Characters who chose to observe.
    pub observers: Vec<CharacterMove>,
    pub npc_reactions: Vec<String>,
    /// Names of nearby characters who moved into the scene.
    pub moved_in: Vec<String>,
}

impl DirectorValidation {
    /// Apply scene membership changes.
    pub fn apply_to(&self, scene: &mut Scene) {
        for name in &self.moved_in {
            scene.bring_into_scene(name);
        }
    }

    /// Accepted lines of dialogue with their speakers.
    pub fn dialogue(&self) -> Vec<(&str, &str)> {
        self.accepted
            .iter()
            .filter_map(|mv| mv.intent.dialogue().map(|d| (mv.name.as_str(), d)))
            .collect()
    }
}

/// Validate responses given in roster order.
pub fn validate(
    scene: &Scene,
    roster: &[CharacterId],
    player: &str,
    responses: &[CharacterResponse],
    rng: &mut GameRng,
) -> DirectorValidation {
    let mut validation = DirectorValidation::default();
    let is_roster = |name: &str| roster.contains(&CharacterId::from_name(name));

    // rule 1
    let mut candidates: Vec<(CharacterMove, Position)> = Vec::new();
    for response in responses {
        let mv = &response.mv;
        let position = scene.position_of(&mv.name);

        if mv.intent.is_observe() {
            validation.observers.push(mv.clone());
            continue;
        }

        if position == Position::Remote {
            reject(&mut validation, mv.clone(), format!("{} is not in the scene", mv.name));
            continue;
        }

        if let Intent::Act { .. } = mv.intent {
            let unreachable = mv
                .targets
                .iter()
                .find(|t| is_roster(t) && scene.position_of(t) == Position::Remote);
            if let Some(target) = unreachable {
                let reason = format!("{target} is not in the scene");
                reject(&mut validation, mv.clone(), reason);
                continue;
            }
        }

        candidates.push((mv.clone(), position));
    }

    // rule 2
    let mut lost: HashSet<usize> = HashSet::new();
    for (target, claimants) in conflict_groups(&candidates) {
        let claimants: Vec<usize> = claimants.into_iter().filter(|i| !lost.contains(i)).collect();
        if claimants.len() < 2 {
            continue;
        }

        let best = claimants
            .iter()
            .map(|&i| candidates[i].1)
            .min()
            .unwrap_or(Position::Present);
        let contenders: Vec<usize> = claimants
            .iter()
            .copied()
            .filter(|&i| candidates[i].1 == best)
            .collect();

        let winner = if contenders.len() == 1 {
            contenders[0]
        } else {
            let pick = rng.pick_index(contenders.len()).unwrap_or(0);
            debug!(%target, contenders = contenders.len(), pick, "Tie broken by RNG");
            contenders[pick]
        };

        for &i in &claimants {
            if i != winner {
                lost.insert(i);
            }
        }
        let winner_name = candidates[winner].0.name.clone();
        for &i in &claimants {
            if i != winner {
                let reason = format!("{winner_name} acted on {target} first");
                validation.rejected.push(RejectedMove {
                    mv: candidates[i].0.clone(),
                    reason,
                });
            }
        }
    }

    for (i, (mv, position)) in candidates.into_iter().enumerate() {
        if lost.contains(&i) {
            continue;
        }
        if position == Position::Nearby && matches!(mv.intent, Intent::Act { .. }) {
            validation.moved_in.push(mv.name.clone());
        }
        validation.accepted.push(mv);
    }

    // rule 3
    let mut seen = HashSet::new();
    for mv in &validation.accepted {
        for target in &mv.targets {
            if target.eq_ignore_ascii_case(player) || is_roster(target) {
                continue;
            }
            if seen.insert(target.to_lowercase()) {
                validation
                    .npc_reactions
                    .push(format!("{target} reacts to {}", mv.name));
            }
        }
    }

    debug!(
        accepted = validation.accepted.len(),
        rejected = validation.rejected.len(),
        observers = validation.observers.len(),
        "Director validation complete"
    );
    validation
}

fn reject(validation: &mut DirectorValidation, mv: CharacterMove, reason: String) {
    debug!(character = %mv.character, %reason, "Rejected move");
    validation.rejected.push(RejectedMove { mv, reason });
}

/// Act moves grouped by shared target, ordered by first claimant.
fn conflict_groups(candidates: &[(CharacterMove, Position)]) -> Vec<(String, Vec<usize>)> {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (i, (mv, _)) in candidates.iter().enumerate() {
        if !matches!(mv.intent, Intent::Act { .. }) {
            continue;
        }
        for target in &mv.targets {
            let key = target.to_lowercase();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => {
                    if !members.contains(&i) {
                        members.push(i);
                    }
                }
                None => groups.push((key, vec![i])),
            }
        }
    }
    groups.retain(|(_, members)| members.len() > 1);
    groups
}
