//! The turn orchestrator.
//!
//! Owns every live story and drives it through
//! `Created -> Initializing -> Active -> Ended`. A player turn runs
//! route, invoke, validate, compose, remember and persist, in that order.
//!
//! Turns are atomic. All work happens on a copy of the story and its agents;
//! the copy replaces the live state only after the commit (event, then agent
//! records, then snapshot) has succeeded. A failure after the event append
//! truncates the event again, so the log never runs ahead of a failed turn.

use crate::agent::{
    AgentManager, AgentState, CharacterResponse, Dossier, InvokeOptions, StyleCard, StyleUpdate,
};
use crate::backend::BackendError;
use crate::config::RoleParams;
use crate::context::EngineContext;
use crate::director::{self, DirectorValidation};
use crate::persist::{self, PersistError, ReconcileReport, StoryStore};
use crate::rng::GameRng;
use crate::router::{self, InformationPacket, PlayerAction};
use crate::story::{
    CharacterId, Event, EventKind, NarrativeExchange, Perception, Position, Scene, Story,
    StoryConfig, StoryId, StoryOutline, StoryStatus, StorySummary,
};
use crate::storyteller::{GenerationError, Storyteller, OPENING_MARKER};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Errors surfaced by orchestrator commands.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    #[error("persistence failure: {0}")]
    Persist(PersistError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("story {id} is {status:?}; cannot {operation}")]
    InvalidState {
        id: StoryId,
        status: StoryStatus,
        operation: &'static str,
    },

    #[error("a turn is already in progress for story {0}")]
    TurnInProgress(StoryId),

    #[error("turn cancelled")]
    Cancelled,

    #[error("generation failed: {0}")]
    Generation(String),
}

impl From<PersistError> for StoryError {
    fn from(e: PersistError) -> Self {
        match e {
            PersistError::NotFound(id) => StoryError::NotFound(format!("story {id}")),
            other => StoryError::Persist(other),
        }
    }
}

impl From<GenerationError> for StoryError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::Backend(e) => StoryError::Backend(e),
            malformed @ GenerationError::Malformed { .. } => {
                StoryError::Generation(malformed.to_string())
            }
        }
    }
}

/// What a submitted line of input produced.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// A committed player turn.
    Turn(TurnReport),
    /// The reply to a meta command; nothing was committed.
    Meta(String),
}

/// Summary of one committed turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn: u64,
    pub narrative: String,
    pub validation: DirectorValidation,
    pub scene: Scene,
}

/// What `inspect` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspect {
    Scene,
    Cast,
    Outline,
    Dossiers,
    EventLog,
}

/// One character as listed by `/cast`.
#[derive(Debug, Clone, PartialEq)]
pub struct CastEntry {
    pub id: CharacterId,
    pub name: String,
    pub role: String,
    pub position: Position,
    pub emotional_state: String,
}

/// Result of `inspect`.
#[derive(Debug, Clone)]
pub enum Inspection {
    Scene(Option<Scene>),
    Cast(Vec<CastEntry>),
    Outline(Option<StoryOutline>),
    Dossiers(Vec<Dossier>),
    EventLog(Vec<Event>),
}

/// A live story and its agents.
#[derive(Debug, Clone)]
struct StoryRuntime {
    story: Story,
    agents: AgentManager,
}

type SharedRuntime = Arc<Mutex<StoryRuntime>>;

/// Drives stories from creation to their end.
pub struct Orchestrator {
    ctx: EngineContext,
    store: Arc<dyn StoryStore>,
    live: RwLock<HashMap<StoryId, SharedRuntime>>,
}

impl Orchestrator {
    pub fn new(ctx: EngineContext, store: Arc<dyn StoryStore>) -> Self {
        Self {
            ctx,
            store,
            live: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    // ========================================================================
    // Lifecycle commands
    // ========================================================================

    /// Create a story and generate its outline.
    ///
    /// The story is persisted before generation. A failed outline leaves a
    /// `Created` story in the store, listed by `list_stories`; `start`
    /// generates the outline if it is still missing.
    pub async fn create(&self, config: StoryConfig) -> Result<StoryId, StoryError> {
        let mut story = Story::new(config);
        let id = story.id.clone();
        self.store.save_snapshot(&story).await?;

        let runtime = Arc::new(Mutex::new(StoryRuntime {
            story: story.clone(),
            agents: AgentManager::new(),
        }));
        let mut live = runtime.lock().await;
        self.live.write().await.insert(id.clone(), runtime.clone());
        info!(story = %id, "Story created");

        let outline = self.storyteller(&story).outline(&story.config).await?;
        story.outline = Some(outline);
        story.updated_at = Utc::now();
        self.store.save_snapshot(&story).await?;
        live.story = story;
        info!(story = %id, "Outline generated");
        Ok(id)
    }

    /// Initialize a created story and return its opening narrative.
    pub async fn start(&self, id: &StoryId) -> Result<String, StoryError> {
        let runtime = self.runtime(id).await?;
        let mut live = runtime
            .try_lock()
            .map_err(|_| StoryError::TurnInProgress(id.clone()))?;
        require_status(&live.story, StoryStatus::Created, "start")?;

        let mut working = live.clone();
        working.story.status = StoryStatus::Initializing;
        self.store.save_snapshot(&working.story).await?;
        info!(story = %id, "Initializing story");

        match self.initialize(&mut working).await {
            Ok(narrative) => {
                *live = working;
                info!(story = %id, "Story active");
                Ok(narrative)
            }
            Err(e) => {
                warn!(story = %id, error = %e, "Initialization failed, reverting to created");
                if let Err(revert) = self.store.save_snapshot(&live.story).await {
                    warn!(story = %id, error = %revert, "Could not persist reverted status");
                }
                Err(e)
            }
        }
    }

    /// Submit one line of player input.
    pub async fn continue_story(
        &self,
        id: &StoryId,
        input: &str,
    ) -> Result<TurnOutcome, StoryError> {
        self.continue_with_cancel(id, input, std::future::pending())
            .await
    }

    /// Submit player input, abandoning the turn if `cancel` resolves before
    /// the commit begins. A cancelled turn commits nothing.
    pub async fn continue_with_cancel<C>(
        &self,
        id: &StoryId,
        input: &str,
        cancel: C,
    ) -> Result<TurnOutcome, StoryError>
    where
        C: Future<Output = ()>,
    {
        let runtime = self.runtime(id).await?;
        let mut live = runtime
            .try_lock()
            .map_err(|_| StoryError::TurnInProgress(id.clone()))?;

        let input = input.trim();
        if input.starts_with('/') {
            return self.meta_command(&live, input).await.map(TurnOutcome::Meta);
        }
        require_status(&live.story, StoryStatus::Active, "continue")?;

        let mut working = live.clone();
        let previous_turn = working.story.turn;

        let prepared = {
            tokio::pin!(cancel);
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    info!(story = %id, turn = previous_turn + 1, "Turn cancelled");
                    return Err(StoryError::Cancelled);
                }
                prepared = self.run_turn(&mut working, input) => prepared?,
            }
        };
        let (event, validation) = prepared;

        self.commit(&working, &event, previous_turn, &live.agents)
            .await?;

        let report = TurnReport {
            turn: event.turn,
            narrative: event.narrative.clone(),
            validation,
            scene: event.scene.clone(),
        };
        *live = working;
        info!(story = %id, turn = report.turn, revision = report.scene.revision, "Turn committed");
        Ok(TurnOutcome::Turn(report))
    }

    /// Mark a story as ended. It stays stored and inspectable.
    pub async fn end(&self, id: &StoryId) -> Result<(), StoryError> {
        let runtime = self.runtime(id).await?;
        let mut live = runtime
            .try_lock()
            .map_err(|_| StoryError::TurnInProgress(id.clone()))?;
        if live.story.status == StoryStatus::Ended {
            return Err(invalid(&live.story, "end"));
        }

        let mut story = live.story.clone();
        story.status = StoryStatus::Ended;
        story.updated_at = Utc::now();
        self.store.save_snapshot(&story).await?;
        live.story = story;
        info!(story = %id, "Story ended");
        Ok(())
    }

    /// Persist the live state of a story.
    pub async fn save(&self, id: &StoryId) -> Result<(), StoryError> {
        let runtime = self.runtime(id).await?;
        let live = runtime
            .try_lock()
            .map_err(|_| StoryError::TurnInProgress(id.clone()))?;
        self.persist_all(&live).await
    }

    /// Load a story from the store, replacing any live copy.
    pub async fn load(&self, id: &StoryId) -> Result<ReconcileReport, StoryError> {
        require_well_formed(id)?;
        if let Some(existing) = self.live.read().await.get(id).cloned() {
            if existing.try_lock().is_err() {
                return Err(StoryError::TurnInProgress(id.clone()));
            }
        }

        let loaded = persist::load_story(self.store.as_ref(), id, self.ctx.config()).await?;
        let report = loaded.report.clone();
        self.live.write().await.insert(
            id.clone(),
            Arc::new(Mutex::new(StoryRuntime {
                story: loaded.story,
                agents: loaded.agents,
            })),
        );
        Ok(report)
    }

    /// Summaries of every stored story.
    pub async fn list_stories(&self) -> Result<Vec<StorySummary>, StoryError> {
        Ok(self.store.list().await?)
    }

    // ========================================================================
    // Read-only views
    // ========================================================================

    /// A copy of the live story.
    pub async fn story(&self, id: &StoryId) -> Result<Story, StoryError> {
        let runtime = self.runtime(id).await?;
        let live = runtime.lock().await;
        Ok(live.story.clone())
    }

    pub async fn inspect(&self, id: &StoryId, what: Inspect) -> Result<Inspection, StoryError> {
        let runtime = self.runtime(id).await?;
        let live = runtime.lock().await;
        Ok(match what {
            Inspect::Scene => Inspection::Scene(live.story.scene.clone()),
            Inspect::Cast => Inspection::Cast(cast(&live)),
            Inspect::Outline => Inspection::Outline(live.story.outline.clone()),
            Inspect::Dossiers => Inspection::Dossiers(
                live.agents.iter().map(|a| a.dossier.clone()).collect(),
            ),
            Inspect::EventLog => Inspection::EventLog(self.store.load_events(id).await?),
        })
    }

    /// A copy of one agent's full state.
    pub async fn agent_state(
        &self,
        id: &StoryId,
        character: &CharacterId,
    ) -> Result<AgentState, StoryError> {
        let runtime = self.runtime(id).await?;
        let live = runtime.lock().await;
        live.agents
            .get(character)
            .cloned()
            .ok_or_else(|| StoryError::NotFound(format!("character {character}")))
    }

    /// Change a character's style card.
    pub async fn customize_style(
        &self,
        id: &StoryId,
        character: &CharacterId,
        update: StyleUpdate,
    ) -> Result<StyleCard, StoryError> {
        let runtime = self.runtime(id).await?;
        let mut live = runtime
            .try_lock()
            .map_err(|_| StoryError::TurnInProgress(id.clone()))?;

        let mut agents = live.agents.clone();
        if !agents.customize_style(character, update) {
            return Err(StoryError::NotFound(format!("character {character}")));
        }
        let Some(state) = agents.get(character) else {
            return Err(StoryError::NotFound(format!("character {character}")));
        };
        self.store.save_agent(id, state).await?;

        let style = state.style.clone();
        live.agents = agents;
        info!(story = %id, %character, "Style customized");
        Ok(style)
    }

    // ========================================================================
    // Turn pipeline
    // ========================================================================

    async fn initialize(&self, working: &mut StoryRuntime) -> Result<String, StoryError> {
        let storyteller = self.storyteller(&working.story);
        let story = &mut working.story;

        let outline = match story.outline.clone() {
            Some(outline) => outline,
            None => {
                let outline = storyteller.outline(&story.config).await?;
                story.outline = Some(outline.clone());
                outline
            }
        };

        let world = storyteller.world_context(&outline, &story.config).await?;
        story.world_context = Some(world);

        for concept in &outline.major_characters {
            if let Some(id) = working.agents.spawn(concept) {
                story.roster.push(id);
            }
        }

        let scene = storyteller
            .opening_scene(&outline, &story.config.player_character)
            .await?;
        let narrative = storyteller
            .compose_opening(&scene, &outline, story.world_context.as_ref())
            .await?;

        story.scene = Some(scene.clone());
        story.turn = 0;
        story.status = StoryStatus::Active;
        story.updated_at = Utc::now();
        story.push_narrative(
            NarrativeExchange {
                player_action: OPENING_MARKER.to_string(),
                narrative: narrative.clone(),
            },
            self.ctx.config().storyteller_history_turns,
        );

        let event = Event {
            story_id: story.id.clone(),
            turn: 0,
            kind: EventKind::Opening,
            player_input: None,
            narrative: narrative.clone(),
            accepted_moves: Vec::new(),
            perceptions: BTreeMap::new(),
            scene,
            departed: Vec::new(),
            timestamp: story.updated_at,
        };

        self.commit(working, &event, 0, &AgentManager::new()).await?;
        Ok(narrative)
    }

    /// Everything up to the commit point. Only touches `working`.
    async fn run_turn(
        &self,
        working: &mut StoryRuntime,
        input: &str,
    ) -> Result<(Event, DirectorValidation), StoryError> {
        let config = self.ctx.config();
        let story = &working.story;
        let turn = story.turn + 1;
        let source_event = Event::id_for(&story.id, turn);
        let scene = story
            .scene
            .clone()
            .ok_or_else(|| invalid(story, "continue without a scene"))?;
        let (director_params, storyteller_params, character_params) = self.role_params(story);

        // route
        let roster_agents = working.agents.active_in_order(&story.roster);
        let packets = router::route(
            &scene,
            &roster_agents,
            PlayerAction {
                player: story.player_name(),
                text: input,
                source_event: &source_event,
            },
        );

        // invoke
        let options = InvokeOptions {
            params: character_params,
            timeout: config.agent_timeout,
            max_context_tokens: config.max_context_tokens,
        };
        let responses = working
            .agents
            .invoke_all(
                self.ctx.backend(),
                &story.roster,
                &packets,
                options,
                config.max_concurrent_agents,
            )
            .await?;
        debug!(story = %story.id, turn, responses = responses.len(), "Agents responded");

        // validate
        let mut rng = self.turn_rng(story, turn);
        let validation = director::validate(
            &scene,
            &story.roster,
            story.player_name(),
            &responses,
            &mut rng,
        );
        let mut next_scene = scene.clone();
        validation.apply_to(&mut next_scene);

        // move the cast
        let storyteller = Storyteller::new(
            self.ctx.backend(),
            storyteller_params,
            director_params,
            config.max_context_tokens,
        );
        let cast: Vec<_> = roster_agents.iter().map(|a| &a.dossier).collect();
        let update = storyteller
            .scene_update(input, &next_scene, &validation, &cast)
            .await?;
        let names: Vec<&str> = cast.iter().map(|d| d.name.as_str()).collect();
        let changes = update.apply(&mut next_scene, &names);
        next_scene.revision = scene.revision + 1;
        if !changes.is_empty() {
            debug!(
                story = %story.id,
                turn,
                arrived = ?changes.arrived,
                departed = ?changes.departed,
                "Cast moved"
            );
        }

        // compose
        let narrative = storyteller
            .compose(
                input,
                &next_scene,
                &validation,
                &changes,
                &story.narrative_history,
                story.world_context.as_ref(),
            )
            .await?;

        // remember
        let perceptions = collect_perceptions(&packets, &responses);
        let departed = changes.departed_ids();
        working
            .agents
            .record_turn(turn, &perceptions, &responses, config.turn_memory_size);
        for id in &departed {
            working.agents.deactivate(id);
        }

        let story = &mut working.story;
        story.turn = turn;
        story.scene = Some(next_scene.clone());
        story.updated_at = Utc::now();
        story.push_narrative(
            NarrativeExchange {
                player_action: input.to_string(),
                narrative: narrative.clone(),
            },
            config.storyteller_history_turns,
        );

        let event = Event {
            story_id: story.id.clone(),
            turn,
            kind: EventKind::Turn,
            player_input: Some(input.to_string()),
            narrative,
            accepted_moves: validation.accepted.clone(),
            perceptions,
            scene: next_scene,
            departed,
            timestamp: story.updated_at,
        };
        Ok((event, validation))
    }

    /// Durably commit a prepared turn: event, agent records, snapshot.
    ///
    /// On failure after the event append the event is truncated and the
    /// previous agent records are rewritten.
    async fn commit(
        &self,
        working: &StoryRuntime,
        event: &Event,
        previous_turn: u64,
        previous_agents: &AgentManager,
    ) -> Result<(), StoryError> {
        let id = &working.story.id;
        self.store.append_event(event).await?;

        let result = async {
            persist::save_agents(self.store.as_ref(), id, &working.agents).await?;
            self.store.save_snapshot(&working.story).await
        }
        .await;

        if let Err(e) = result {
            warn!(story = %id, turn = event.turn, error = %e, "Commit failed, rolling back");
            // a failed opening leaves no events behind
            let keep_through = match event.kind {
                EventKind::Opening => None,
                EventKind::Turn => Some(previous_turn),
            };
            if let Err(rollback) = self.roll_back(id, keep_through, previous_agents).await {
                warn!(story = %id, error = %rollback, "Rollback incomplete");
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn roll_back(
        &self,
        id: &StoryId,
        keep_through: Option<u64>,
        previous_agents: &AgentManager,
    ) -> Result<(), PersistError> {
        self.store.truncate_events(id, keep_through).await?;
        persist::save_agents(self.store.as_ref(), id, previous_agents).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn meta_command(&self, live: &StoryRuntime, input: &str) -> Result<String, StoryError> {
        let command = input.split_whitespace().next().unwrap_or(input);
        match command {
            "/scene" => Ok(match &live.story.scene {
                Some(scene) => scene.describe(),
                None => "No scene yet.".to_string(),
            }),
            "/cast" => {
                let entries = cast(live);
                if entries.is_empty() {
                    return Ok("No characters yet.".to_string());
                }
                let lines: Vec<String> = entries
                    .iter()
                    .map(|c| {
                        format!(
                            "- {} ({}): {:?}, feeling {}",
                            c.name, c.role, c.position, c.emotional_state
                        )
                    })
                    .collect();
                Ok(format!("CAST:\n{}", lines.join("\n")))
            }
            "/save" => {
                self.persist_all(live).await?;
                Ok(format!("Story {} saved.", live.story.id))
            }
            other => Ok(format!(
                "Unknown command {other}. Available: /scene, /cast, /save"
            )),
        }
    }

    async fn persist_all(&self, live: &StoryRuntime) -> Result<(), StoryError> {
        persist::save_agents(self.store.as_ref(), &live.story.id, &live.agents).await?;
        self.store.save_snapshot(&live.story).await?;
        debug!(story = %live.story.id, "Story saved");
        Ok(())
    }

    async fn runtime(&self, id: &StoryId) -> Result<SharedRuntime, StoryError> {
        require_well_formed(id)?;
        if let Some(runtime) = self.live.read().await.get(id) {
            return Ok(runtime.clone());
        }

        let loaded = persist::load_story(self.store.as_ref(), id, self.ctx.config()).await?;
        let mut live = self.live.write().await;
        let runtime = live
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(StoryRuntime {
                    story: loaded.story,
                    agents: loaded.agents,
                }))
            })
            .clone();
        Ok(runtime)
    }

    fn storyteller(&self, story: &Story) -> Storyteller<'_> {
        let (director, storyteller, _) = self.role_params(story);
        Storyteller::new(
            self.ctx.backend(),
            storyteller,
            director,
            self.ctx.config().max_context_tokens,
        )
    }

    /// Director, storyteller and character parameters for a story.
    fn role_params(&self, story: &Story) -> (RoleParams, RoleParams, RoleParams) {
        let config = self.ctx.config();
        let temps = &story.config.temperatures;
        let apply = |params: RoleParams, t: Option<f32>| match t {
            Some(t) => params.with_temperature(t),
            None => params,
        };
        (
            apply(config.director, temps.director),
            apply(config.storyteller, temps.storyteller),
            apply(config.character, temps.character),
        )
    }

    fn turn_rng(&self, story: &Story, turn: u64) -> GameRng {
        match story.config.seed {
            Some(seed) => GameRng::new(seed).for_turn(turn),
            None => self.ctx.turn_rng(turn),
        }
    }
}

fn require_well_formed(id: &StoryId) -> Result<(), StoryError> {
    if id.is_well_formed() {
        Ok(())
    } else {
        Err(StoryError::NotFound(format!("story {id}")))
    }
}

fn collect_perceptions(
    packets: &BTreeMap<CharacterId, InformationPacket>,
    responses: &[CharacterResponse],
) -> BTreeMap<CharacterId, Perception> {
    responses
        .iter()
        .filter_map(|response| {
            let id = &response.mv.character;
            let packet = packets.get(id)?;
            Some((
                id.clone(),
                Perception {
                    packet: packet.clone(),
                    response: response.mv.summary(),
                    key_memory: response.key_memory(),
                    emotional_state: response.emotional_state.clone(),
                    beliefs: response.beliefs.clone(),
                },
            ))
        })
        .collect()
}

fn cast(live: &StoryRuntime) -> Vec<CastEntry> {
    live.agents
        .in_order(&live.story.roster)
        .into_iter()
        .map(|agent| CastEntry {
            id: agent.id().clone(),
            name: agent.name().to_string(),
            role: agent.dossier.role.clone(),
            position: live
                .story
                .scene
                .as_ref()
                .map(|s| s.position_of(agent.name()))
                .unwrap_or(Position::Remote),
            emotional_state: agent.dossier.emotional_state.clone(),
        })
        .collect()
}

fn require_status(
    story: &Story,
    expected: StoryStatus,
    operation: &'static str,
) -> Result<(), StoryError> {
    if story.status == expected {
        Ok(())
    } else {
        Err(invalid(story, operation))
    }
}

fn invalid(story: &Story, operation: &'static str) -> StoryError {
    StoryError::InvalidState {
        id: story.id.clone(),
        status: story.status,
        operation,
    }
}
