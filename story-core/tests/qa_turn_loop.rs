//! QA tests for the turn loop.
//!
//! These drive the orchestrator end to end against a scripted backend, so
//! they run offline and are deterministic.
//! Run with: `cargo test -p story-core --test qa_turn_loop`

use std::collections::BTreeMap;
use std::time::Duration;
use story_core::agent::{AgentState, SpecialPerception};
use story_core::router::{self, InformationPacket, PlayerAction};
use story_core::story::{CharacterConcept, Position, Scene};
use story_core::testing::{
    assert_attention, assert_event_turns, assert_narrative_contains, assert_story_at, fixtures,
    Scripted, TestHarness,
};
use story_core::{
    AttentionLevel, CharacterId, EngineConfig, FaultyStore, MemoryStore, ScriptedBackend,
    StoryError, StoryStatus, StoryStore, TurnOutcome,
};

/// Install a test subscriber so `RUST_LOG` works under `cargo test`.
fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Full loop
// =============================================================================

const STANDOFF: &str = "Steel rasps free of the scabbard, loud in the hush of the apothecary. \
    Eleanor Blackwood levels the blade at the man who has smiled at her across the king's \
    table for three winters, and for a moment the only sound is the slow drip of tincture \
    from a cracked flask on the counter. Lord Ashford does not flinch. He regards the point \
    of the sword the way he might regard a poorly chosen wine, with patience and a faint, \
    weary disappointment. Candle smoke coils between them. Somewhere beyond the shutters a \
    bell marks the late hour, and the sound seems to come from very far away. \
    \"I will not yield.\" His voice is soft, almost kind, and that is the worst of it. He \
    folds his gloved hands over the head of his cane and waits, as if the next move belongs \
    to her and he is curious to see whether she has the stomach for it. Eleanor's wrist \
    aches. The blade does not waver, but she feels the weight of it settle into her \
    shoulder, the weight of every accusation she has not yet dared to speak aloud before \
    the court. The jars along the shelves catch the candlelight, rows of small amber eyes \
    watching without judgment. Then the door bangs open. Captain Reyes shoulders through \
    it with her cloak still wet from the courtyard, one hand already resting on the hilt \
    at her hip. She takes in the drawn sword, the calm nobleman, the apothecary's stillness, \
    and her jaw tightens. Nobody speaks. The tincture drips. Ashford's smile widens by a \
    fraction, the smile of a man who has just been handed a witness and intends to make \
    good use of her before the night is out.";

#[tokio::test]
async fn test_full_turn_with_present_and_nearby_characters() {
    setup();
    let backend = ScriptedBackend::new()
        .with_character(
            "Lord Ashford",
            r#"{"intent": "speak", "dialogue": "I will not yield.", "key_event": true,
                "memory": "Eleanor drew steel on me", "emotional_state": "cold fury"}"#,
        )
        .with_character(
            "Captain Reyes",
            r#"{"intent": "act", "action": "shoulders through the door", "targets": ["Eleanor Blackwood"]}"#,
        )
        .with_storyteller("compose", STANDOFF);
    let h = TestHarness::with_parts(EngineConfig::default(), backend, MemoryStore::new());
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();

    let report = h
        .play(&id, r#"I draw a sword and say "Surrender the antidote, Ashford!""#)
        .await
        .unwrap();

    assert_eq!(report.turn, 1);
    assert_eq!(report.scene.revision, 1);
    assert_narrative_contains(&report.narrative, &["I will not yield."]);
    let words = report.narrative.split_whitespace().count();
    assert!((200..=500).contains(&words), "narrative has {words} words");

    // the present character hears every word, the nearby one only the gist
    let ashford_prompt = h.backend.requests_for("lord_ashford")[0].prompt().to_string();
    let reyes_prompt = h.backend.requests_for("captain_reyes")[0].prompt().to_string();
    assert!(ashford_prompt.contains("Surrender the antidote, Ashford!"));
    assert!(!reyes_prompt.contains("Surrender the antidote"));
    assert!(reyes_prompt.contains("say something about"));

    // an accepted nearby act brings the character into the scene
    assert_eq!(report.validation.moved_in, vec!["Captain Reyes".to_string()]);
    assert_eq!(report.scene.position_of("Captain Reyes"), Position::Present);
    assert!(report.validation.rejected.is_empty());

    let story = h.orchestrator.story(&id).await.unwrap();
    assert_story_at(&story, 1, StoryStatus::Active);
    assert_eq!(story.narrative_history.len(), 2);

    let events = h.events(&id).await.unwrap();
    assert_event_turns(&events, &[1]);
    assert_eq!(events[0].accepted_moves.len(), 2);
    assert_eq!(
        events[0].perceptions[&CharacterId::from_name("Captain Reyes")]
            .packet
            .attention,
        AttentionLevel::Partial
    );

    let ashford = h
        .orchestrator
        .agent_state(&id, &CharacterId::from_name("Lord Ashford"))
        .await
        .unwrap();
    assert_eq!(ashford.dossier.emotional_state, "cold fury");
    assert_eq!(ashford.long_term[0].text, "Eleanor drew steel on me");
    assert_eq!(ashford.last_turn, 1);

    // nothing Reyes could not hear reaches her prompt, her perception or her memory
    let reyes_id = CharacterId::from_name("Captain Reyes");
    let reyes = h.orchestrator.agent_state(&id, &reyes_id).await.unwrap();
    let reyes_perception = &events[0].perceptions[&reyes_id];
    let seen_by_reyes = [
        reyes_prompt.as_str(),
        reyes_perception.packet.content.as_str(),
        reyes.turn_memory[0].perceived.as_str(),
    ];
    for text in seen_by_reyes {
        for private in ["Surrender the antidote", "antidote, Ashford"] {
            assert!(!text.contains(private), "{private:?} leaked into {text:?}");
        }
    }
}

#[tokio::test]
async fn test_present_actor_and_nearby_observer() {
    setup();
    let backend = ScriptedBackend::new()
        .with_character(
            "Lord Ashford",
            r#"{"intent": "act", "action": "raises his cane to parry", "targets": ["Eleanor Blackwood"]}"#,
        )
        .with_character("Captain Reyes", r#"{"intent": "observe", "notes": "a blade"}"#)
        .with_storyteller(
            "compose",
            "Eleanor's blade clears its scabbard. Lord Ashford raises his cane to parry, \
             eyes never leaving hers.",
        );
    let h = TestHarness::with_parts(EngineConfig::default(), backend, MemoryStore::new());
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();
    let before = h.orchestrator.story(&id).await.unwrap();

    let report = h.play(&id, "draws a sword").await.unwrap();

    let events = h.events(&id).await.unwrap();
    let packets: BTreeMap<CharacterId, InformationPacket> = events[0]
        .perceptions
        .iter()
        .map(|(id, p)| (id.clone(), p.packet.clone()))
        .collect();
    assert_attention(&packets, "Lord Ashford", AttentionLevel::Full);
    assert_attention(&packets, "Captain Reyes", AttentionLevel::Partial);
    assert_eq!(report.validation.accepted.len(), 1);
    assert_eq!(report.validation.accepted[0].name, "Lord Ashford");
    assert_eq!(report.validation.observers[0].name, "Captain Reyes");
    assert_narrative_contains(&report.narrative, &["raises his cane to parry"]);
    assert_eq!(report.turn, before.turn + 1);
    assert_eq!(report.scene.revision, 1);
    assert_event_turns(&events, &[1]);
}

#[tokio::test]
async fn test_quiet_turn_still_runs_every_step() {
    setup();
    let h = TestHarness::new();
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();

    let report = h.play(&id, "I wait").await.unwrap();

    assert!(report.validation.accepted.is_empty());
    assert_eq!(report.validation.observers.len(), 2);
    assert_eq!(report.scene.revision, 1);
    assert_eq!(h.backend.calls_for("compose"), 1);
    assert_event_turns(&h.events(&id).await.unwrap(), &[1]);
}

#[tokio::test]
async fn test_started_story_brings_characters_on_stage() {
    setup();
    let h = TestHarness::new();
    let id = h.start_story().await.unwrap();
    h.backend.queue(
        "scene_update",
        Scripted::Reply(r#"{"enter": ["Lord Ashford"], "approach": ["Captain Reyes"]}"#.into()),
    );

    // everyone starts off-stage, so nobody is asked on the first turn
    let report = h.play(&id, "I send for Lord Ashford").await.unwrap();
    assert_eq!(report.turn, 1);
    assert_eq!(report.scene.revision, 1);
    assert_eq!(h.backend.calls_for("lord_ashford"), 0);
    assert_eq!(report.scene.position_of("Lord Ashford"), Position::Present);
    assert_eq!(report.scene.position_of("Captain Reyes"), Position::Nearby);

    let compose = h.backend.requests_for("compose")[0].prompt().to_string();
    assert!(compose.contains("ARRIVING: Lord Ashford"));

    let report = h.play(&id, "I offer Ashford a cup of wine").await.unwrap();
    assert_eq!(report.turn, 2);
    assert_eq!(report.scene.revision, 2);
    assert_eq!(h.backend.calls_for("lord_ashford"), 1);
    assert_eq!(h.backend.calls_for("captain_reyes"), 1);
    let ashford_prompt = h.backend.requests_for("lord_ashford")[0].prompt().to_string();
    assert!(ashford_prompt.contains("I offer Ashford a cup of wine"));

    let events = h.events(&id).await.unwrap();
    assert_event_turns(&events, &[0, 1, 2]);
    assert_eq!(events[1].scene.position_of("Lord Ashford"), Position::Present);
}

#[tokio::test]
async fn test_departed_character_leaves_the_story() {
    setup();
    let h = TestHarness::new();
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();
    h.backend.queue(
        "scene_update",
        Scripted::Reply(r#"{"depart": ["captain reyes"], "enter": ["Captain Reyes", "Nobody"]}"#.into()),
    );

    let report = h.play(&id, "I dismiss the captain from royal service").await.unwrap();
    let reyes = CharacterId::from_name("Captain Reyes");
    assert_eq!(report.scene.position_of("Captain Reyes"), Position::Remote);
    assert!(!report.scene.remote.iter().any(|n| n == "Captain Reyes"));
    assert_eq!(h.backend.calls_for("captain_reyes"), 1);

    let events = h.events(&id).await.unwrap();
    assert_eq!(events[0].departed, vec![reyes.clone()]);
    let state = h.orchestrator.agent_state(&id, &reyes).await.unwrap();
    assert!(!state.active);
    assert_eq!(state.last_turn, 1);

    h.play(&id, "I wait").await.unwrap();
    assert_eq!(h.backend.calls_for("captain_reyes"), 1);
    assert_eq!(h.backend.calls_for("lord_ashford"), 2);
}

// =============================================================================
// Dialogue fidelity
// =============================================================================

#[tokio::test]
async fn test_dialogue_survives_a_forgetful_storyteller() {
    setup();
    let backend = ScriptedBackend::new()
        .with_character(
            "Lord Ashford",
            r#"{"intent": "speak", "dialogue": "I will not yield."}"#,
        )
        .with_storyteller("compose", "Lord Ashford refuses.")
        .with_storyteller("compose", "Lord Ashford refuses, again.");
    let h = TestHarness::with_parts(EngineConfig::default(), backend, MemoryStore::new());
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();

    let report = h.play(&id, "I demand the antidote").await.unwrap();

    assert_narrative_contains(&report.narrative, &["\"I will not yield.\""]);
    assert_eq!(h.backend.calls_for("compose"), 2);
    let moves = &h.events(&id).await.unwrap()[0].accepted_moves;
    assert_eq!(moves[0].intent.dialogue(), Some("I will not yield."));
}

// =============================================================================
// Director
// =============================================================================

#[tokio::test]
async fn test_present_claimant_beats_nearby_claimant() {
    setup();
    let backend = ScriptedBackend::new()
        .with_character(
            "Lord Ashford",
            r#"{"intent": "act", "action": "pockets the vial", "targets": ["the vial"]}"#,
        )
        .with_character(
            "Captain Reyes",
            r#"{"intent": "act", "action": "lunges for the vial", "targets": ["The Vial"]}"#,
        );
    let h = TestHarness::with_parts(EngineConfig::default(), backend, MemoryStore::new());
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();

    let report = h.play(&id, "I point at the vial").await.unwrap();

    assert_eq!(report.validation.accepted.len(), 1);
    assert_eq!(report.validation.accepted[0].name, "Lord Ashford");
    assert_eq!(report.validation.rejected.len(), 1);
    assert!(report.validation.rejected[0].reason.contains("acted on"));
    // the losing nearby character does not move in
    assert!(report.validation.moved_in.is_empty());
    assert_eq!(report.validation.npc_reactions.len(), 1);
}

#[tokio::test]
async fn test_tie_breaks_are_reproducible() {
    setup();
    let mut winners = Vec::new();
    for reseeded in [false, true] {
        let backend = ScriptedBackend::new()
            .with_character(
                "Lord Ashford",
                r#"{"intent": "act", "action": "grabs the vial", "targets": ["the vial"]}"#,
            )
            .with_character(
                "Captain Reyes",
                r#"{"intent": "act", "action": "grabs the vial", "targets": ["the vial"]}"#,
            );
        // the same seed, once from config and once by reseeding between scenarios
        let config = if reseeded {
            EngineConfig::default()
        } else {
            EngineConfig::default().with_rng_seed(99)
        };
        let h = TestHarness::with_parts(config, backend, MemoryStore::new());
        if reseeded {
            h.orchestrator.context().reseed(99);
        }
        let mut story = fixtures::active_story();
        if let Some(scene) = story.scene.as_mut() {
            scene.bring_into_scene("Captain Reyes");
        }
        let id = h.seed_story(&story).await.unwrap();

        let report = h.play(&id, "I set the vial down").await.unwrap();
        assert_eq!(report.validation.accepted.len(), 1);
        winners.push(report.validation.accepted[0].name.clone());
    }
    assert_eq!(winners[0], winners[1]);
}

// =============================================================================
// Routing
// =============================================================================

fn agent(name: &str, perception: Vec<SpecialPerception>) -> AgentState {
    let mut concept = CharacterConcept::new(name, "extra");
    concept.perception = perception;
    AgentState::spawn(&concept)
}

fn action(text: &str) -> PlayerAction<'_> {
    PlayerAction {
        player: "Eleanor Blackwood",
        text,
        source_event: "story#1",
    }
}

#[test]
fn test_routing_is_deterministic() {
    let agents = [
        agent("Lord Ashford", vec![]),
        agent("Captain Reyes", vec![]),
        agent("The Oracle", vec![SpecialPerception::Scrying]),
        agent("The Spymaster", vec![SpecialPerception::Informants]),
        agent("A Farmer", vec![]),
    ];
    let refs: Vec<&AgentState> = agents.iter().collect();
    let scene = fixtures::scene();
    let act = action(r#"I whisper "the chancellor poisoned the wine""#);

    let first = router::route(&scene, &refs, act);
    let second = router::route(&scene, &refs, act);
    assert_eq!(first, second);
    assert_eq!(first.len(), agents.len());

    assert_attention(&first, "Lord Ashford", AttentionLevel::Full);
    assert_attention(&first, "Captain Reyes", AttentionLevel::Partial);
    assert_attention(&first, "The Oracle", AttentionLevel::Partial);
    assert_attention(&first, "The Spymaster", AttentionLevel::Peripheral);
    assert_attention(&first, "A Farmer", AttentionLevel::None);

    let rumor = &first[&CharacterId::from_name("The Spymaster")].content;
    assert!(rumor.contains("The royal apothecary"));
    assert!(!rumor.contains("poisoned"));
}

#[test]
fn test_attention_never_drops_as_characters_move_closer() {
    let act = action(r#"I shout "Guards!" and overturn the table"#);
    for perception in [
        vec![],
        vec![SpecialPerception::Scrying],
        vec![SpecialPerception::Informants],
    ] {
        let watcher = agent("Watcher", perception);
        let mut previous = AttentionLevel::None;

        for position in [Position::Remote, Position::Nearby, Position::Present] {
            let mut scene = Scene::new("The great hall");
            match position {
                Position::Present => scene.present.push("Watcher".into()),
                Position::Nearby => scene.nearby.push("Watcher".into()),
                Position::Remote => scene.remote.push("Watcher".into()),
            }
            let packets = router::route(&scene, &[&watcher], act);
            let attention = packets[watcher.id()].attention;
            assert!(
                attention >= previous,
                "{position:?} gave {attention:?}, below {previous:?}"
            );
            previous = attention;
        }
        assert_eq!(previous, AttentionLevel::Full);
    }
}

// =============================================================================
// Memory
// =============================================================================

#[tokio::test]
async fn test_turn_memory_is_bounded_and_long_term_grows() {
    setup();
    let backend = ScriptedBackend::new();
    for turn in 1..=5 {
        backend.queue_character(
            "Lord Ashford",
            Scripted::Reply(format!(
                r#"{{"intent": "observe", "key_event": true, "memory": "memory {turn}"}}"#
            )),
        );
    }
    let h = TestHarness::with_parts(
        EngineConfig::default().with_turn_memory_size(3),
        backend,
        MemoryStore::new(),
    );
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();
    let ashford = CharacterId::from_name("Lord Ashford");

    let mut long_term = 0;
    for turn in 1..=5 {
        h.play(&id, &format!("I pace the room, turn {turn}")).await.unwrap();
        let state = h.orchestrator.agent_state(&id, &ashford).await.unwrap();
        assert!(state.turn_memory.len() <= 3);
        assert!(state.long_term.len() >= long_term);
        long_term = state.long_term.len();
    }

    let state = h.orchestrator.agent_state(&id, &ashford).await.unwrap();
    let turns: Vec<u64> = state.turn_memory.iter().map(|m| m.turn).collect();
    assert_eq!(turns, vec![3, 4, 5]);
    assert_eq!(state.long_term.len(), 5);
}

// =============================================================================
// Atomicity, locking and cancellation
// =============================================================================

#[tokio::test]
async fn test_failed_commit_leaves_no_trace() {
    setup();
    let h = TestHarness::new();
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();
    h.play(&id, "I open the window").await.unwrap();
    let before = h.orchestrator.story(&id).await.unwrap();

    let faults: [fn(&FaultyStore, bool); 3] = [
        FaultyStore::fail_appends,
        FaultyStore::fail_agent_saves,
        FaultyStore::fail_snapshots,
    ];
    for inject in faults {
        inject(&h.store, true);
        let err = h.play(&id, "I close the window").await.unwrap_err();
        assert!(matches!(err, StoryError::Persist(_)));
        h.store.heal();

        let after = h.orchestrator.story(&id).await.unwrap();
        assert_eq!(after, before);
        assert_event_turns(&h.events(&id).await.unwrap(), &[1]);
        let stored = h.store.inner().load_snapshot(&id).await.unwrap();
        assert_eq!(stored.turn, 1);
    }

    // nothing to repair on reload
    let report = h.orchestrator.load(&id).await.unwrap();
    assert!(report.is_clean(), "unexpected repairs: {report:?}");

    let report = h.play(&id, "I close the window").await.unwrap();
    assert_eq!(report.turn, 2);
    assert_eq!(report.scene.revision, 2);
}

#[tokio::test]
async fn test_second_submission_is_rejected_while_turn_runs() {
    setup();
    let backend = ScriptedBackend::new().with_character_reply(
        "Lord Ashford",
        Scripted::Delayed(Duration::from_millis(200), r#"{"intent": "observe"}"#.into()),
    );
    let h = TestHarness::with_parts(EngineConfig::default(), backend, MemoryStore::new());
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();

    let (first, second) = tokio::join!(h.orchestrator.continue_story(&id, "I wait"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.orchestrator.continue_story(&id, "I also wait").await
    });

    assert!(matches!(first, Ok(TurnOutcome::Turn(_))));
    assert!(matches!(second, Err(StoryError::TurnInProgress(_))));
    assert_event_turns(&h.events(&id).await.unwrap(), &[1]);
}

#[tokio::test]
async fn test_cancelled_turn_commits_nothing() {
    setup();
    let backend = ScriptedBackend::new().with_character_reply(
        "Lord Ashford",
        Scripted::Delayed(Duration::from_millis(300), r#"{"intent": "observe"}"#.into()),
    );
    let h = TestHarness::with_parts(EngineConfig::default(), backend, MemoryStore::new());
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();

    let result = h
        .orchestrator
        .continue_with_cancel(
            &id,
            "I wait",
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await;
    assert!(matches!(result, Err(StoryError::Cancelled)));

    let story = h.orchestrator.story(&id).await.unwrap();
    assert_story_at(&story, 0, StoryStatus::Active);
    assert!(h.events(&id).await.unwrap().is_empty());

    // the story is still playable
    assert_eq!(h.play(&id, "I wait").await.unwrap().turn, 1);
}

// =============================================================================
// Meta commands
// =============================================================================

#[tokio::test]
async fn test_save_command_persists_without_a_turn() {
    setup();
    let h = TestHarness::new();
    let id = h.seed_story(&fixtures::active_story()).await.unwrap();
    h.store.inner().remove_agent(&id, &CharacterId::from_name("Lord Ashford")).await;

    let TurnOutcome::Meta(reply) = h.orchestrator.continue_story(&id, "/save").await.unwrap()
    else {
        panic!("expected a meta reply");
    };
    assert!(reply.contains("saved"));
    assert!(h
        .store
        .inner()
        .load_agent(&id, &CharacterId::from_name("Lord Ashford"))
        .await
        .unwrap()
        .is_some());
    assert!(h.events(&id).await.unwrap().is_empty());
}
