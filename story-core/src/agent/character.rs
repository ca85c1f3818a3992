//! Single character invocation.
//!
//! Builds the prompt for one agent, calls the backend under a timeout and
//! validates the reply. Malformed replies and timeouts get one retry; a
//! second malformed reply falls back to observing, a second timeout or any
//! transport error is returned to the caller.

use super::response::{CharacterResponse, ResponseWire};
use super::state::AgentState;
use crate::backend::{Backend, BackendError, GenerationRequest, GenerationRole};
use crate::config::RoleParams;
use crate::parse::parse_structured;
use crate::router::InformationPacket;
use std::time::Duration;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You play one character in an interactive story. Stay in character, \
act only on what your character perceives, keep secrets unless their reveal condition is met, \
and answer with a single JSON object.";

/// Recent turns included in every prompt.
const RECENT_TURNS: usize = 3;

/// Long-term memories recalled into every prompt.
const RECALLED_MEMORIES: usize = 3;

/// Settings for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    /// Character parameters before the style card's override.
    pub params: RoleParams,
    pub timeout: Duration,
    pub max_context_tokens: usize,
}

enum Attempt {
    Reply(CharacterResponse),
    Malformed(String),
    TimedOut,
}

/// Ask one agent how it responds to what it perceived.
pub async fn respond(
    backend: &dyn Backend,
    state: &AgentState,
    packet: &InformationPacket,
    options: InvokeOptions,
) -> Result<CharacterResponse, BackendError> {
    let params = match state.style.temperature_override {
        Some(t) => options.params.with_temperature(t),
        None => options.params,
    };
    let prompt = build_prompt(state, packet);

    let first = attempt(backend, state, &prompt, params, options).await?;
    let (retry_prompt, first_timed_out) = match first {
        Attempt::Reply(response) => return Ok(response),
        Attempt::Malformed(reason) => {
            debug!(character = %state.id(), %reason, "Malformed reply, retrying");
            let stricter = format!(
                "{prompt}\n\nYour previous reply could not be used ({reason}). Reply with ONLY one \
JSON object. \"intent\" must be \"act\" (with \"action\"), \"speak\" (with \"dialogue\") or \
\"observe\". No prose, no code fences."
            );
            (stricter, false)
        }
        Attempt::TimedOut => {
            debug!(character = %state.id(), "Reply timed out, retrying");
            (prompt, true)
        }
    };

    match attempt(backend, state, &retry_prompt, params, options).await? {
        Attempt::Reply(response) => Ok(response),
        Attempt::TimedOut if first_timed_out => {
            warn!(character = %state.id(), "Reply timed out twice");
            Err(BackendError::Timeout)
        }
        Attempt::Malformed(_) | Attempt::TimedOut => {
            warn!(
                character = %state.id(),
                "No usable reply after retry, defaulting to observe"
            );
            Ok(CharacterResponse::default_observe(
                state.id().clone(),
                state.name(),
            ))
        }
    }
}

async fn attempt(
    backend: &dyn Backend,
    state: &AgentState,
    prompt: &str,
    params: RoleParams,
    options: InvokeOptions,
) -> Result<Attempt, BackendError> {
    let request = GenerationRequest::new(
        GenerationRole::Character,
        state.id().as_str(),
        SYSTEM_PROMPT,
        params,
    )
    .with_user(prompt)
    .fit_to_budget(options.max_context_tokens);

    let reply = match tokio::time::timeout(options.timeout, backend.complete(request)).await {
        Err(_) | Ok(Err(BackendError::Timeout)) => return Ok(Attempt::TimedOut),
        Ok(Err(e)) => return Err(e),
        Ok(Ok(reply)) => reply,
    };

    let parsed = parse_structured::<ResponseWire>(&reply)
        .and_then(|wire| wire.into_response(state.id().clone(), state.name()));
    Ok(match parsed {
        Ok(response) => Attempt::Reply(response),
        Err(e) => Attempt::Malformed(e.reason),
    })
}

fn build_prompt(state: &AgentState, packet: &InformationPacket) -> String {
    let style = &state.style;
    let mut prompt = state.dossier.render();

    prompt.push_str("\n\nSTYLE:\n");
    prompt.push_str(&format!("Voice: {}\n", style.voice.join(", ")));
    prompt.push_str(&format!("Speech Patterns: {}\n", style.speech_patterns.join(", ")));
    if !style.catchphrases.is_empty() {
        prompt.push_str(&format!("Catchphrases: {}\n", style.catchphrases.join(", ")));
    }
    if !style.taboo_topics.is_empty() {
        prompt.push_str(&format!("Never discuss: {}\n", style.taboo_topics.join(", ")));
    }

    let recent: Vec<String> = state
        .recent(RECENT_TURNS)
        .map(|m| format!("- Turn {}: {} / You: {}", m.turn, m.perceived, m.response))
        .collect();
    if !recent.is_empty() {
        prompt.push_str("\nRECENT EVENTS:\n");
        prompt.push_str(&recent.join("\n"));
        prompt.push('\n');
    }

    let recalled: Vec<String> = state
        .recall(&packet.content, RECALLED_MEMORIES)
        .into_iter()
        .map(|m| format!("- {}", m.text))
        .collect();
    if !recalled.is_empty() {
        prompt.push_str("\nYOU REMEMBER:\n");
        prompt.push_str(&recalled.join("\n"));
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "\nWHAT YOU PERCEIVE (attention: {:?}):\n{}\n",
        packet.attention, packet.content
    ));

    prompt.push_str(&format!(
        r#"
Decide how {name} responds. Silence is often the wisest choice.

Return ONLY valid JSON:
{{
  "intent": "act" | "speak" | "observe",
  "action": "physical action, required for act",
  "dialogue": "exact words spoken, required for speak",
  "notes": "what you notice, for observe",
  "targets": ["who or what you focus on"],
  "rationale": "private reasoning",
  "key_event": true or false,
  "memory": "what to remember if this is a key event",
  "emotional_state": "new emotional state or null",
  "beliefs": {{"topic": "updated belief"}}
}}"#,
        name = state.name()
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::response::Intent;
    use crate::router::AttentionLevel;
    use crate::story::CharacterConcept;
    use crate::testing::{ScriptedBackend, Scripted};

    fn options() -> InvokeOptions {
        InvokeOptions {
            params: RoleParams::character(),
            timeout: Duration::from_millis(200),
            max_context_tokens: 8192,
        }
    }

    fn packet() -> InformationPacket {
        InformationPacket {
            attention: AttentionLevel::Full,
            content: "Eleanor Blackwood draws a sword".into(),
            source_event: "story#1".into(),
        }
    }

    fn ashford() -> AgentState {
        AgentState::spawn(&CharacterConcept::new("Lord Ashford", "antagonist"))
    }

    #[tokio::test]
    async fn test_valid_reply() {
        let backend = ScriptedBackend::new().with_character(
            "Lord Ashford",
            r#"{"intent": "speak", "dialogue": "I will not yield."}"#,
        );
        let response = respond(&backend, &ashford(), &packet(), options())
            .await
            .unwrap();
        assert_eq!(response.mv.intent.dialogue(), Some("I will not yield."));
        assert_eq!(backend.calls_for("lord_ashford"), 1);
    }

    #[tokio::test]
    async fn test_malformed_then_valid() {
        let backend = ScriptedBackend::new()
            .with_character("Lord Ashford", "I shall ponder this.")
            .with_character("Lord Ashford", r#"{"intent": "act", "action": "bows"}"#);
        let response = respond(&backend, &ashford(), &packet(), options())
            .await
            .unwrap();
        assert!(matches!(response.mv.intent, Intent::Act { .. }));

        let requests = backend.requests_for("lord_ashford");
        assert_eq!(requests.len(), 2);
        assert!(requests[1].prompt().contains("could not be used"));
    }

    #[tokio::test]
    async fn test_malformed_twice_defaults_to_observe() {
        let backend = ScriptedBackend::new()
            .with_character("Lord Ashford", "no")
            .with_character("Lord Ashford", "still no");
        let response = respond(&backend, &ashford(), &packet(), options())
            .await
            .unwrap();
        assert!(response.mv.intent.is_observe());
        assert_eq!(backend.calls_for("lord_ashford"), 2);
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let backend = ScriptedBackend::new().with_character_reply(
            "Lord Ashford",
            Scripted::Fail(BackendError::Transport("connection refused".into())),
        );
        let err = respond(&backend, &ashford(), &packet(), options())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
        assert_eq!(backend.calls_for("lord_ashford"), 1);
    }

    #[tokio::test]
    async fn test_two_timeouts_abort() {
        let backend = ScriptedBackend::new()
            .with_character_reply("Lord Ashford", Scripted::Fail(BackendError::Timeout))
            .with_character_reply("Lord Ashford", Scripted::Fail(BackendError::Timeout));
        let err = respond(&backend, &ashford(), &packet(), options())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout));
    }

    #[tokio::test]
    async fn test_slow_reply_times_out_then_retries() {
        let backend = ScriptedBackend::new()
            .with_character_reply(
                "Lord Ashford",
                Scripted::Delayed(
                    Duration::from_secs(5),
                    r#"{"intent": "observe"}"#.into(),
                ),
            )
            .with_character("Lord Ashford", r#"{"intent": "speak", "dialogue": "Late."}"#);
        let response = respond(&backend, &ashford(), &packet(), options())
            .await
            .unwrap();
        assert_eq!(response.mv.intent.dialogue(), Some("Late."));
    }

    #[tokio::test]
    async fn test_style_temperature_override() {
        let mut state = ashford();
        state.style.temperature_override = Some(0.55);
        let backend = ScriptedBackend::new()
            .with_character("Lord Ashford", r#"{"intent": "observe"}"#);
        respond(&backend, &state, &packet(), options()).await.unwrap();

        let requests = backend.requests_for("lord_ashford");
        assert_eq!(requests[0].temperature, 0.55);
    }

    #[test]
    fn test_prompt_includes_recent_and_recalled_memory() {
        let mut state = ashford();
        state.add_long_term(1, "Eleanor once threatened me with a sword");
        state.add_long_term(2, "The garden party was dull");
        for turn in 1..=5 {
            state.remember_turn(
                crate::agent::TurnMemory {
                    turn,
                    perceived: format!("event {turn}"),
                    response: "watched".into(),
                },
                20,
            );
        }

        let prompt = build_prompt(&state, &packet());
        assert!(prompt.contains("Turn 5"));
        assert!(prompt.contains("Turn 3"));
        assert!(!prompt.contains("Turn 2:"));
        assert!(prompt.contains("threatened me with a sword"));
        assert!(!prompt.contains("garden party"));
    }
}
