//! The text-generation backend seam.
//!
//! The engine never talks HTTP directly. Each role builds a
//! [`GenerationRequest`] and hands it to a [`Backend`]; the production
//! implementation wraps the `completions` client, tests use
//! [`crate::testing::ScriptedBackend`].

use crate::config::RoleParams;
use async_trait::async_trait;
use thiserror::Error;

/// Errors crossing the backend seam.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Transport(String),

    #[error("backend call timed out")]
    Timeout,

    #[error("backend rejected request (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl From<completions::Error> for BackendError {
    fn from(e: completions::Error) -> Self {
        match e {
            completions::Error::Timeout => BackendError::Timeout,
            completions::Error::Api { status, message } => BackendError::Api { status, message },
            other => BackendError::Transport(other.to_string()),
        }
    }
}

/// Which role issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationRole {
    Director,
    Storyteller,
    Character,
}

/// Speaker of one context message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

/// One message of conversation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMessage {
    pub speaker: Speaker,
    pub content: String,
}

impl ContextMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            content: content.into(),
        }
    }
}

/// A single request to the generation backend.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub role: GenerationRole,
    /// Free-form tag identifying the caller (a character id, "outline", ...).
    pub label: String,
    pub system: String,
    pub messages: Vec<ContextMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
    /// Whether the caller will parse the reply as JSON.
    pub structured: bool,
}

impl GenerationRequest {
    /// A request carrying the role's default parameters.
    pub fn new(
        role: GenerationRole,
        label: impl Into<String>,
        system: impl Into<String>,
        params: RoleParams,
    ) -> Self {
        Self {
            role,
            label: label.into(),
            system: system.into(),
            messages: Vec::new(),
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            structured: params.json_mode,
        }
    }

    pub fn with_messages(mut self, messages: Vec<ContextMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ContextMessage::user(content));
        self
    }

    /// The last user message (the prompt proper).
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.speaker == Speaker::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// Estimated tokens of the whole context.
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.system)
            + self
                .messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum::<usize>()
    }

    /// Drop the oldest context messages until the request plus its reply fit
    /// the token budget. The final message is always kept.
    pub fn fit_to_budget(mut self, max_context_tokens: usize) -> Self {
        let budget = max_context_tokens.saturating_sub(self.max_tokens);
        while self.messages.len() > 1 && self.estimated_tokens() > budget {
            self.messages.remove(0);
        }
        self
    }
}

/// Rough token estimate (four characters per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// A stateless text-generation service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Generate a reply for the request.
    async fn complete(&self, request: GenerationRequest) -> Result<String, BackendError>;
}

/// Backend over an OpenAI-compatible chat completions server.
#[derive(Clone)]
pub struct CompletionsBackend {
    client: completions::Client,
}

impl CompletionsBackend {
    pub fn new(client: completions::Client) -> Self {
        Self { client }
    }

    /// Build from `OPENAI_BASE_URL` / `OPENAI_API_KEY` / `MODEL_NAME`.
    pub fn from_env() -> Result<Self, BackendError> {
        Ok(Self::new(completions::Client::from_env()?))
    }
}

#[async_trait]
impl Backend for CompletionsBackend {
    async fn complete(&self, request: GenerationRequest) -> Result<String, BackendError> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(completions::Message::system(request.system));
        messages.extend(request.messages.into_iter().map(|m| match m.speaker {
            Speaker::User => completions::Message::user(m.content),
            Speaker::Assistant => completions::Message::assistant(m.content),
        }));

        let api_request = completions::Request::new(messages)
            .with_temperature(request.temperature)
            .with_top_p(request.top_p)
            .with_max_tokens(request.max_tokens)
            .with_json_mode(request.structured);

        let response = self.client.complete(api_request).await?;
        Ok(response.text)
    }
}
