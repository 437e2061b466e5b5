//! Provider-agnostic language model abstraction.
//!
//! Hosted backends (OpenAI-compatible APIs, a secondary fallback provider,
//! test doubles) implement [`LanguageModel`] so the reply pipeline does not
//! depend on any particular vendor.

use crate::types::ChatRole;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Language model provider trait.
pub trait LanguageModel: Send + Sync {
    /// Produce a completion for the given chat transcript.
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<Completion, LlmError>>;

    /// Provider name for metrics/logging.
    fn provider_name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptMessage {
    pub role: ChatRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    /// Overrides the provider's configured model when set.
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub provider: String,
    pub model: String,
}

/// Errors that can occur while calling a language model.
#[derive(Debug, Clone)]
pub enum LlmError {
    /// Network or transport failure.
    Transport(String),
    /// Provider answered with a non-success status.
    Status { status: u16, body: String },
    /// Response could not be understood or was empty.
    InvalidResponse(String),
    /// The call did not finish in time.
    Timeout(String),
    /// Every configured provider failed.
    Exhausted(Vec<String>),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transport(msg) => write!(f, "transport failure: {msg}"),
            LlmError::Status { status, body } => write!(f, "provider status {status}: {body}"),
            LlmError::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
            LlmError::Timeout(msg) => write!(f, "timeout: {msg}"),
            LlmError::Exhausted(errors) => {
                write!(f, "all providers failed: {}", errors.join("; "))
            }
        }
    }
}

impl std::error::Error for LlmError {}
