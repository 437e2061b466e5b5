use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Buffering error: {0}")]
    Buffering(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Language model error: {0}")]
    Llm(String),

    #[error("Message delivery error: {0}")]
    Delivery(String),

    #[error("Conversation history error: {0}")]
    History(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<crate::llm::LlmError> for RelayError {
    fn from(err: crate::llm::LlmError) -> Self {
        RelayError::Llm(err.to_string())
    }
}
