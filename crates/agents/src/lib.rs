#![warn(clippy::unwrap_used)]

pub mod accumulator;
pub mod directory;
pub mod llm;
pub mod processor;
pub mod prompt;

pub use accumulator::{flush_callback, AccumulatorSnapshot, FlushCallback, MessageAccumulator};
pub use directory::AgentDirectory;
pub use llm::{build_language_model, FallbackModel, HostedModel};
pub use processor::{ConversationProcessor, ProcessedReply};
pub use prompt::PromptBuilder;
