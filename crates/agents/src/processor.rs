//! Reply pipeline for a flushed burst: loads the agent, reads conversation
//! history, builds the prompt, calls the language model, records the
//! exchange and sends the answer back over WhatsApp.

use crate::accumulator::{flush_callback, FlushCallback};
use crate::directory::AgentDirectory;
use crate::prompt::{combine_burst, contact_name, PromptBuilder};
use chrono::Utc;
use relay_cache::HistoryCache;
use relay_channels::OutboundMessenger;
use relay_core::config::LlmConfig;
use relay_core::llm::{CompletionRequest, LanguageModel};
use relay_core::types::{ChatTurn, ConversationKey, InboundMessage};
use relay_core::{RelayError, RelayResult};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of processing one burst.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedReply {
    pub key: String,
    pub reply: String,
    pub provider: String,
    pub model: String,
    pub message_id: String,
    pub batch_size: usize,
}

/// Processes one flushed burst end to end.
pub struct ConversationProcessor {
    directory: Arc<AgentDirectory>,
    history: Arc<HistoryCache>,
    model: Arc<dyn LanguageModel>,
    messenger: Arc<dyn OutboundMessenger>,
    prompts: PromptBuilder,
    temperature: f32,
    max_tokens: u32,
}

impl ConversationProcessor {
    pub fn new(
        directory: Arc<AgentDirectory>,
        history: Arc<HistoryCache>,
        model: Arc<dyn LanguageModel>,
        messenger: Arc<dyn OutboundMessenger>,
        llm: &LlmConfig,
    ) -> Self {
        Self {
            directory,
            history,
            model,
            messenger,
            prompts: PromptBuilder::new(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
        }
    }

    /// Run the reply pipeline for a burst of messages.
    pub async fn process(
        &self,
        key: &ConversationKey,
        batch: Vec<InboundMessage>,
    ) -> RelayResult<ProcessedReply> {
        let start = Instant::now();
        let cache_key = key.to_string();

        let burst = combine_burst(&batch);
        if burst.is_empty() {
            return Err(RelayError::Validation(format!(
                "burst for '{cache_key}' carries no text"
            )));
        }

        let profile = self.directory.get_active(&key.agent_id)?;
        if profile.organization_id != key.organization_id {
            return Err(RelayError::AgentNotFound(format!(
                "agent '{}' does not belong to organization '{}'",
                key.agent_id, key.organization_id
            )));
        }

        let history = self.history.history(&cache_key);
        let messages = self.prompts.build(
            &profile,
            contact_name(&batch),
            &history,
            &burst,
            Utc::now(),
        );
        debug!(
            key = %cache_key,
            history_turns = history.len(),
            batch_size = batch.len(),
            "Prompt built"
        );

        let request = CompletionRequest {
            messages,
            model: profile.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let llm_start = Instant::now();
        let completion = self.model.complete(&request).await?;
        metrics::histogram!("llm.latency_ms").record(llm_start.elapsed().as_millis() as f64);

        // Non-fatal: the reply is still delivered.
        if let Err(e) = self.history.append(
            &cache_key,
            vec![
                ChatTurn::user(burst),
                ChatTurn::assistant(completion.content.clone()),
            ],
        ) {
            warn!(key = %cache_key, error = %e, "Conversation turns not recorded");
        }

        let message_id = self
            .messenger
            .send_text(&profile.instance, &key.sender, &completion.content)
            .await?;

        metrics::counter!("conversations.replies").increment(1);
        metrics::histogram!("conversations.total_latency_ms")
            .record(start.elapsed().as_millis() as f64);
        info!(
            key = %cache_key,
            provider = %completion.provider,
            model = %completion.model,
            channel = self.messenger.channel_name(),
            batch_size = batch.len(),
            reply_len = completion.content.len(),
            "Reply delivered"
        );

        Ok(ProcessedReply {
            key: cache_key,
            reply: completion.content,
            provider: completion.provider,
            model: completion.model,
            message_id,
            batch_size: batch.len(),
        })
    }

    /// Adapt this processor to the accumulator's flush callback.
    pub fn flush_callback(self: &Arc<Self>) -> FlushCallback<InboundMessage> {
        let processor = self.clone();
        flush_callback(move |key: String, batch: Vec<InboundMessage>| {
            let processor = processor.clone();
            async move {
                let key: ConversationKey = key.parse()?;
                processor.process(&key, batch).await.map(|_| ())
            }
        })
    }
}
