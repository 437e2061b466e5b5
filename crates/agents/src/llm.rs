//! Hosted language model providers and the primary/secondary fallback chain.

use futures_util::future::BoxFuture;
use relay_core::config::{LlmConfig, LlmProviderConfig};
use relay_core::llm::{Completion, CompletionRequest, LanguageModel, LlmError};
use relay_core::{RelayError, RelayResult};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// OpenAI-compatible chat completions client (OpenAI, Groq, OpenRouter,
/// local gateways).
pub struct HostedModel {
    http: reqwest::Client,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HostedModel {
    pub fn new(config: &LlmProviderConfig) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RelayError::Config(format!("llm http client: {e}")))?;
        Ok(Self {
            http,
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

fn parse_completion(body: &str) -> Result<String, LlmError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::InvalidResponse(format!("malformed completion: {e}")))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| LlmError::InvalidResponse("completion has no content".to_string()))
}

impl LanguageModel for HostedModel {
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<Completion, LlmError>> {
        Box::pin(async move {
            let body = self.request_body(request);
            let model = body["model"].as_str().unwrap_or(&self.model).to_string();
            debug!(
                provider = %self.name,
                model = %model,
                messages = request.messages.len(),
                "Requesting completion"
            );

            let response = self
                .http
                .post(self.completions_url())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        LlmError::Timeout(e.to_string())
                    } else {
                        LlmError::Transport(e.to_string())
                    }
                })?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| LlmError::Transport(e.to_string()))?;
            if !status.is_success() {
                return Err(LlmError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(500).collect(),
                });
            }

            Ok(Completion {
                content: parse_completion(&text)?,
                provider: self.name.clone(),
                model,
            })
        })
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

/// Tries each provider in order and returns the first success.
///
/// A per-agent model override only applies to the first provider; the
/// others use their own configured model.
pub struct FallbackModel {
    providers: Vec<Arc<dyn LanguageModel>>,
}

impl FallbackModel {
    pub fn new(providers: Vec<Arc<dyn LanguageModel>>) -> Self {
        Self { providers }
    }
}

impl LanguageModel for FallbackModel {
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<Completion, LlmError>> {
        Box::pin(async move {
            let mut errors = Vec::new();
            for (i, provider) in self.providers.iter().enumerate() {
                let result = if i == 0 {
                    provider.complete(request).await
                } else {
                    let mut secondary = request.clone();
                    secondary.model = None;
                    provider.complete(&secondary).await
                };

                match result {
                    Ok(completion) => {
                        if i > 0 {
                            metrics::counter!(
                                "llm.fallback_used",
                                "provider" => provider.provider_name().to_string()
                            )
                            .increment(1);
                        }
                        return Ok(completion);
                    }
                    Err(e) => {
                        metrics::counter!(
                            "llm.provider_errors",
                            "provider" => provider.provider_name().to_string()
                        )
                        .increment(1);
                        warn!(
                            provider = provider.provider_name(),
                            error = %e,
                            remaining = self.providers.len() - i - 1,
                            "Language model call failed"
                        );
                        errors.push(format!("{}: {e}", provider.provider_name()));
                    }
                }
            }
            Err(LlmError::Exhausted(errors))
        })
    }

    fn provider_name(&self) -> &str {
        "fallback"
    }
}

/// Build the configured model: the primary provider, wrapped in a
/// [`FallbackModel`] when a secondary is configured.
pub fn build_language_model(config: &LlmConfig) -> RelayResult<Arc<dyn LanguageModel>> {
    let primary: Arc<dyn LanguageModel> = Arc::new(HostedModel::new(&config.primary)?);
    match &config.fallback {
        Some(fallback) => {
            let secondary: Arc<dyn LanguageModel> = Arc::new(HostedModel::new(fallback)?);
            Ok(Arc::new(FallbackModel::new(vec![primary, secondary])))
        }
        None => Ok(primary),
    }
}
