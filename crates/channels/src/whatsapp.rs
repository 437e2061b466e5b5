//! WhatsApp integration through the Evolution API: inbound webhook payloads
//! and outbound text replies.

use futures_util::future::BoxFuture;
use relay_core::config::EvolutionConfig;
use relay_core::types::InboundMessage;
use relay_core::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

/// Evolution API webhook envelope.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EvolutionWebhook {
    pub event: String,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub data: Option<EvolutionMessageData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionMessageData {
    pub key: EvolutionMessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub message: Option<EvolutionMessageContent>,
    #[serde(default)]
    pub message_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionMessageKey {
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionMessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<TextBody>,
    #[serde(default)]
    pub image_message: Option<CaptionBody>,
    #[serde(default)]
    pub video_message: Option<CaptionBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TextBody {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CaptionBody {
    #[serde(default)]
    pub caption: Option<String>,
}

impl EvolutionMessageContent {
    /// First non-blank text carried by the message, if any.
    pub fn text(&self) -> Option<&str> {
        self.conversation
            .as_deref()
            .or_else(|| {
                self.extended_text_message
                    .as_ref()
                    .and_then(|m| m.text.as_deref())
            })
            .or_else(|| self.image_message.as_ref().and_then(|m| m.caption.as_deref()))
            .or_else(|| self.video_message.as_ref().and_then(|m| m.caption.as_deref()))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Why a webhook event was acknowledged without buffering anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnsupportedEvent,
    MissingData,
    FromMe,
    GroupChat,
    StatusBroadcast,
    InvalidSender,
    NoText,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UnsupportedEvent => "unsupported_event",
            SkipReason::MissingData => "missing_data",
            SkipReason::FromMe => "from_me",
            SkipReason::GroupChat => "group_chat",
            SkipReason::StatusBroadcast => "status_broadcast",
            SkipReason::InvalidSender => "invalid_sender",
            SkipReason::NoText => "no_text",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_message_upsert(event: &str) -> bool {
    event.trim().to_ascii_lowercase().replace('_', ".") == "messages.upsert"
}

/// Turn an Evolution webhook into an inbound message, or explain why it
/// should be ignored.
pub fn extract_inbound(webhook: &EvolutionWebhook) -> Result<InboundMessage, SkipReason> {
    if !is_message_upsert(&webhook.event) {
        return Err(SkipReason::UnsupportedEvent);
    }
    let data = webhook.data.as_ref().ok_or(SkipReason::MissingData)?;

    if data.key.from_me {
        return Err(SkipReason::FromMe);
    }
    let jid = data.key.remote_jid.as_str();
    if jid.ends_with("@g.us") {
        return Err(SkipReason::GroupChat);
    }
    if jid.starts_with("status@") {
        return Err(SkipReason::StatusBroadcast);
    }
    let sender = phone_from_jid(jid).ok_or(SkipReason::InvalidSender)?;

    let text = data
        .message
        .as_ref()
        .and_then(|m| m.text())
        .ok_or(SkipReason::NoText)?;

    let mut inbound = InboundMessage::new(sender, text);
    inbound.external_id = data.key.id.clone();
    inbound.sender_name = data
        .push_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Ok(inbound)
}

/// Strip everything but digits; valid international numbers have 8-15.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (8..=15).contains(&digits.len()).then_some(digits)
}

/// Extract the phone number from a `5511999990000@s.whatsapp.net` JID.
/// Device suffixes (`:12`) are dropped.
pub fn phone_from_jid(jid: &str) -> Option<String> {
    let user = jid.split('@').next()?;
    let user = user.split(':').next()?;
    normalize_phone(user)
}

/// Outbound messaging provider used to deliver replies.
pub trait OutboundMessenger: Send + Sync {
    /// Send a text message and return the provider's message id.
    fn send_text<'a>(
        &'a self,
        instance: &'a str,
        to: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, RelayResult<String>>;

    /// Channel name for metrics/logging.
    fn channel_name(&self) -> &str;
}

/// Evolution API client for WhatsApp text replies.
pub struct EvolutionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EvolutionClient {
    pub fn new(config: &EvolutionConfig) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RelayError::Config(format!("evolution http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn send_text_url(&self, instance: &str) -> String {
        format!("{}/message/sendText/{}", self.base_url, instance)
    }
}

impl OutboundMessenger for EvolutionClient {
    fn send_text<'a>(
        &'a self,
        instance: &'a str,
        to: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, RelayResult<String>> {
        Box::pin(async move {
            let to = normalize_phone(to)
                .ok_or_else(|| RelayError::Validation(format!("invalid recipient '{to}'")))?;

            tracing::info!(
                instance = instance,
                to = %to,
                body_len = text.len(),
                "Sending WhatsApp text message"
            );

            let response = self
                .http
                .post(self.send_text_url(instance))
                .header("apikey", &self.api_key)
                .json(&json!({ "number": to, "text": text }))
                .send()
                .await
                .map_err(|e| RelayError::Delivery(format!("evolution request failed: {e}")))?;

            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if !status.is_success() {
                metrics::counter!("whatsapp.send_errors").increment(1);
                let snippet: String = body.chars().take(500).collect();
                return Err(RelayError::Delivery(format!(
                    "evolution sendText {status}: {snippet}"
                )));
            }

            metrics::counter!("whatsapp.sent").increment(1);
            let message_id = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["key"]["id"].as_str().map(str::to_string))
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            Ok(message_id)
        })
    }

    fn channel_name(&self) -> &str {
        "whatsapp"
    }
}
