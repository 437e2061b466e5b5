use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// A single inbound chat message as received from a channel webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct InboundMessage {
    pub id: Uuid,
    /// Provider-side message id, when the channel supplies one.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Normalized sender phone (digits only).
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: None,
            sender: sender.into(),
            sender_name: None,
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }
}

/// Identifies one logical conversation: tenant + agent + remote sender.
///
/// Rendered as `organization:agent:sender`, which is also the accumulator
/// and history-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct ConversationKey {
    pub organization_id: String,
    pub agent_id: String,
    pub sender: String,
}

impl ConversationKey {
    pub fn new(
        organization_id: impl Into<String>,
        agent_id: impl Into<String>,
        sender: impl Into<String>,
    ) -> RelayResult<Self> {
        let key = Self {
            organization_id: organization_id.into(),
            agent_id: agent_id.into(),
            sender: sender.into(),
        };
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> RelayResult<()> {
        for (name, part) in [
            ("organization_id", &self.organization_id),
            ("agent_id", &self.agent_id),
            ("sender", &self.sender),
        ] {
            if part.trim().is_empty() {
                return Err(RelayError::Validation(format!("{name} must not be empty")));
            }
            if part.contains(':') {
                return Err(RelayError::Validation(format!(
                    "{name} must not contain ':'"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.organization_id, self.agent_id, self.sender)
    }
}

impl FromStr for ConversationKey {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(org), Some(agent), Some(sender)) => Self::new(org, agent, sender),
            _ => Err(RelayError::Validation(format!(
                "conversation key '{s}' is not of the form org:agent:sender"
            ))),
        }
    }
}

/// Per-agent configuration: which tenant it belongs to, how it talks, and
/// which WhatsApp instance it replies through.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentProfile {
    pub agent_id: String,
    pub organization_id: String,
    pub name: String,
    #[serde(default)]
    pub organization_name: Option<String>,
    /// System prompt with `{{variable}}` placeholders. Empty means the
    /// built-in default prompt is used.
    #[serde(default)]
    pub system_prompt: String,
    /// Evolution API instance used for outbound replies.
    pub instance: String,
    /// Per-agent model override for the primary provider.
    #[serde(default)]
    pub model: Option<String>,
    /// Debounce window override in milliseconds.
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One turn of a stored conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_key_display_and_parse() {
        let key = ConversationKey::new("org-1", "agent-7", "5511999990000").unwrap();
        assert_eq!(key.to_string(), "org-1:agent-7:5511999990000");

        let parsed: ConversationKey = "org-1:agent-7:5511999990000".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_conversation_key_rejects_bad_parts() {
        assert!(ConversationKey::new("", "agent", "123").is_err());
        assert!(ConversationKey::new("org", "a:b", "123").is_err());
        assert!("org:agent".parse::<ConversationKey>().is_err());
    }

    #[test]
    fn test_agent_profile_defaults() {
        let profile: AgentProfile = serde_json::from_value(serde_json::json!({
            "agent_id": "agent-1",
            "organization_id": "org-1",
            "name": "Ana",
            "instance": "sales"
        }))
        .unwrap();
        assert!(profile.active);
        assert!(profile.system_prompt.is_empty());
        assert!(profile.window_ms.is_none());
    }
}
