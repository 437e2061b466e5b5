//! Prompt construction for agent replies using `{{variable}}` templates.

use chrono::{DateTime, Utc};
use relay_core::llm::PromptMessage;
use relay_core::types::{AgentProfile, ChatRole, ChatTurn, InboundMessage};
use std::collections::HashMap;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are {{agent_name}}, the WhatsApp assistant for {{organization}}.\n\
Reply in the customer's language. Keep answers short and conversational, one or two paragraphs at most.\n\
Never invent prices, availability or policies; say you will check with the team instead.\n\
The customer's name is {{contact_name}}. Current time: {{now}}.";

/// Builds the message list sent to the language model.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    default_template: String,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            default_template: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_default_template(template: impl Into<String>) -> Self {
        Self {
            default_template: template.into(),
        }
    }

    /// Render the agent's system prompt, or the default when the agent has none.
    pub fn system_prompt(
        &self,
        profile: &AgentProfile,
        contact_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> String {
        let template = if profile.system_prompt.trim().is_empty() {
            self.default_template.as_str()
        } else {
            profile.system_prompt.as_str()
        };

        let mut variables = HashMap::new();
        variables.insert("agent_name", profile.name.clone());
        variables.insert(
            "organization",
            profile
                .organization_name
                .clone()
                .unwrap_or_else(|| profile.organization_id.clone()),
        );
        variables.insert(
            "contact_name",
            contact_name.unwrap_or("not provided").to_string(),
        );
        variables.insert("now", now.format("%Y-%m-%d %H:%M UTC").to_string());

        substitute(template, &variables)
    }

    /// System prompt, prior turns (oldest first), then the new burst as a
    /// single user message.
    pub fn build(
        &self,
        profile: &AgentProfile,
        contact_name: Option<&str>,
        history: &[ChatTurn],
        burst: &str,
        now: DateTime<Utc>,
    ) -> Vec<PromptMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(PromptMessage::new(
            ChatRole::System,
            self.system_prompt(profile, contact_name, now),
        ));
        messages.extend(
            history
                .iter()
                .filter(|turn| turn.role != ChatRole::System)
                .map(|turn| PromptMessage::new(turn.role, turn.content.clone())),
        );
        messages.push(PromptMessage::new(ChatRole::User, burst));
        messages
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Single pass over the template. Substituted values are never re-scanned,
/// so placeholders inside names or other user text stay literal.
fn substitute(template: &str, variables: &HashMap<&str, String>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        result.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            result.push_str(&rest[open..]);
            return result;
        };
        let name = after[..close].trim();
        match variables.get(name) {
            Some(value) => result.push_str(value),
            None => result.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after[close + 2..];
    }
    result.push_str(rest);
    result
}

/// Join a burst into one user message, in arrival order.
pub fn combine_burst(batch: &[InboundMessage]) -> String {
    batch
        .iter()
        .map(|m| m.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The most recent display name the sender used in this burst.
pub fn contact_name(batch: &[InboundMessage]) -> Option<&str> {
    batch.iter().rev().find_map(|m| m.sender_name.as_deref())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn profile(system_prompt: &str) -> AgentProfile {
        AgentProfile {
            agent_id: "agent-1".to_string(),
            organization_id: "org-1".to_string(),
            name: "Ana".to_string(),
            organization_name: Some("Acme".to_string()),
            system_prompt: system_prompt.to_string(),
            instance: "sales".to_string(),
            model: None,
            window_ms: None,
            active: true,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap()
    }

    #[test]
    fn test_custom_template_substitution() {
        let builder = PromptBuilder::new();
        let prompt = builder.system_prompt(
            &profile("Hi, I am {{agent_name}} from {{organization}}. {{unknown}} {{now}}"),
            None,
            fixed_now(),
        );
        assert_eq!(prompt, "Hi, I am Ana from Acme. {{unknown}} 2024-05-01 14:30 UTC");
    }

    #[test]
    fn test_default_template_used_when_empty() {
        let builder = PromptBuilder::new();
        let prompt = builder.system_prompt(&profile("  "), Some("Maria"), fixed_now());
        assert!(prompt.starts_with("You are Ana, the WhatsApp assistant for Acme."));
        assert!(prompt.contains("The customer's name is Maria."));
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        let builder = PromptBuilder::new();
        let mut agent = profile("{{agent_name}} talks to {{contact_name}} at {{now}}");
        agent.name = "{{contact_name}}".to_string();
        let prompt = builder.system_prompt(&agent, Some("{{now}}"), fixed_now());
        assert_eq!(
            prompt,
            "{{contact_name}} talks to {{now}} at 2024-05-01 14:30 UTC"
        );
    }

    #[test]
    fn test_unterminated_placeholder_kept() {
        let builder = PromptBuilder::new();
        let prompt = builder.system_prompt(&profile("Hi {{agent_name}} {{oops"), None, fixed_now());
        assert_eq!(prompt, "Hi Ana {{oops");
    }

    #[test]
    fn test_build_orders_history_then_burst() {
        let builder = PromptBuilder::with_default_template("sys");
        let history = vec![ChatTurn::user("first"), ChatTurn::assistant("answer")];
        let messages = builder.build(&profile(""), None, &history, "hi\nthere", fixed_now());

        let roles: Vec<ChatRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User]
        );
        assert_eq!(messages[0].content, "sys");
        assert_eq!(messages[3].content, "hi\nthere");
    }

    #[test]
    fn test_combine_burst_and_contact_name() {
        let batch = vec![
            InboundMessage::new("5511999990000", "hi").with_sender_name("Mari"),
            InboundMessage::new("5511999990000", "  "),
            InboundMessage::new("5511999990000", "is the flat still available?")
                .with_sender_name("Maria"),
        ];
        assert_eq!(combine_burst(&batch), "hi\nis the flat still available?");
        assert_eq!(contact_name(&batch), Some("Maria"));
        assert_eq!(contact_name(&batch[1..2]), None);
    }
}
