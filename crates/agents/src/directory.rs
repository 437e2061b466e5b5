//! Registry of configured agents, keyed by agent id.

use dashmap::DashMap;
use relay_core::types::AgentProfile;
use relay_core::{RelayError, RelayResult};
use tracing::info;

/// In-memory agent registry, seeded from configuration and updated over REST.
pub struct AgentDirectory {
    agents: DashMap<String, AgentProfile>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Build a directory from the configured seed list. Invalid profiles
    /// abort startup.
    pub fn from_profiles(profiles: Vec<AgentProfile>) -> RelayResult<Self> {
        let directory = Self::new();
        for profile in profiles {
            directory.upsert(profile)?;
        }
        Ok(directory)
    }

    /// Insert or replace an agent. Returns the previous profile, if any.
    pub fn upsert(&self, profile: AgentProfile) -> RelayResult<Option<AgentProfile>> {
        validate_profile(&profile)?;
        info!(
            agent_id = %profile.agent_id,
            organization_id = %profile.organization_id,
            instance = %profile.instance,
            active = profile.active,
            "Registering agent"
        );
        Ok(self.agents.insert(profile.agent_id.clone(), profile))
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.get(agent_id).map(|p| p.value().clone())
    }

    /// The agent's profile, provided it exists and is switched on.
    pub fn get_active(&self, agent_id: &str) -> RelayResult<AgentProfile> {
        match self.get(agent_id) {
            Some(profile) if profile.active => Ok(profile),
            Some(_) => Err(RelayError::AgentNotFound(format!(
                "agent '{agent_id}' is inactive"
            ))),
            None => Err(RelayError::AgentNotFound(format!(
                "agent '{agent_id}' is not registered"
            ))),
        }
    }

    /// All agents, sorted by id.
    pub fn list(&self) -> Vec<AgentProfile> {
        let mut agents: Vec<AgentProfile> =
            self.agents.iter().map(|p| p.value().clone()).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_profile(profile: &AgentProfile) -> RelayResult<()> {
    for (name, value) in [
        ("agent_id", &profile.agent_id),
        ("organization_id", &profile.organization_id),
        ("instance", &profile.instance),
    ] {
        if value.trim().is_empty() {
            return Err(RelayError::Validation(format!("{name} must not be empty")));
        }
    }
    // Both ids become part of the conversation key.
    if profile.agent_id.contains(':') || profile.organization_id.contains(':') {
        return Err(RelayError::Validation(
            "agent_id and organization_id must not contain ':'".to_string(),
        ));
    }
    if profile.window_ms == Some(0) {
        return Err(RelayError::Validation(
            "window_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
