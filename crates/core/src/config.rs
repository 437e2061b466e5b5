use crate::types::AgentProfile;
use serde::Deserialize;
use std::time::Duration;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CONVO_RELAY__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub accumulator: AccumulatorConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Agents registered at startup. More can be added over REST.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Shared secret expected in the `x-webhook-token` header. Unset
    /// disables the check.
    #[serde(default)]
    pub webhook_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccumulatorConfig {
    /// Quiet period after the last message before a burst is flushed.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Re-check delay when a deadline fires while a flush is in flight.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound on how long a burst may keep buffering. 0 disables it.
    #[serde(default)]
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_history_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub primary: LlmProviderConfig,
    /// Secondary provider tried when the primary fails.
    #[serde(default)]
    pub fallback: Option<LlmProviderConfig>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default = "default_evolution_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_evolution_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Lower bound for `accumulator.retry_delay_ms`.
pub const MIN_RETRY_DELAY_MS: u64 = 10;

// Default functions
fn default_node_id() -> String {
    "relay-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_window_ms() -> u64 {
    3000
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_max_turns() -> usize {
    20
}
fn default_history_ttl_secs() -> u64 {
    3600
}
fn default_max_conversations() -> usize {
    100_000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    512
}
fn default_provider_name() -> String {
    "openai".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_ms() -> u64 {
    30_000
}
fn default_evolution_url() -> String {
    "http://localhost:8081".to_string()
}
fn default_evolution_timeout_ms() -> u64 {
    10_000
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            webhook_token: None,
        }
    }
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            max_wait_ms: 0,
        }
    }
}

impl AccumulatorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_ms > 0).then(|| Duration::from_millis(self.max_wait_ms))
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            ttl_secs: default_history_ttl_secs(),
            max_conversations: default_max_conversations(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary: LlmProviderConfig::default(),
            fallback: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            timeout_ms: default_llm_timeout_ms(),
        }
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            base_url: default_evolution_url(),
            api_key: String::new(),
            timeout_ms: default_evolution_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            accumulator: AccumulatorConfig::default(),
            history: HistoryConfig::default(),
            llm: LlmConfig::default(),
            evolution: EvolutionConfig::default(),
            metrics: MetricsConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then environment
    /// variables (which take precedence).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        Self::load_from(path, Self::environment())
    }

    /// `CONVO_RELAY__SECTION__KEY` variables. Values are parsed as numbers
    /// or booleans where they look like one; nothing is split into lists.
    fn environment() -> config::Environment {
        config::Environment::with_prefix("CONVO_RELAY")
            .separator("__")
            .try_parsing(true)
    }

    fn load_from(
        path: Option<&str>,
        environment: config::Environment,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let config: AppConfig = builder.add_source(environment).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the accumulator spin or never wait.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.accumulator.window_ms == 0 {
            return Err(config::ConfigError::Message(
                "accumulator.window_ms must be greater than zero".to_string(),
            ));
        }
        if self.accumulator.retry_delay_ms < MIN_RETRY_DELAY_MS {
            return Err(config::ConfigError::Message(format!(
                "accumulator.retry_delay_ms must be at least {MIN_RETRY_DELAY_MS}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.api.http_port, 8080);
        assert_eq!(config.accumulator.window(), Duration::from_millis(3000));
        assert_eq!(config.accumulator.retry_delay(), Duration::from_millis(500));
        assert!(config.accumulator.max_wait().is_none());
        assert!(config.llm.fallback.is_none());
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            node_id = "relay-test"

            [accumulator]
            window_ms = 1500
            max_wait_ms = 20000

            [llm.fallback]
            name = "groq"
            base_url = "https://api.groq.com/openai/v1"
            model = "llama-3.1-8b-instant"

            [[agents]]
            agent_id = "agent-1"
            organization_id = "org-1"
            name = "Ana"
            instance = "sales"
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.node_id, "relay-test");
        assert_eq!(config.accumulator.window_ms, 1500);
        assert_eq!(config.accumulator.retry_delay_ms, 500);
        assert_eq!(
            config.accumulator.max_wait(),
            Some(Duration::from_millis(20_000))
        );
        let fallback = config.llm.fallback.unwrap();
        assert_eq!(fallback.name, "groq");
        assert_eq!(fallback.timeout_ms, 30_000);
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].instance, "sales");
    }

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let source: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::environment().source(Some(source))
    }

    #[test]
    fn test_env_overrides_strings_and_numbers() {
        let config = AppConfig::load_from(
            None,
            env(&[
                ("CONVO_RELAY__NODE_ID", "relay-eu-1"),
                ("CONVO_RELAY__LLM__PRIMARY__API_KEY", "sk-secret"),
                ("CONVO_RELAY__API__WEBHOOK_TOKEN", "s3cret,with,commas"),
                ("CONVO_RELAY__EVOLUTION__BASE_URL", "https://evo.example.com"),
                ("CONVO_RELAY__API__HTTP_PORT", "9000"),
                ("CONVO_RELAY__ACCUMULATOR__WINDOW_MS", "1200"),
            ]),
        )
        .unwrap();

        assert_eq!(config.node_id, "relay-eu-1");
        assert_eq!(config.llm.primary.api_key, "sk-secret");
        assert_eq!(config.api.webhook_token.as_deref(), Some("s3cret,with,commas"));
        assert_eq!(config.evolution.base_url, "https://evo.example.com");
        assert_eq!(config.api.http_port, 9000);
        assert_eq!(config.accumulator.window_ms, 1200);
    }

    #[test]
    fn test_zero_retry_delay_and_window_rejected() {
        let err = AppConfig::load_from(
            None,
            env(&[("CONVO_RELAY__ACCUMULATOR__RETRY_DELAY_MS", "0")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry_delay_ms"));

        let err = AppConfig::load_from(
            None,
            env(&[("CONVO_RELAY__ACCUMULATOR__WINDOW_MS", "0")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("window_ms"));

        assert!(AppConfig::default().validate().is_ok());
    }
}
