//! Convo Relay: WhatsApp conversation relay with per-conversation debouncing.
//!
//! Main entry point that wires the agent directory, history cache, language
//! model, messenger and accumulator together and starts the server.

use clap::Parser;
use relay_agents::{build_language_model, AgentDirectory, ConversationProcessor, MessageAccumulator};
use relay_api::ApiServer;
use relay_cache::HistoryCache;
use relay_channels::EvolutionClient;
use relay_core::config::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "convo-relay")]
#[command(about = "WhatsApp conversation relay with burst debouncing")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short, env = "CONVO_RELAY_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CONVO_RELAY__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CONVO_RELAY__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Default debounce window in milliseconds (overrides config)
    #[arg(long, env = "CONVO_RELAY__ACCUMULATOR__WINDOW_MS")]
    window_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "convo_relay=info,relay_agents=info,relay_api=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Convo Relay starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load config");
        e
    })?;

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(window_ms) = cli.window_ms {
        config.accumulator.window_ms = window_ms;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        window_ms = config.accumulator.window_ms,
        agents = config.agents.len(),
        fallback = config.llm.fallback.is_some(),
        "Configuration loaded"
    );
    if config.api.webhook_token.is_none() {
        warn!("No webhook token configured; webhook endpoint is unauthenticated");
    }

    let directory = Arc::new(AgentDirectory::from_profiles(config.agents.clone())?);
    let history = Arc::new(HistoryCache::from_config(&config.history));
    let model = build_language_model(&config.llm)?;
    let messenger = Arc::new(EvolutionClient::new(&config.evolution)?);

    let processor = Arc::new(ConversationProcessor::new(
        directory.clone(),
        history.clone(),
        model,
        messenger,
        &config.llm,
    ));
    let accumulator = MessageAccumulator::from_config(&config.accumulator);

    let api_server = ApiServer::new(
        config.clone(),
        accumulator,
        processor,
        directory,
        history.clone(),
    );

    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // History eviction
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = history.evict_expired();
            if evicted > 0 {
                debug!(evicted, "Expired conversation history evicted");
            }
        }
    });

    info!("Convo Relay is ready to serve traffic");

    api_server.start_http().await?;

    Ok(())
}
