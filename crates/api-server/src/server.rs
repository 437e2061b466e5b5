//! API server: builds the REST router and runs the HTTP and metrics listeners.

use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use axum::routing::{delete, get, post, put};
use axum::Router;
use relay_agents::{AgentDirectory, ConversationProcessor, MessageAccumulator};
use relay_cache::HistoryCache;
use relay_core::config::AppConfig;
use relay_core::types::InboundMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Build the application router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        // WhatsApp ingress
        .route("/v1/agents/webhook/:agent_id", post(rest::handle_webhook))
        // Agent registry
        .route("/v1/agents", get(rest::list_agents))
        .route("/v1/agents/:agent_id", put(rest::upsert_agent))
        // Buffers and history
        .route("/v1/accumulators", get(rest::list_accumulators))
        .route("/v1/accumulators/:key", delete(rest::clear_accumulator))
        .route("/v1/cache", delete(rest::clear_cache))
        .route("/v1/cache/:key", delete(rest::clear_conversation))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main API server.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        accumulator: MessageAccumulator<InboundMessage>,
        processor: Arc<ConversationProcessor>,
        directory: Arc<AgentDirectory>,
        history: Arc<HistoryCache>,
    ) -> Self {
        let state = AppState {
            accumulator,
            on_flush: processor.flush_callback(),
            directory,
            history,
            default_window: config.accumulator.window(),
            webhook_token: config.api.webhook_token.clone(),
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
        };
        Self { config, state }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the Prometheus exporter on its own port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
