//! REST API handlers for the WhatsApp webhook and operational endpoints.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use relay_agents::{AccumulatorSnapshot, AgentDirectory, FlushCallback, MessageAccumulator};
use relay_cache::{CacheStatus, HistoryCache};
use relay_channels::{extract_inbound, EvolutionWebhook};
use relay_core::types::{AgentProfile, ConversationKey, InboundMessage};
use relay_core::RelayError;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

/// Header carrying the shared webhook secret.
pub const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub accumulator: MessageAccumulator<InboundMessage>,
    pub on_flush: FlushCallback<InboundMessage>,
    pub directory: Arc<AgentDirectory>,
    pub history: Arc<HistoryCache>,
    pub default_window: Duration,
    pub webhook_token: Option<String>,
    pub node_id: String,
    pub start_time: Instant,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

fn relay_error(err: RelayError) -> ApiError {
    match err {
        RelayError::AgentNotFound(msg) => api_error(StatusCode::NOT_FOUND, "agent_not_found", msg),
        RelayError::Validation(msg) => api_error(StatusCode::BAD_REQUEST, "invalid_request", msg),
        other => {
            error!(error = %other, "Request failed");
            metrics::counter!("api.errors").increment(1);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal processing error",
            )
        }
    }
}

fn token_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(WEBHOOK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

/// POST /v1/agents/webhook/:agent_id: Evolution API webhook receiver.
#[utoipa::path(
    post,
    path = "/v1/agents/webhook/{agent_id}",
    tag = "Webhook",
    params(("agent_id" = String, Path, description = "Agent receiving the message")),
    request_body = EvolutionWebhook,
    responses(
        (status = 202, description = "Message buffered", body = WebhookResponse),
        (status = 200, description = "Event ignored", body = WebhookResponse),
        (status = 401, description = "Missing or wrong webhook token", body = ErrorResponse),
        (status = 404, description = "Unknown or inactive agent", body = ErrorResponse),
    )
)]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(webhook): Json<EvolutionWebhook>,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    if let Some(expected) = state.webhook_token.as_deref() {
        if !token_matches(&headers, expected) {
            warn!(agent_id = %agent_id, "Webhook rejected: bad token");
            metrics::counter!("webhook.unauthorized").increment(1);
            return Err(api_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid webhook token",
            ));
        }
    }

    let profile = state.directory.get_active(&agent_id).map_err(relay_error)?;

    let inbound = match extract_inbound(&webhook) {
        Ok(inbound) => inbound,
        Err(reason) => {
            debug!(agent_id = %agent_id, event = %webhook.event, reason = %reason, "Webhook ignored");
            metrics::counter!("webhook.ignored", "reason" => reason.as_str()).increment(1);
            return Ok((
                StatusCode::OK,
                Json(WebhookResponse {
                    status: "ignored".to_string(),
                    key: None,
                    reason: Some(reason.as_str().to_string()),
                }),
            ));
        }
    };

    if let Some(instance) = webhook.instance.as_deref() {
        if instance != profile.instance {
            warn!(
                agent_id = %agent_id,
                expected = %profile.instance,
                received = %instance,
                "Webhook instance differs from agent configuration"
            );
        }
    }

    let key = ConversationKey::new(
        profile.organization_id.clone(),
        profile.agent_id.clone(),
        inbound.sender.clone(),
    )
    .map_err(relay_error)?
    .to_string();
    let window = profile
        .window_ms
        .map(Duration::from_millis)
        .unwrap_or(state.default_window);

    state
        .accumulator
        .add_message(&key, inbound, window, state.on_flush.clone())
        .map_err(relay_error)?;
    metrics::counter!("webhook.buffered").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            status: "buffered".to_string(),
            key: Some(key),
            reason: None,
        }),
    ))
}

/// GET /health: Health check endpoint with buffer and cache state.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service health", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let accumulators = state.accumulator.get_all_accumulators();
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        agents: state.directory.len(),
        active_buffers: accumulators.len(),
        accumulators,
        cache: state.history.status(),
    })
}

/// GET /ready: Readiness check. Ready once at least one agent is registered.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses(
        (status = 200, description = "Ready"),
        (status = 503, description = "No agents registered"),
    )
)]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.directory.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// GET /live: Liveness check.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /v1/accumulators: List pending buffers.
#[utoipa::path(
    get,
    path = "/v1/accumulators",
    tag = "Buffers",
    responses((status = 200, description = "Pending buffers", body = [AccumulatorSnapshot]))
)]
pub async fn list_accumulators(State(state): State<AppState>) -> Json<Vec<AccumulatorSnapshot>> {
    Json(state.accumulator.get_all_accumulators())
}

/// DELETE /v1/accumulators/:key: Drop a pending buffer without flushing it.
#[utoipa::path(
    delete,
    path = "/v1/accumulators/{key}",
    tag = "Buffers",
    params(("key" = String, Path, description = "Conversation key org:agent:phone")),
    responses(
        (status = 200, description = "Buffer discarded", body = ClearResponse),
        (status = 404, description = "No buffer for key", body = ErrorResponse),
    )
)]
pub async fn clear_accumulator(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    if !state.accumulator.clear_accumulator(&key) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "buffer_not_found",
            format!("no pending buffer for '{key}'"),
        ));
    }
    info!(key = %key, "Buffer discarded via API");
    Ok(Json(ClearResponse {
        key: Some(key),
        history_cleared: 0,
        accumulator_cleared: true,
    }))
}

/// DELETE /v1/cache: Forget every conversation's history.
#[utoipa::path(
    delete,
    path = "/v1/cache",
    tag = "Cache",
    responses((status = 200, description = "History cleared", body = ClearResponse))
)]
pub async fn clear_cache(State(state): State<AppState>) -> Json<ClearResponse> {
    let removed = state.history.clear_all();
    info!(removed, "History cache cleared via API");
    Json(ClearResponse {
        key: None,
        history_cleared: removed,
        accumulator_cleared: false,
    })
}

/// DELETE /v1/cache/:key: Reset one conversation: history and pending buffer.
#[utoipa::path(
    delete,
    path = "/v1/cache/{key}",
    tag = "Cache",
    params(("key" = String, Path, description = "Conversation key org:agent:phone")),
    responses(
        (status = 200, description = "Conversation reset", body = ClearResponse),
        (status = 400, description = "Malformed key", body = ErrorResponse),
    )
)]
pub async fn clear_conversation(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    key.parse::<ConversationKey>().map_err(relay_error)?;
    let history_cleared = usize::from(state.history.clear(&key));
    let accumulator_cleared = state.accumulator.clear_accumulator(&key);
    info!(key = %key, history_cleared, accumulator_cleared, "Conversation reset via API");
    Ok(Json(ClearResponse {
        key: Some(key),
        history_cleared,
        accumulator_cleared,
    }))
}

/// GET /v1/agents: List registered agents.
#[utoipa::path(
    get,
    path = "/v1/agents",
    tag = "Agents",
    responses((status = 200, description = "Registered agents", body = [AgentProfile]))
)]
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentProfile>> {
    Json(state.directory.list())
}

/// PUT /v1/agents/:agent_id: Register or replace an agent.
#[utoipa::path(
    put,
    path = "/v1/agents/{agent_id}",
    tag = "Agents",
    params(("agent_id" = String, Path, description = "Agent id")),
    request_body = AgentProfile,
    responses(
        (status = 201, description = "Agent created", body = AgentProfile),
        (status = 200, description = "Agent replaced", body = AgentProfile),
        (status = 400, description = "Invalid profile", body = ErrorResponse),
    )
)]
pub async fn upsert_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(mut profile): Json<AgentProfile>,
) -> Result<(StatusCode, Json<AgentProfile>), ApiError> {
    profile.agent_id = agent_id;
    let previous = state
        .directory
        .upsert(profile.clone())
        .map_err(relay_error)?;
    let status = if previous.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(profile)))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub agents: usize,
    pub active_buffers: usize,
    pub accumulators: Vec<AccumulatorSnapshot>,
    pub cache: CacheStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub history_cleared: usize,
    pub accumulator_cleared: bool,
}
