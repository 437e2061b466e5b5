//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Convo Relay API",
        version = "0.1.0",
        description = "WhatsApp conversation relay.\n\nBuffers bursts of inbound messages per conversation and answers each burst with one language model reply.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Webhook", description = "Evolution API webhook ingress"),
        (name = "Agents", description = "Agent registry"),
        (name = "Buffers", description = "Pending message buffers"),
        (name = "Cache", description = "Conversation history cache"),
        (name = "Operations", description = "Health, readiness and liveness checks"),
    ),
    paths(
        crate::rest::handle_webhook,
        crate::rest::list_agents,
        crate::rest::upsert_agent,
        crate::rest::list_accumulators,
        crate::rest::clear_accumulator,
        crate::rest::clear_cache,
        crate::rest::clear_conversation,
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        // Webhook payload
        relay_channels::whatsapp::EvolutionWebhook,
        relay_channels::whatsapp::EvolutionMessageData,
        relay_channels::whatsapp::EvolutionMessageKey,
        relay_channels::whatsapp::EvolutionMessageContent,
        relay_channels::whatsapp::TextBody,
        relay_channels::whatsapp::CaptionBody,
        // Domain types
        relay_core::types::AgentProfile,
        relay_agents::AccumulatorSnapshot,
        relay_cache::CacheStatus,
        // REST types
        crate::rest::ErrorResponse,
        crate::rest::WebhookResponse,
        crate::rest::HealthResponse,
        crate::rest::ClearResponse,
    ))
)]
pub struct ApiDoc;
