#![warn(clippy::unwrap_used)]

pub mod whatsapp;

pub use whatsapp::{extract_inbound, EvolutionClient, EvolutionWebhook, OutboundMessenger, SkipReason};
