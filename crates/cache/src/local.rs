//! In-process conversation history cache backed by DashMap.
//! Holds the most recent turns per conversation so the reply pipeline can
//! build prompts without a round trip to the persistent store.

use dashmap::DashMap;
use relay_core::config::HistoryConfig;
use relay_core::types::ChatTurn;
use relay_core::{RelayError, RelayResult};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use utoipa::ToSchema;

struct HistoryEntry {
    turns: Vec<ChatTurn>,
    updated_at: Instant,
}

/// Snapshot of cache occupancy for the health endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CacheStatus {
    pub entries: usize,
    pub max_entries: usize,
    pub max_turns: usize,
    pub ttl_secs: u64,
    /// Seconds since the least recently updated conversation was touched.
    pub oldest_age_secs: Option<u64>,
}

/// Lock-free history cache keyed by conversation key.
pub struct HistoryCache {
    store: DashMap<String, HistoryEntry>,
    ttl: Duration,
    max_entries: usize,
    max_turns: usize,
}

impl HistoryCache {
    pub fn new(ttl_secs: u64, max_entries: usize, max_turns: usize) -> Self {
        Self {
            store: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
            max_entries,
            max_turns,
        }
    }

    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::new(config.ttl_secs, config.max_conversations, config.max_turns)
    }

    /// Stored turns for a conversation, oldest first. Expired or missing
    /// conversations yield an empty history.
    pub fn history(&self, key: &str) -> Vec<ChatTurn> {
        let Some(entry) = self.store.get(key) else {
            return Vec::new();
        };
        if entry.updated_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(key);
            metrics::counter!("history.expired").increment(1);
            return Vec::new();
        }
        entry.turns.clone()
    }

    /// Append turns to a conversation, keeping only the newest `max_turns`.
    ///
    /// Fails with [`RelayError::History`] when the cache is full and `key`
    /// is a new conversation; nothing is stored in that case.
    pub fn append(&self, key: &str, turns: Vec<ChatTurn>) -> RelayResult<()> {
        if turns.is_empty() {
            return Ok(());
        }
        if self.store.len() >= self.max_entries && !self.store.contains_key(key) {
            debug!(key = key, "History cache full, skipping new conversation");
            metrics::counter!("history.skipped_full").increment(1);
            return Err(RelayError::History(format!(
                "history cache full ({} conversations), '{key}' not stored",
                self.max_entries
            )));
        }

        let mut entry = self
            .store
            .entry(key.to_string())
            .or_insert_with(|| HistoryEntry {
                turns: Vec::new(),
                updated_at: Instant::now(),
            });
        if entry.updated_at.elapsed() > self.ttl {
            entry.turns.clear();
        }
        entry.turns.extend(turns);
        let excess = entry.turns.len().saturating_sub(self.max_turns);
        if excess > 0 {
            entry.turns.drain(..excess);
        }
        entry.updated_at = Instant::now();
        Ok(())
    }

    /// Drop a single conversation. Returns whether anything was stored.
    pub fn clear(&self, key: &str) -> bool {
        self.store.remove(key).is_some()
    }

    /// Drop every conversation. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        let before = self.store.len();
        self.store.clear();
        before
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.updated_at.elapsed() <= self.ttl);
        before.saturating_sub(self.store.len())
    }

    pub fn status(&self) -> CacheStatus {
        let oldest_age_secs = self
            .store
            .iter()
            .map(|entry| entry.updated_at.elapsed().as_secs())
            .max();
        CacheStatus {
            entries: self.store.len(),
            max_entries: self.max_entries,
            max_turns: self.max_turns,
            ttl_secs: self.ttl.as_secs(),
            oldest_age_secs,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
