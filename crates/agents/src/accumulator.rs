//! Per-conversation debounce buffer for inbound chat messages.
//!
//! The [`MessageAccumulator`] collects messages per key and hands each burst
//! to a flush callback exactly once, after the key has been quiet for the
//! debounce window. Every new message re-arms the window.
//!
//! Each entry owns at most one live deadline timer, identified by a token.
//! A timer whose token no longer matches the entry is stale and does
//! nothing when it wakes. Flushes for the same key never overlap: a
//! deadline that fires while a flush is in flight is deferred by the retry
//! delay, and messages appended in the meantime wait for the next flush.
//! Clearing a key never releases an in-flight flush early.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use relay_core::config::AccumulatorConfig;
use relay_core::{RelayError, RelayResult};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

pub type FlushFuture = BoxFuture<'static, RelayResult<()>>;

/// Callback invoked with the conversation key and the buffered batch, in
/// arrival order.
pub type FlushCallback<M> = Arc<dyn Fn(String, Vec<M>) -> FlushFuture + Send + Sync>;

/// Wrap an async closure as a [`FlushCallback`].
pub fn flush_callback<M, F, Fut>(f: F) -> FlushCallback<M>
where
    F: Fn(String, Vec<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RelayResult<()>> + Send + 'static,
{
    Arc::new(move |key, batch| Box::pin(f(key, batch)))
}

struct PendingTimer {
    token: u64,
    handle: AbortHandle,
}

struct AccumulatorEntry<M> {
    /// Distinguishes this entry from a later one created under the same key.
    epoch: u64,
    messages: Vec<M>,
    burst_started_at: Instant,
    last_message_at: Instant,
    last_message_wall: DateTime<Utc>,
    is_processing: bool,
    timer: Option<PendingTimer>,
    window: Duration,
    on_flush: FlushCallback<M>,
}

/// Read-only view of one buffer, for health reporting.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AccumulatorSnapshot {
    pub key: String,
    pub message_count: usize,
    pub is_processing: bool,
    pub timer_pending: bool,
    pub last_message_at: DateTime<Utc>,
    /// Seconds since the last message, rounded to the nearest second.
    pub age_seconds: u64,
}

struct Inner<M> {
    entries: DashMap<String, AccumulatorEntry<M>>,
    retry_delay: Duration,
    max_wait: Option<Duration>,
    next_id: AtomicU64,
}

impl<M> Inner<M> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Keyed debounce accumulator. Cheap to clone; clones share state.
pub struct MessageAccumulator<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for MessageAccumulator<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Send + Sync + 'static> MessageAccumulator<M> {
    /// Create an accumulator.
    ///
    /// * `retry_delay`: how long to wait before re-checking a deadline that
    ///   fired while the previous flush for the key was still running.
    /// * `max_wait`: optional cap on how long a continuously busy key may
    ///   keep buffering. `None` gives pure debounce behaviour.
    pub fn new(retry_delay: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                retry_delay,
                max_wait,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &AccumulatorConfig) -> Self {
        Self::new(config.retry_delay(), config.max_wait())
    }

    /// Buffer a message for `key` and (re)arm its deadline `window` from now.
    ///
    /// The latest `window` and `on_flush` supplied for a key are the ones
    /// used at flush time. Never waits on an in-flight flush.
    pub fn add_message(
        &self,
        key: &str,
        message: M,
        window: Duration,
        on_flush: FlushCallback<M>,
    ) -> RelayResult<()> {
        if key.trim().is_empty() {
            return Err(RelayError::Buffering(
                "accumulator key must not be empty".to_string(),
            ));
        }

        let now = Instant::now();
        let (count, processing) = {
            let mut entry = self
                .inner
                .entries
                .entry(key.to_string())
                .or_insert_with(|| AccumulatorEntry {
                    epoch: self.inner.next_id(),
                    messages: Vec::new(),
                    burst_started_at: now,
                    last_message_at: now,
                    last_message_wall: Utc::now(),
                    is_processing: false,
                    timer: None,
                    window,
                    on_flush: on_flush.clone(),
                });

            if entry.messages.is_empty() {
                entry.burst_started_at = now;
            }
            entry.messages.push(message);
            entry.last_message_at = now;
            entry.last_message_wall = Utc::now();
            entry.window = window;
            entry.on_flush = on_flush;

            let delay = self.deadline_delay(&entry, now);
            self.arm(key, &mut entry, delay);
            (entry.messages.len(), entry.is_processing)
        };

        metrics::counter!("accumulator.messages_buffered").increment(1);
        metrics::gauge!("accumulator.active").set(self.inner.entries.len() as f64);
        debug!(key = key, count = count, processing = processing, "Message buffered");
        Ok(())
    }

    /// Snapshot of every live buffer, sorted by key. Does not mutate state.
    pub fn get_all_accumulators(&self) -> Vec<AccumulatorSnapshot> {
        let mut snapshots: Vec<AccumulatorSnapshot> = self
            .inner
            .entries
            .iter()
            .map(|entry| AccumulatorSnapshot {
                key: entry.key().clone(),
                message_count: entry.messages.len(),
                is_processing: entry.is_processing,
                timer_pending: entry.timer.is_some(),
                last_message_at: entry.last_message_wall,
                age_seconds: entry.last_message_at.elapsed().as_secs_f64().round() as u64,
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Drop the buffered messages for `key` and cancel its pending timer.
    /// Returns `false` when there was nothing to clear.
    ///
    /// An entry whose flush is in flight is kept, still marked as
    /// processing, so messages added after the clear wait for that flush to
    /// finish. Idle entries are removed.
    pub fn clear_accumulator(&self, key: &str) -> bool {
        let (dropped, processing, epoch) = {
            let Some(mut entry) = self.inner.entries.get_mut(key) else {
                return false;
            };
            if let Some(timer) = entry.timer.take() {
                timer.handle.abort();
            }
            let dropped = std::mem::take(&mut entry.messages).len();
            (dropped, entry.is_processing, entry.epoch)
        };

        if !processing {
            self.remove_if_idle(key, epoch);
        }
        info!(
            key = key,
            dropped = dropped,
            processing = processing,
            "Accumulator cleared"
        );
        true
    }

    pub fn active_count(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn deadline_delay(&self, entry: &AccumulatorEntry<M>, now: Instant) -> Duration {
        match self.inner.max_wait {
            Some(max_wait) => {
                let hard_deadline = entry.burst_started_at + max_wait;
                entry.window.min(hard_deadline.saturating_duration_since(now))
            }
            None => entry.window,
        }
    }

    /// Replace the entry's timer with a fresh one. Caller holds the entry lock.
    fn arm(&self, key: &str, entry: &mut AccumulatorEntry<M>, delay: Duration) {
        if let Some(previous) = entry.timer.take() {
            previous.handle.abort();
        }
        let token = self.inner.next_id();
        let accumulator = self.clone();
        let key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            accumulator.on_deadline(key, token).await;
        });
        entry.timer = Some(PendingTimer {
            token,
            handle: handle.abort_handle(),
        });
    }

    async fn on_deadline(self, key: String, token: u64) {
        let (batch, on_flush, epoch) = {
            let Some(mut entry) = self.inner.entries.get_mut(&key) else {
                return;
            };
            if entry.timer.as_ref().map(|t| t.token) != Some(token) {
                return;
            }
            entry.timer = None;

            if entry.is_processing {
                debug!(key = %key, "Flush in flight, deferring deadline");
                metrics::counter!("accumulator.flush_deferred").increment(1);
                let retry_delay = self.inner.retry_delay;
                self.arm(&key, &mut entry, retry_delay);
                return;
            }

            if entry.messages.is_empty() {
                let epoch = entry.epoch;
                drop(entry);
                self.remove_if_idle(&key, epoch);
                return;
            }

            entry.is_processing = true;
            (
                std::mem::take(&mut entry.messages),
                entry.on_flush.clone(),
                entry.epoch,
            )
        };

        let count = batch.len();
        info!(key = %key, count = count, "Debounce window elapsed, flushing");
        let started = Instant::now();

        let flush_key = key.clone();
        let outcome = tokio::spawn(async move { on_flush(flush_key, batch).await }).await;
        match outcome {
            Ok(Ok(())) => {
                metrics::counter!("accumulator.flushes").increment(1);
                debug!(
                    key = %key,
                    count = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Flush completed"
                );
            }
            Ok(Err(e)) => {
                metrics::counter!("accumulator.flush_failures").increment(1);
                error!(key = %key, count = count, error = %e, "Flush callback failed");
            }
            Err(e) => {
                metrics::counter!("accumulator.flush_failures").increment(1);
                error!(key = %key, count = count, error = %e, "Flush callback panicked");
            }
        }

        self.finish_flush(&key, epoch);
    }

    /// Release the processing flag and schedule whatever arrived meanwhile.
    fn finish_flush(&self, key: &str, epoch: u64) {
        let idle = {
            let Some(mut entry) = self.inner.entries.get_mut(key) else {
                return;
            };
            if entry.epoch != epoch {
                warn!(key = key, "Accumulator replaced during flush, leaving new entry alone");
                return;
            }
            entry.is_processing = false;
            if entry.messages.is_empty() {
                true
            } else {
                if entry.timer.is_none() {
                    let window = entry.window;
                    self.arm(key, &mut entry, window);
                }
                debug!(
                    key = key,
                    pending = entry.messages.len(),
                    "Messages arrived during flush, next flush scheduled"
                );
                false
            }
        };

        if idle {
            self.remove_if_idle(key, epoch);
        }
    }

    fn remove_if_idle(&self, key: &str, epoch: u64) {
        self.inner.entries.remove_if(key, |_, entry| {
            entry.epoch == epoch && !entry.is_processing && entry.messages.is_empty()
        });
        metrics::gauge!("accumulator.active").set(self.inner.entries.len() as f64);
    }
}
