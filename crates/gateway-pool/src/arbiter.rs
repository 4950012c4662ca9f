//! Mutex-serialised account selection
//!
//! One arbiter serves every provider. Selection runs under a single
//! process-wide tokio Mutex (FIFO wakeups) held across the read, the
//! strategy decision, and the persistence write: round-robin updates
//! `last_used_at` / `consecutive_use_count` on the chosen connection, and
//! two concurrent requests must not observe the pre-increment state or they
//! would pick the same account twice.
//!
//! Cooldown is soft state — a connection whose `rate_limited_until` horizon
//! has passed is selectable again without any explicit transition.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gateway_auth::{Connection, ConnectionStore, FallbackStrategy, ProviderKind, TestStatus};

use crate::classify::{Classification, CooldownConfig, classify};
use crate::error::{Error, Result};

/// Everything for this provider is cooling down.
#[derive(Debug, Clone)]
pub struct AllRateLimited {
    /// Milliseconds until the earliest connection recovers
    pub retry_after_ms: u64,
    /// Compact human rendering of the recovery delay, e.g. `2m30s`
    pub retry_after_human: String,
    /// Last error recorded on the soonest-recovering connection
    pub last_error: Option<String>,
    pub last_error_code: Option<u16>,
}

/// Result of one selection round.
#[derive(Debug)]
pub enum Selection {
    /// A usable connection snapshot
    Connection(Connection),
    /// Connections exist but every one is cooling down or inactive
    AllRateLimited(AllRateLimited),
    /// The provider has no connections configured at all
    NoConnections,
}

/// Account arbiter over the shared connection store.
pub struct Arbiter {
    store: Arc<ConnectionStore>,
    cooldowns: CooldownConfig,
    /// Process-wide selection lock, FIFO across all providers
    select_lock: Mutex<()>,
}

impl Arbiter {
    pub fn new(store: Arc<ConnectionStore>, cooldowns: CooldownConfig) -> Self {
        Self {
            store,
            cooldowns,
            select_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<ConnectionStore> {
        &self.store
    }

    pub fn cooldowns(&self) -> &CooldownConfig {
        &self.cooldowns
    }

    /// Select a connection for the provider, skipping `exclude_id`.
    ///
    /// The lock is released only after any round-robin bookkeeping write has
    /// committed to the store.
    pub async fn select(&self, provider: ProviderKind, exclude_id: Option<&str>) -> Selection {
        let _guard = self.select_lock.lock().await;
        let now = gateway_auth::now_millis();

        let active = self.store.connections(provider, true).await;
        if active.is_empty() {
            // Distinguish "nothing configured" from "everything disabled"
            let all = self.store.connections(provider, false).await;
            if all.is_empty() {
                return Selection::NoConnections;
            }
            return Selection::AllRateLimited(summarize_unavailable(&all, now));
        }

        let candidates: Vec<&Connection> = active
            .iter()
            .filter(|c| exclude_id != Some(c.id.as_str()) && !c.in_cooldown(now))
            .collect();

        if candidates.is_empty() {
            return Selection::AllRateLimited(summarize_unavailable(&active, now));
        }

        let settings = self.store.settings();
        match settings.fallback_strategy {
            FallbackStrategy::FillFirst => {
                // Store output is already priority-sorted
                let chosen = candidates[0].clone();
                debug!(provider = %provider, connection_id = %chosen.id, "selected (fill-first)");
                Selection::Connection(chosen)
            }
            FallbackStrategy::RoundRobin => {
                let sticky_limit = settings.sticky_round_robin_limit;
                self.select_round_robin(&candidates, sticky_limit, now)
                    .await
            }
        }
    }

    /// Sticky round-robin: re-use the most recent connection until its
    /// consecutive-use budget runs out, then rotate to the least recently
    /// used (never-used connections first).
    async fn select_round_robin(
        &self,
        candidates: &[&Connection],
        sticky_limit: u32,
        now: u64,
    ) -> Selection {
        let most_recent = candidates
            .iter()
            .filter(|c| c.last_used_at.is_some())
            .max_by_key(|c| c.last_used_at);

        let (id, count) = match most_recent {
            Some(current) if current.consecutive_use_count < sticky_limit => {
                (current.id.clone(), current.consecutive_use_count + 1)
            }
            _ => {
                let next = candidates
                    .iter()
                    .min_by_key(|c| (c.last_used_at.is_some(), c.last_used_at))
                    .expect("candidates is non-empty");
                (next.id.clone(), 1)
            }
        };

        match self
            .store
            .update(&id, |c| {
                c.last_used_at = Some(now);
                c.consecutive_use_count = count;
            })
            .await
        {
            Ok(snapshot) => {
                debug!(connection_id = %snapshot.id, use_count = count, "selected (round-robin)");
                Selection::Connection(snapshot)
            }
            Err(e) => {
                // The record vanished between read and write; surface as empty
                warn!(connection_id = %id, error = %e, "round-robin bookkeeping write failed");
                Selection::NoConnections
            }
        }
    }

    /// Classify an upstream failure and put the connection into cooldown.
    ///
    /// Returns the classification so the dispatch loop can decide whether to
    /// rotate to the next account.
    pub async fn mark_unavailable(
        &self,
        id: &str,
        status: u16,
        error_text: &str,
    ) -> Result<Classification> {
        let current = self
            .store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let classification = classify(status, error_text, current.backoff_level, &self.cooldowns);
        if classification.should_fallback {
            let now = gateway_auth::now_millis();
            let cooldown_ms = classification.cooldown_ms;
            let new_level = classification.new_backoff_level;
            let truncated: String = error_text.chars().take(100).collect();
            self.store
                .update(id, |c| {
                    c.rate_limited_until = Some(now + cooldown_ms);
                    c.test_status = TestStatus::Unavailable;
                    c.last_error = Some(truncated);
                    c.error_code = Some(status);
                    c.last_error_at = Some(now);
                    if let Some(level) = new_level {
                        c.backoff_level = level;
                    }
                })
                .await
                .map_err(|e| Error::Store(e.to_string()))?;
            info!(
                connection_id = id,
                status,
                cooldown_ms,
                backoff_level = ?new_level,
                "connection entering cooldown"
            );
        }
        Ok(classification)
    }

    /// Reset a connection's error state after a successful response.
    ///
    /// No-op when the snapshot already shows a clean record, so the happy
    /// path does not pay a store write per request.
    pub async fn clear_error(&self, id: &str, snapshot: &Connection) -> Result<()> {
        if !snapshot.has_error_state() {
            return Ok(());
        }
        self.store
            .update(id, |c| c.clear_error_state())
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        debug!(connection_id = id, "cleared error state");
        Ok(())
    }
}

/// Build the all-rate-limited summary from the soonest-recovering connection.
fn summarize_unavailable(connections: &[Connection], now: u64) -> AllRateLimited {
    let soonest = connections
        .iter()
        .filter(|c| c.in_cooldown(now))
        .min_by_key(|c| c.rate_limited_until);

    let retry_after_ms = soonest
        .and_then(|c| c.rate_limited_until)
        .map(|until| until - now)
        .unwrap_or(0);

    AllRateLimited {
        retry_after_ms,
        retry_after_human: human_duration(retry_after_ms),
        last_error: soonest.and_then(|c| c.last_error.clone()),
        last_error_code: soonest.and_then(|c| c.error_code),
    }
}

/// Compact duration rendering: `45s`, `2m30s`, `1h5m`.
pub fn human_duration(ms: u64) -> String {
    let total_secs = ms.div_ceil(1000).max(1);
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    if hours > 0 {
        if mins > 0 {
            format!("{hours}h{mins}m")
        } else {
            format!("{hours}h")
        }
    } else if mins > 0 {
        if secs > 0 {
            format!("{mins}m{secs}s")
        } else {
            format!("{mins}m")
        }
    } else {
        format!("{secs}s")
    }
}
