//! Upstream error classification
//!
//! Maps an upstream failure (HTTP status + response body) to a fallback
//! decision and a cooldown duration. Message-text patterns take priority
//! over status codes because several upstreams wrap rate limits in 4xx/5xx
//! statuses that would otherwise classify differently. The first matching
//! rule wins.
//!
//! Rate-limit failures grow the connection's backoff level and the cooldown
//! doubles per level: `cooldown(n) = min(base * 2^n, max)`. Every other
//! classification uses a fixed configured cooldown and leaves the level
//! untouched. The classifier is stateless, deterministic, and never panics.

use serde::Deserialize;

/// Body substrings that indicate a rate limit regardless of status code.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "quota exceeded",
    "capacity",
    "overloaded",
];

/// Exponential backoff parameters for rate-limit cooldowns.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_max_level")]
    pub max_level: u32,
}

fn default_base_ms() -> u64 {
    60_000
}

fn default_max_ms() -> u64 {
    30 * 60 * 1000
}

fn default_max_level() -> u32 {
    5
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            max_level: default_max_level(),
        }
    }
}

/// Fixed cooldowns per failure class, plus the backoff parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_not_found_ms")]
    pub not_found_ms: u64,
    #[serde(default = "default_request_not_allowed_ms")]
    pub request_not_allowed_ms: u64,
    #[serde(default = "default_unauthorized_ms")]
    pub unauthorized_ms: u64,
    #[serde(default = "default_payment_required_ms")]
    pub payment_required_ms: u64,
    #[serde(default = "default_transient_ms")]
    pub transient_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_not_found_ms() -> u64 {
    10 * 60 * 1000
}

fn default_request_not_allowed_ms() -> u64 {
    10 * 60 * 1000
}

fn default_unauthorized_ms() -> u64 {
    30 * 60 * 1000
}

fn default_payment_required_ms() -> u64 {
    30 * 60 * 1000
}

fn default_transient_ms() -> u64 {
    60_000
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            not_found_ms: default_not_found_ms(),
            request_not_allowed_ms: default_request_not_allowed_ms(),
            unauthorized_ms: default_unauthorized_ms(),
            payment_required_ms: default_payment_required_ms(),
            transient_ms: default_transient_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Outcome of classifying one upstream failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Whether the dispatch loop should rotate to the next account
    pub should_fallback: bool,
    /// How long the failing connection stays out of selection
    pub cooldown_ms: u64,
    /// Replacement backoff level, set only for rate-limit failures
    pub new_backoff_level: Option<u32>,
}

/// Classify an upstream failure into a fallback decision and cooldown.
///
/// `backoff_level` is the failing connection's current level; it feeds the
/// exponential cooldown when the failure is a rate limit.
pub fn classify(
    status: u16,
    body: &str,
    backoff_level: u32,
    cfg: &CooldownConfig,
) -> Classification {
    let lower = body.to_lowercase();

    // Message patterns first: upstreams hide these behind assorted statuses
    if lower.contains("no credentials") {
        return fixed(cfg.not_found_ms);
    }
    if lower.contains("request not allowed") {
        return fixed(cfg.request_not_allowed_ms);
    }
    if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return rate_limited(backoff_level, &cfg.backoff);
    }

    match status {
        401 => fixed(cfg.unauthorized_ms),
        402 | 403 => fixed(cfg.payment_required_ms),
        404 => fixed(cfg.not_found_ms),
        429 => rate_limited(backoff_level, &cfg.backoff),
        406 | 408 | 500 | 502 | 503 | 504 => fixed(cfg.transient_ms),
        // Conservative default: rotate accounts, short cooldown
        _ => fixed(cfg.transient_ms),
    }
}

fn fixed(cooldown_ms: u64) -> Classification {
    Classification {
        should_fallback: true,
        cooldown_ms,
        new_backoff_level: None,
    }
}

fn rate_limited(level: u32, backoff: &BackoffConfig) -> Classification {
    let cooldown_ms = backoff
        .base_ms
        .saturating_mul(1u64 << level.min(63))
        .min(backoff.max_ms);
    Classification {
        should_fallback: true,
        cooldown_ms,
        new_backoff_level: Some((level + 1).min(backoff.max_level)),
    }
}
