//! Account pool for the chat gateway
//!
//! Manages credential selection across every configured provider with
//! fill-first or sticky round-robin strategies, rate-limit cooldown with
//! exponential backoff, and cross-account fallback. The connection store is
//! the single source of truth for credential data; the arbiter reads
//! snapshots at selection time and patches soft state back through the
//! store's atomic update.
//!
//! Connection lifecycle as seen by the pool:
//! 1. Dispatch asks `Arbiter::select` — one global mutex serialises this
//! 2. Upstream failure → `mark_unavailable` classifies and sets the cooldown
//! 3. Consecutive rate limits grow `backoff_level`, doubling the cooldown
//! 4. The cooldown horizon passing makes the connection selectable again
//!    (soft state: nothing transitions it back explicitly)
//! 5. A 2xx response → `clear_error` resets cooldown, error and backoff

pub mod arbiter;
pub mod classify;
pub mod error;

pub use arbiter::{AllRateLimited, Arbiter, Selection};
pub use classify::{BackoffConfig, Classification, CooldownConfig, classify};
pub use error::{Error, Result};
