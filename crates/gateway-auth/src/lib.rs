//! Credential management for the chat gateway
//!
//! Holds the `Connection` model (one credential per upstream provider), the
//! JSON-file-backed `ConnectionStore` collaborator, and the per-provider OAuth
//! token refresh table. This crate is a standalone library with no dependency
//! on the gateway binary — it can be tested and used independently.
//!
//! Credential flow:
//! 1. Connections are imported externally and land in the store file
//! 2. The arbiter selects a connection and hands it to the dispatch loop
//! 3. `needs_refresh()` flags tokens inside the expiry buffer
//! 4. `refresh_with_retry()` wraps the per-provider refresh call
//! 5. New tokens are persisted via `ConnectionStore::update()`

pub mod connection;
pub mod constants;
pub mod error;
pub mod refresh;
pub mod store;

pub use connection::{
    AuthType, Connection, FallbackStrategy, KiroAuthMethod, ProviderData, ProviderKind, Settings,
    TestStatus,
};
pub use error::{Error, Result};
pub use refresh::{
    RefreshOverrides, RefreshedTokens, apply_refreshed, exchange_copilot_token, needs_refresh,
    refresh_connection, refresh_with_retry,
};
pub use store::ConnectionStore;

/// Current wall-clock time as unix milliseconds.
///
/// All timestamps on `Connection` (`expires_at`, `rate_limited_until`,
/// `last_used_at`…) are unix-millisecond `u64`s so they survive the JSON
/// store round-trip without a date-time dependency.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
