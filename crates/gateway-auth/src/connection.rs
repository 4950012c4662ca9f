//! Connection model — one credential belonging to one upstream provider
//!
//! A connection carries both durable identity (provider, auth type, tokens)
//! and soft availability state (`rate_limited_until`, `backoff_level`). The
//! soft state is advisory: a `rate_limited_until` in the past means the
//! connection is effectively available again, so readers compare against
//! `now_millis()` rather than trusting `is_active`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Cursor,
    Claude,
    Codex,
    GeminiCli,
    Antigravity,
    Github,
    Kiro,
    Qwen,
    Iflow,
    OpenaiCompat,
    AnthropicCompat,
}

impl ProviderKind {
    /// All known provider tags, in registry order.
    pub const ALL: &'static [ProviderKind] = &[
        ProviderKind::Cursor,
        ProviderKind::Claude,
        ProviderKind::Codex,
        ProviderKind::GeminiCli,
        ProviderKind::Antigravity,
        ProviderKind::Github,
        ProviderKind::Kiro,
        ProviderKind::Qwen,
        ProviderKind::Iflow,
        ProviderKind::OpenaiCompat,
        ProviderKind::AnthropicCompat,
    ];

    /// The wire tag used in model strings (`provider/model`) and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Cursor => "cursor",
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
            ProviderKind::GeminiCli => "gemini-cli",
            ProviderKind::Antigravity => "antigravity",
            ProviderKind::Github => "github",
            ProviderKind::Kiro => "kiro",
            ProviderKind::Qwen => "qwen",
            ProviderKind::Iflow => "iflow",
            ProviderKind::OpenaiCompat => "openai-compat",
            ProviderKind::AnthropicCompat => "anthropic-compat",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown provider: {s}"))
    }
}

/// How the connection authenticates against its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    Oauth,
    ApiKey,
}

/// Last observed health of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    Active,
    Unavailable,
    Expired,
    Error,
    Success,
}

/// Kiro credential flavour, detected at import time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KiroAuthMethod {
    /// AWS SSO OIDC device registration (client_id + client_secret present)
    AwsSsoOidc,
    /// Kiro desktop social login (Google/GitHub/Microsoft)
    Social,
}

/// Per-provider credential payload, keyed by provider tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProviderData {
    #[default]
    None,
    Cursor {
        machine_id: Option<String>,
        #[serde(default = "default_true")]
        ghost_mode: bool,
    },
    Kiro {
        auth_method: KiroAuthMethod,
        client_id: Option<String>,
        client_secret: Option<String>,
        region: Option<String>,
    },
    Github {
        /// Short-lived Copilot session token from `/copilot_internal/v2/token`
        copilot_token: Option<String>,
        /// Unix-millisecond expiry of the session token
        copilot_expires_at: Option<u64>,
    },
}

fn default_true() -> bool {
    true
}

/// One credential belonging to one upstream provider.
///
/// Mutated by the arbiter (selection bookkeeping, error marking) and the
/// token refresher (new tokens); never destroyed by the gateway core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub provider: ProviderKind,
    pub auth_type: AuthType,
    /// Lower priority is tried first under the fill-first strategy
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token expiry as unix milliseconds; `None` means never refresh
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub data: ProviderData,
    #[serde(default = "default_test_status")]
    pub test_status: TestStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub last_error_at: Option<u64>,
    /// Cooldown horizon (exclusive) as unix milliseconds — the connection is
    /// skipped by selection while this lies in the future
    #[serde(default)]
    pub rate_limited_until: Option<u64>,
    /// Exponent for the rate-limit cooldown; capped by classifier config
    #[serde(default)]
    pub backoff_level: u32,
    #[serde(default)]
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub consecutive_use_count: u32,
}

fn default_test_status() -> TestStatus {
    TestStatus::Active
}

impl Connection {
    /// Minimal connection for a provider, used by imports and tests.
    pub fn new(id: impl Into<String>, provider: ProviderKind, auth_type: AuthType) -> Self {
        Self {
            id: id.into(),
            provider,
            auth_type,
            priority: 0,
            is_active: true,
            api_key: None,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            project_id: None,
            data: ProviderData::None,
            test_status: TestStatus::Active,
            last_error: None,
            error_code: None,
            last_error_at: None,
            rate_limited_until: None,
            backoff_level: 0,
            last_used_at: None,
            consecutive_use_count: 0,
        }
    }

    /// Whether the cooldown horizon lies in the future at `now`.
    pub fn in_cooldown(&self, now: u64) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    /// Reset the error state after a successful request.
    ///
    /// Clears `rate_limited_until`, `last_error`, `error_code` and zeroes
    /// `backoff_level` in one patch so no reader observes a partial reset.
    pub fn clear_error_state(&mut self) {
        self.rate_limited_until = None;
        self.last_error = None;
        self.error_code = None;
        self.backoff_level = 0;
        self.test_status = TestStatus::Active;
    }

    /// Whether a success/error reset would change anything.
    pub fn has_error_state(&self) -> bool {
        self.test_status != TestStatus::Active
            || self.last_error.is_some()
            || self.rate_limited_until.is_some()
            || self.backoff_level != 0
    }
}

/// How the arbiter orders connections once cooldowns are filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Always drain the highest-priority available connection first
    #[default]
    FillFirst,
    /// Re-use the current connection up to the sticky limit, then rotate
    RoundRobin,
}

/// Process-wide selection and refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,
    #[serde(default = "default_sticky_limit")]
    pub sticky_round_robin_limit: u32,
    #[serde(default = "default_expiry_buffer")]
    pub token_expiry_buffer_ms: u64,
}

fn default_sticky_limit() -> u32 {
    3
}

fn default_expiry_buffer() -> u64 {
    5 * 60 * 1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fallback_strategy: FallbackStrategy::FillFirst,
            sticky_round_robin_limit: default_sticky_limit(),
            token_expiry_buffer_ms: default_expiry_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_round_trips_through_str() {
        for kind in ProviderKind::ALL {
            let parsed: ProviderKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, *kind);
        }
    }

    #[test]
    fn provider_kind_rejects_unknown() {
        assert!("not-a-provider".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn provider_kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&ProviderKind::GeminiCli).unwrap();
        assert_eq!(json, r#""gemini-cli""#);
    }

    #[test]
    fn connection_deserializes_with_defaults() {
        let json = r#"{"id":"c1","provider":"cursor","auth_type":"oauth"}"#;
        let conn: Connection = serde_json::from_str(json).unwrap();
        assert!(conn.is_active);
        assert_eq!(conn.backoff_level, 0);
        assert_eq!(conn.test_status, TestStatus::Active);
        assert!(matches!(conn.data, ProviderData::None));
    }

    #[test]
    fn cursor_data_defaults_ghost_mode_on() {
        let json = r#"{"kind":"cursor","machine_id":"m-1"}"#;
        let data: ProviderData = serde_json::from_str(json).unwrap();
        match data {
            ProviderData::Cursor {
                machine_id,
                ghost_mode,
            } => {
                assert_eq!(machine_id.as_deref(), Some("m-1"));
                assert!(ghost_mode);
            }
            other => panic!("expected cursor data, got {other:?}"),
        }
    }

    #[test]
    fn in_cooldown_compares_against_now() {
        let mut conn = Connection::new("c1", ProviderKind::Claude, AuthType::Oauth);
        conn.rate_limited_until = Some(1_000);
        assert!(conn.in_cooldown(999));
        // Exclusive horizon: at the instant itself the connection is available
        assert!(!conn.in_cooldown(1_000));
        assert!(!conn.in_cooldown(1_001));
    }

    #[test]
    fn clear_error_state_resets_all_four_fields() {
        let mut conn = Connection::new("c1", ProviderKind::Claude, AuthType::Oauth);
        conn.rate_limited_until = Some(9_999);
        conn.last_error = Some("rate limited".into());
        conn.error_code = Some(429);
        conn.backoff_level = 3;
        conn.test_status = TestStatus::Unavailable;

        assert!(conn.has_error_state());
        conn.clear_error_state();
        assert!(!conn.has_error_state());
        assert!(conn.rate_limited_until.is_none());
        assert!(conn.last_error.is_none());
        assert!(conn.error_code.is_none());
        assert_eq!(conn.backoff_level, 0);
    }

    #[test]
    fn settings_defaults_match_contract() {
        let settings = Settings::default();
        assert_eq!(settings.fallback_strategy, FallbackStrategy::FillFirst);
        assert_eq!(settings.sticky_round_robin_limit, 3);
        assert_eq!(settings.token_expiry_buffer_ms, 300_000);
    }
}
