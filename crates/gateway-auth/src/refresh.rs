//! Per-provider OAuth token refresh
//!
//! Every provider exposes a POST token endpoint but disagrees on the body
//! shape: Claude and Kiro take JSON, the rest take form encoding, iFlow
//! additionally wants HTTP Basic, and GitHub needs a secondary call to mint
//! the short-lived Copilot session token. `refresh_connection` normalises
//! all of them into `RefreshedTokens`.
//!
//! Cursor tokens are imported manually and cannot be refreshed; its branch
//! returns `Ok(None)` and the request proceeds with the stored token.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::connection::{Connection, KiroAuthMethod, ProviderData, ProviderKind};
use crate::constants;
use crate::error::{Error, Result};
use crate::now_millis;

/// Normalised result of a successful refresh.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix-millisecond timestamp when persisting.
/// `data` carries a provider-payload replacement when the refresh produced
/// one (currently only the Copilot session token).
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub data: Option<ProviderData>,
}

/// Endpoint/client overrides from provider configuration.
///
/// Any field left `None` falls back to the compiled-in public client
/// constants for the provider.
#[derive(Debug, Clone, Default)]
pub struct RefreshOverrides {
    pub refresh_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Whether the connection's access token is inside the expiry buffer.
///
/// A missing `expires_at` means "never refresh" — Cursor and API-key
/// connections fall in this bucket.
pub fn needs_refresh(conn: &Connection, buffer_ms: u64, now: u64) -> bool {
    match conn.expires_at {
        Some(expires_at) => expires_at.saturating_sub(now) < buffer_ms,
        None => false,
    }
}

/// Token endpoint response in the common OAuth snake_case shape.
#[derive(Debug, Deserialize)]
struct TokenWire {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Kiro endpoints answer in camelCase.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KiroTokenWire {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Copilot session token from `/copilot_internal/v2/token`.
#[derive(Debug, Deserialize)]
struct CopilotTokenWire {
    token: String,
    /// Unix timestamp in seconds
    expires_at: u64,
}

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

impl From<TokenWire> for RefreshedTokens {
    fn from(wire: TokenWire) -> Self {
        RefreshedTokens {
            access_token: wire.access_token,
            refresh_token: wire.refresh_token,
            expires_in: wire.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
            data: None,
        }
    }
}

/// Refresh the connection's tokens against its provider's endpoint.
///
/// Returns `Ok(None)` for providers without a refresh flow (Cursor) and for
/// connections that have no refresh token to present.
pub async fn refresh_connection(
    client: &reqwest::Client,
    conn: &Connection,
    overrides: &RefreshOverrides,
) -> Result<Option<RefreshedTokens>> {
    if conn.provider == ProviderKind::Cursor {
        debug!(connection_id = %conn.id, "cursor tokens are imported manually, skipping refresh");
        return Ok(None);
    }

    let refresh_token = match conn.refresh_token.as_deref() {
        Some(rt) => rt,
        None => {
            debug!(connection_id = %conn.id, "no refresh token on connection");
            return Ok(None);
        }
    };

    let refreshed = match conn.provider {
        ProviderKind::Claude | ProviderKind::AnthropicCompat => {
            refresh_claude(client, refresh_token, overrides).await?
        }
        ProviderKind::Codex | ProviderKind::OpenaiCompat => {
            refresh_codex(client, refresh_token, overrides).await?
        }
        ProviderKind::GeminiCli => {
            refresh_google(
                client,
                refresh_token,
                overrides,
                constants::GEMINI_CLI_CLIENT_ID,
                constants::GEMINI_CLI_CLIENT_SECRET,
            )
            .await?
        }
        ProviderKind::Antigravity => {
            refresh_google(
                client,
                refresh_token,
                overrides,
                constants::ANTIGRAVITY_CLIENT_ID,
                constants::ANTIGRAVITY_CLIENT_SECRET,
            )
            .await?
        }
        ProviderKind::Qwen => refresh_qwen(client, refresh_token, overrides).await?,
        ProviderKind::Iflow => refresh_iflow(client, refresh_token, overrides).await?,
        ProviderKind::Github => refresh_github(client, refresh_token, overrides).await?,
        ProviderKind::Kiro => refresh_kiro(client, conn, refresh_token, overrides).await?,
        ProviderKind::Cursor => unreachable!("handled above"),
    };

    Ok(Some(refreshed))
}

/// Read the token response body, mapping 401/403 to `InvalidCredentials`.
async fn read_token_response(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));

    if !status.is_success() {
        // 401/403 means the refresh token is revoked or invalid
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }
        return Err(Error::Refresh(format!(
            "token endpoint returned {status}: {body}"
        )));
    }
    Ok(body)
}

fn parse_token_body(body: &str) -> Result<RefreshedTokens> {
    serde_json::from_str::<TokenWire>(body)
        .map(RefreshedTokens::from)
        .map_err(|e| Error::Refresh(format!("invalid token response: {e}")))
}

async fn refresh_claude(
    client: &reqwest::Client,
    refresh_token: &str,
    overrides: &RefreshOverrides,
) -> Result<RefreshedTokens> {
    let url = overrides
        .refresh_url
        .as_deref()
        .unwrap_or(constants::CLAUDE_TOKEN_URL);
    let client_id = overrides
        .client_id
        .as_deref()
        .unwrap_or(constants::CLAUDE_CLIENT_ID);

    let response = client
        .post(url)
        .json(&serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": client_id,
        }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("claude token refresh request failed: {e}")))?;

    parse_token_body(&read_token_response(response).await?)
}

async fn refresh_codex(
    client: &reqwest::Client,
    refresh_token: &str,
    overrides: &RefreshOverrides,
) -> Result<RefreshedTokens> {
    let url = overrides
        .refresh_url
        .as_deref()
        .unwrap_or(constants::CODEX_TOKEN_URL);
    let client_id = overrides
        .client_id
        .as_deref()
        .unwrap_or(constants::CODEX_CLIENT_ID);

    let response = client
        .post(url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("scope", constants::CODEX_SCOPE),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("codex token refresh request failed: {e}")))?;

    parse_token_body(&read_token_response(response).await?)
}

async fn refresh_google(
    client: &reqwest::Client,
    refresh_token: &str,
    overrides: &RefreshOverrides,
    default_client_id: &str,
    default_client_secret: &str,
) -> Result<RefreshedTokens> {
    let url = overrides
        .refresh_url
        .as_deref()
        .unwrap_or(constants::GOOGLE_TOKEN_URL);
    let client_id = overrides.client_id.as_deref().unwrap_or(default_client_id);
    let client_secret = overrides
        .client_secret
        .as_deref()
        .unwrap_or(default_client_secret);

    let response = client
        .post(url)
        .form(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("google token refresh request failed: {e}")))?;

    parse_token_body(&read_token_response(response).await?)
}

async fn refresh_qwen(
    client: &reqwest::Client,
    refresh_token: &str,
    overrides: &RefreshOverrides,
) -> Result<RefreshedTokens> {
    let url = overrides
        .refresh_url
        .as_deref()
        .unwrap_or(constants::QWEN_TOKEN_URL);
    let client_id = overrides
        .client_id
        .as_deref()
        .unwrap_or(constants::QWEN_CLIENT_ID);

    let response = client
        .post(url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("qwen token refresh request failed: {e}")))?;

    parse_token_body(&read_token_response(response).await?)
}

async fn refresh_iflow(
    client: &reqwest::Client,
    refresh_token: &str,
    overrides: &RefreshOverrides,
) -> Result<RefreshedTokens> {
    let url = overrides
        .refresh_url
        .as_deref()
        .unwrap_or(constants::IFLOW_TOKEN_URL);
    let client_id = overrides
        .client_id
        .as_deref()
        .unwrap_or(constants::IFLOW_CLIENT_ID);
    let client_secret = overrides
        .client_secret
        .as_deref()
        .unwrap_or(constants::IFLOW_CLIENT_SECRET);

    let response = client
        .post(url)
        .basic_auth(client_id, Some(client_secret))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("iflow token refresh request failed: {e}")))?;

    parse_token_body(&read_token_response(response).await?)
}

async fn refresh_github(
    client: &reqwest::Client,
    refresh_token: &str,
    overrides: &RefreshOverrides,
) -> Result<RefreshedTokens> {
    let url = overrides
        .refresh_url
        .as_deref()
        .unwrap_or(constants::GITHUB_TOKEN_URL);
    let client_id = overrides
        .client_id
        .as_deref()
        .unwrap_or(constants::GITHUB_CLIENT_ID);

    let mut form: Vec<(&str, &str)> = vec![
        ("client_id", client_id),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    if let Some(secret) = overrides.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let response = client
        .post(url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("github token refresh request failed: {e}")))?;

    let mut refreshed = parse_token_body(&read_token_response(response).await?)?;

    // A fresh GitHub token alone cannot reach the Copilot API — mint the
    // short-lived session token now so the executor has both.
    match exchange_copilot_token(client, &refreshed.access_token).await {
        Ok((copilot_token, copilot_expires_at)) => {
            refreshed.data = Some(ProviderData::Github {
                copilot_token: Some(copilot_token),
                copilot_expires_at: Some(copilot_expires_at),
            });
        }
        Err(e) => {
            warn!(error = %e, "copilot session token exchange failed, keeping github token only");
        }
    }
    Ok(refreshed)
}

/// Exchange a GitHub access token for a Copilot session token.
///
/// Returns the token and its expiry as unix milliseconds.
pub async fn exchange_copilot_token(
    client: &reqwest::Client,
    github_token: &str,
) -> Result<(String, u64)> {
    let url = format!(
        "{}/copilot_internal/v2/token",
        constants::GITHUB_API_BASE.trim_end_matches('/')
    );

    let response = client
        .get(&url)
        .header("Authorization", format!("token {github_token}"))
        .header("Accept", "application/json")
        .header("Editor-Version", constants::COPILOT_EDITOR_VERSION)
        .header("User-Agent", constants::COPILOT_USER_AGENT)
        .send()
        .await
        .map_err(|e| Error::Http(format!("copilot token exchange request failed: {e}")))?;

    let body = read_token_response(response).await?;
    let wire: CopilotTokenWire = serde_json::from_str(&body)
        .map_err(|e| Error::Refresh(format!("invalid copilot token response: {e}")))?;
    Ok((wire.token, wire.expires_at * 1000))
}

async fn refresh_kiro(
    client: &reqwest::Client,
    conn: &Connection,
    refresh_token: &str,
    overrides: &RefreshOverrides,
) -> Result<RefreshedTokens> {
    let (auth_method, client_id, client_secret, region) = match &conn.data {
        ProviderData::Kiro {
            auth_method,
            client_id,
            client_secret,
            region,
        } => (
            *auth_method,
            client_id.clone(),
            client_secret.clone(),
            region.clone(),
        ),
        _ => (KiroAuthMethod::Social, None, None, None),
    };

    let response = match (auth_method, client_id, client_secret) {
        (KiroAuthMethod::AwsSsoOidc, Some(id), Some(secret)) => {
            let region = region.unwrap_or_else(|| constants::KIRO_DEFAULT_REGION.to_string());
            client
                .post(constants::kiro_oidc_token_url(&region))
                .json(&serde_json::json!({
                    "clientId": id,
                    "clientSecret": secret,
                    "grantType": "refresh_token",
                    "refreshToken": refresh_token,
                }))
                .send()
                .await
        }
        _ => {
            let url = overrides
                .refresh_url
                .as_deref()
                .unwrap_or(constants::KIRO_SOCIAL_REFRESH_URL);
            client
                .post(url)
                .json(&serde_json::json!({ "refreshToken": refresh_token }))
                .send()
                .await
        }
    }
    .map_err(|e| Error::Http(format!("kiro token refresh request failed: {e}")))?;

    let body = read_token_response(response).await?;
    let wire: KiroTokenWire = serde_json::from_str(&body)
        .map_err(|e| Error::Refresh(format!("invalid kiro token response: {e}")))?;
    Ok(RefreshedTokens {
        access_token: wire.access_token,
        refresh_token: wire.refresh_token,
        expires_in: wire.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        data: None,
    })
}

/// Run a refresh operation with bounded retries and linear backoff.
///
/// Retries when the operation errors or yields no tokens, sleeping
/// `attempt * 1s` between attempts. Failures are logged and swallowed: the
/// caller receives `None` and proceeds with the current tokens as a best
/// effort (the upstream will 401 and trigger normal account fallback).
pub async fn refresh_with_retry<F, Fut>(mut op: F, max_retries: u32) -> Option<RefreshedTokens>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<RefreshedTokens>>>,
{
    for attempt in 1..=max_retries.max(1) {
        match op().await {
            Ok(Some(tokens)) => return Some(tokens),
            Ok(None) => {
                debug!(attempt, "refresh produced no tokens");
            }
            Err(e) => {
                warn!(attempt, error = %e, "token refresh attempt failed");
            }
        }
        if attempt < max_retries {
            tokio::time::sleep(std::time::Duration::from_millis(u64::from(attempt) * 1000)).await;
        }
    }
    None
}

/// Apply refreshed tokens to a connection record.
///
/// Used as the persistence patch after a successful refresh: installs the
/// new tokens, recomputes the absolute expiry from `expires_in`, and marks
/// the connection active again.
pub fn apply_refreshed(conn: &mut Connection, tokens: &RefreshedTokens) {
    conn.access_token = Some(tokens.access_token.clone());
    if let Some(rt) = &tokens.refresh_token {
        conn.refresh_token = Some(rt.clone());
    }
    conn.expires_at = Some(now_millis() + tokens.expires_in * 1000);
    if let Some(data) = &tokens.data {
        conn.data = data.clone();
    }
    conn.test_status = crate::connection::TestStatus::Active;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AuthType;

    fn oauth_conn(provider: ProviderKind) -> Connection {
        let mut conn = Connection::new("c1", provider, AuthType::Oauth);
        conn.access_token = Some("at_old".into());
        conn.refresh_token = Some("rt_1".into());
        conn
    }

    #[test]
    fn token_wire_deserializes_snake_case() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600}"#;
        let wire: TokenWire = serde_json::from_str(json).unwrap();
        let tokens = RefreshedTokens::from(wire);
        assert_eq!(tokens.access_token, "at_abc");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt_def"));
        assert_eq!(tokens.expires_in, 3600);
    }

    #[test]
    fn token_wire_defaults_expires_in() {
        let json = r#"{"access_token":"at_abc"}"#;
        let wire: TokenWire = serde_json::from_str(json).unwrap();
        let tokens = RefreshedTokens::from(wire);
        assert_eq!(tokens.expires_in, DEFAULT_EXPIRES_IN_SECS);
        assert!(tokens.refresh_token.is_none());
    }

    #[test]
    fn kiro_wire_deserializes_camel_case() {
        let json = r#"{"accessToken":"at_kiro","refreshToken":"rt_kiro","expiresIn":1800}"#;
        let wire: KiroTokenWire = serde_json::from_str(json).unwrap();
        assert_eq!(wire.access_token, "at_kiro");
        assert_eq!(wire.refresh_token.as_deref(), Some("rt_kiro"));
        assert_eq!(wire.expires_in, Some(1800));
    }

    #[test]
    fn copilot_wire_deserializes() {
        let json = r#"{"token":"cop_123","expires_at":1700000000}"#;
        let wire: CopilotTokenWire = serde_json::from_str(json).unwrap();
        assert_eq!(wire.token, "cop_123");
        assert_eq!(wire.expires_at, 1_700_000_000);
    }

    #[test]
    fn needs_refresh_inside_buffer() {
        let mut conn = oauth_conn(ProviderKind::Claude);
        let now = 10_000_000;
        // Expires in 2 minutes, buffer is 5 minutes → stale
        conn.expires_at = Some(now + 2 * 60 * 1000);
        assert!(needs_refresh(&conn, 5 * 60 * 1000, now));
    }

    #[test]
    fn needs_refresh_outside_buffer() {
        let mut conn = oauth_conn(ProviderKind::Claude);
        let now = 10_000_000;
        conn.expires_at = Some(now + 10 * 60 * 1000);
        assert!(!needs_refresh(&conn, 5 * 60 * 1000, now));
    }

    #[test]
    fn needs_refresh_missing_expiry_means_never() {
        let conn = oauth_conn(ProviderKind::Cursor);
        assert!(!needs_refresh(&conn, 5 * 60 * 1000, now_millis()));
    }

    #[test]
    fn needs_refresh_already_expired() {
        let mut conn = oauth_conn(ProviderKind::Claude);
        let now = 10_000_000;
        conn.expires_at = Some(now - 1);
        assert!(needs_refresh(&conn, 5 * 60 * 1000, now));
    }

    #[tokio::test]
    async fn cursor_refresh_returns_none() {
        let client = reqwest::Client::new();
        let conn = oauth_conn(ProviderKind::Cursor);
        let result = refresh_connection(&client, &conn, &RefreshOverrides::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_refresh_token_returns_none() {
        let client = reqwest::Client::new();
        let mut conn = oauth_conn(ProviderKind::Claude);
        conn.refresh_token = None;
        let result = refresh_connection(&client, &conn, &RefreshOverrides::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = refresh_with_retry(
            move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(Some(RefreshedTokens {
                        access_token: "at_new".into(),
                        refresh_token: None,
                        expires_in: 3600,
                        data: None,
                    }))
                }
            },
            3,
        )
        .await;
        assert_eq!(result.unwrap().access_token, "at_new");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_swallows_errors_and_returns_none() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = refresh_with_retry(
            move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(Error::Refresh("boom".into()))
                }
            },
            3,
        )
        .await;
        assert!(result.is_none());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failures() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = refresh_with_retry(
            move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::Http("connect refused".into()))
                    } else {
                        Ok(Some(RefreshedTokens {
                            access_token: "at_final".into(),
                            refresh_token: Some("rt_final".into()),
                            expires_in: 60,
                            data: None,
                        }))
                    }
                }
            },
            3,
        )
        .await;
        assert_eq!(result.unwrap().access_token, "at_final");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn apply_refreshed_installs_tokens_and_expiry() {
        let mut conn = oauth_conn(ProviderKind::Claude);
        conn.test_status = crate::connection::TestStatus::Expired;
        let tokens = RefreshedTokens {
            access_token: "at_new".into(),
            refresh_token: Some("rt_new".into()),
            expires_in: 3600,
            data: None,
        };
        let before = now_millis();
        apply_refreshed(&mut conn, &tokens);
        assert_eq!(conn.access_token.as_deref(), Some("at_new"));
        assert_eq!(conn.refresh_token.as_deref(), Some("rt_new"));
        assert!(conn.expires_at.unwrap() >= before + 3600 * 1000);
        assert_eq!(conn.test_status, crate::connection::TestStatus::Active);
    }

    #[test]
    fn apply_refreshed_keeps_old_refresh_token_when_absent() {
        let mut conn = oauth_conn(ProviderKind::Claude);
        let tokens = RefreshedTokens {
            access_token: "at_new".into(),
            refresh_token: None,
            expires_in: 3600,
            data: None,
        };
        apply_refreshed(&mut conn, &tokens);
        assert_eq!(conn.refresh_token.as_deref(), Some("rt_1"));
    }
}
