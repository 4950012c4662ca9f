//! Per-request orchestration
//!
//! One request flows: resolve model → (combo expansion) → account selection
//! → token refresh when stale → upstream execute → assemble. On upstream
//! failure the error classifier decides the cooldown, the failing account is
//! marked, and the loop rotates to the next account with the failed id
//! excluded. Combos run the whole single-model pipeline per target, in
//! order, and surface 406 once every target is exhausted.
//!
//! Token-refresh failures are swallowed deliberately: the request proceeds
//! with the stored token and a 401 upstream triggers the normal fallback.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{StatusCode, header};
use axum::response::Response;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gateway_auth::{ProviderKind, apply_refreshed, needs_refresh, refresh_with_retry};
use gateway_pool::arbiter::{AllRateLimited, Arbiter, Selection};
use gateway_pool::classify;
use provider::{Error as ExecutorError, ExecuteArgs, Outcome, Registry};

use crate::assemble::{ResponseMeta, error_response, estimate_prompt_tokens, respond};
use crate::metrics;

/// Bounded attempts for one token refresh.
const REFRESH_MAX_RETRIES: u32 = 3;

/// Shared dispatch dependencies.
pub struct DispatchContext {
    pub arbiter: Arc<Arbiter>,
    pub registry: Arc<Registry>,
    pub combos: HashMap<String, Vec<String>>,
    pub aliases: HashMap<String, String>,
}

/// Entry point for `POST /v1/chat/completions`.
pub async fn handle_chat(ctx: &DispatchContext, body: Value) -> Response {
    let model = match body.get("model").and_then(Value::as_str) {
        Some(model) if !model.is_empty() => model.to_string(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "input_error",
                "request body must contain a 'model' field",
            );
        }
    };
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    if let Some(targets) = ctx.combos.get(&model) {
        handle_combo_chat(ctx, &body, &model, targets, stream).await
    } else {
        handle_single_model_chat(ctx, &body, &model, stream).await
    }
}

/// Resolve a model string to `(provider, upstream model)`.
///
/// Aliases rewrite first; then `provider/model` splits; bare names fall back
/// to prefix routing for the common model families.
pub fn resolve_model(
    model: &str,
    aliases: &HashMap<String, String>,
) -> Option<(ProviderKind, String)> {
    let target = aliases.get(model).map(String::as_str).unwrap_or(model);

    if let Some((provider, rest)) = target.split_once('/') {
        let kind: ProviderKind = provider.parse().ok()?;
        if rest.is_empty() {
            return None;
        }
        return Some((kind, rest.to_string()));
    }

    if target.starts_with("claude") {
        Some((ProviderKind::Claude, target.to_string()))
    } else if target.starts_with("gemini") {
        Some((ProviderKind::GeminiCli, target.to_string()))
    } else if target.starts_with("gpt") || target.starts_with("o3") || target.starts_with("o4") {
        Some((ProviderKind::Codex, target.to_string()))
    } else if target.starts_with("qwen") {
        Some((ProviderKind::Qwen, target.to_string()))
    } else {
        None
    }
}

/// The account-fallback loop for one `provider/model` target.
pub async fn handle_single_model_chat(
    ctx: &DispatchContext,
    body: &Value,
    model_str: &str,
    stream: bool,
) -> Response {
    let Some((provider, model)) = resolve_model(model_str, &ctx.aliases) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "input_error",
            &format!("cannot resolve model '{model_str}' to a provider"),
        );
    };

    let executor = ctx.registry.executor(provider);
    let settings = ctx.arbiter.store().settings().clone();
    let mut exclude_connection_id: Option<String> = None;

    loop {
        let mut connection = match ctx
            .arbiter
            .select(provider, exclude_connection_id.as_deref())
            .await
        {
            Selection::Connection(connection) => connection,
            Selection::NoConnections => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "no_credentials",
                    &format!("no credentials configured for provider '{provider}'"),
                );
            }
            Selection::AllRateLimited(info) => {
                return all_rate_limited_response(provider, &info);
            }
        };

        // Request-time refresh: a failure here is not fatal — the stored
        // token rides along and the upstream's 401 drives fallback.
        if needs_refresh(
            &connection,
            settings.token_expiry_buffer_ms,
            gateway_auth::now_millis(),
        ) {
            debug!(connection_id = %connection.id, "token inside expiry buffer, refreshing");
            let client = ctx.registry.client().clone();
            let refreshed = refresh_with_retry(
                || executor.refresh_credentials(&client, &connection),
                REFRESH_MAX_RETRIES,
            )
            .await;
            match refreshed {
                Some(tokens) => {
                    metrics::record_token_refresh(provider.as_str(), true);
                    match ctx
                        .arbiter
                        .store()
                        .update(&connection.id, |c| apply_refreshed(c, &tokens))
                        .await
                    {
                        Ok(updated) => {
                            info!(connection_id = %updated.id, "token refreshed");
                            connection = updated;
                        }
                        Err(e) => {
                            warn!(connection_id = %connection.id, error = %e, "failed to persist refreshed token");
                            apply_refreshed(&mut connection, &tokens);
                        }
                    }
                }
                None => {
                    metrics::record_token_refresh(provider.as_str(), false);
                    warn!(connection_id = %connection.id, "token refresh failed, proceeding with stored token");
                }
            }
        }

        let args = ExecuteArgs {
            model: model.clone(),
            body: body.clone(),
            stream,
            connection: connection.clone(),
        };

        let (status, error_text) = match executor.execute(&args).await {
            Ok(Outcome::Stream(events)) => {
                if let Err(e) = ctx.arbiter.clear_error(&connection.id, &connection).await {
                    warn!(connection_id = %connection.id, error = %e, "failed to clear error state");
                }
                let meta = ResponseMeta {
                    model: model_str.to_string(),
                    request_id: Uuid::new_v4().simple().to_string(),
                    prompt_estimate: estimate_prompt_tokens(body),
                };
                return respond(meta, events, stream).await;
            }
            Ok(Outcome::Error { status, body }) => (status, body),
            Err(e) => {
                // Executor-level network/transform failure; classified like a
                // 500 so the account cools down and the loop moves on
                error!(connection_id = %connection.id, error = %e, "executor error");
                let status = match e {
                    ExecutorError::MissingCredential(_) => 401,
                    _ => 500,
                };
                (status, e.to_string())
            }
        };

        metrics::record_upstream_error(provider.as_str(), status);
        let classification = match ctx
            .arbiter
            .mark_unavailable(&connection.id, status, &error_text)
            .await
        {
            Ok(classification) => classification,
            Err(e) => {
                error!(connection_id = %connection.id, error = %e, "failed to mark connection unavailable");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "connection store update failed",
                );
            }
        };
        metrics::record_cooldown(provider.as_str());

        if classification.should_fallback {
            info!(
                connection_id = %connection.id,
                status,
                "upstream failure, rotating to next account"
            );
            exclude_connection_id = Some(connection.id);
            continue;
        }

        let status_code =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return error_response(status_code, "upstream_error", &error_text);
    }
}

/// Try each combo target in order, returning the first 2xx response.
async fn handle_combo_chat(
    ctx: &DispatchContext,
    body: &Value,
    combo_name: &str,
    targets: &[String],
    stream: bool,
) -> Response {
    let mut earliest_retry_after_secs: Option<u64> = None;

    for target in targets {
        debug!(combo = combo_name, target = %target, "trying combo target");
        let response = handle_single_model_chat(ctx, body, target, stream).await;
        if response.status().is_success() {
            return response;
        }

        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(secs) = retry_after {
            earliest_retry_after_secs = Some(match earliest_retry_after_secs {
                Some(current) => current.min(secs),
                None => secs,
            });
        }

        // Consume the failure body; unparseable bodies classify as opaque text
        let error_text = match axum::body::to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };

        let classification = classify(
            status.as_u16(),
            &error_text,
            0,
            ctx.arbiter.cooldowns(),
        );
        if !classification.should_fallback {
            return error_response(status, "upstream_error", &error_text);
        }
        warn!(combo = combo_name, target = %target, status = status.as_u16(), "combo target failed, advancing");
    }

    match earliest_retry_after_secs {
        Some(secs) => {
            let mut response = error_response(
                StatusCode::NOT_ACCEPTABLE,
                "combo_exhausted",
                &format!(
                    "all models in combo '{combo_name}' are unavailable, earliest reset after {secs}s"
                ),
            );
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
        None => error_response(
            StatusCode::NOT_ACCEPTABLE,
            "combo_exhausted",
            &format!("all models in combo '{combo_name}' failed"),
        ),
    }
}

/// 503 (or the last upstream status) with a machine-readable Retry-After and
/// a human recovery hint.
fn all_rate_limited_response(provider: ProviderKind, info: &AllRateLimited) -> Response {
    let status = info
        .last_error_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    let retry_secs = info.retry_after_ms.div_ceil(1000).max(1);

    let mut message = format!(
        "all accounts for provider '{provider}' are rate limited, reset after {}",
        info.retry_after_human
    );
    if let Some(last_error) = &info.last_error {
        message.push_str(&format!(" (last error: {last_error})"));
    }

    let mut response = error_response(status, "all_accounts_unavailable", &message);
    if let Ok(value) = header::HeaderValue::from_str(&retry_secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}
