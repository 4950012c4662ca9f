//! Generic HTTP executor
//!
//! One implementation covers every HTTP/JSON provider. The provider's
//! dialect decides the body transform and response parsing; the connection
//! decides the auth headers. `execute` walks the configured base URLs in
//! order — a 429 or a network error advances to the next URL while one
//! remains, and the last attempt surfaces its result as-is.

use std::future::Future;
use std::pin::Pin;

use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, warn};

use gateway_auth::{
    AuthType, Connection, ProviderData, ProviderKind, RefreshedTokens, refresh_connection,
};

use crate::config::ProviderConfig;
use crate::events::ChatEvent;
use crate::sse::{Dialect, SseLineBuffer, parse_data};
use crate::transform;
use crate::{Error, EventStream, ExecuteArgs, Executor, Outcome, RequestPayload, Result};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta flag required for OAuth access to the Anthropic API.
const CLAUDE_OAUTH_BETA: &str = "oauth-2025-04-20";

/// User-Agent matching the Claude CLI identity.
const CLAUDE_USER_AGENT: &str = "claude-cli/2.0.76 (external, sdk-cli)";

/// Editor identity headers required by the Copilot chat endpoint.
const COPILOT_EDITOR_VERSION: &str = "vscode/1.96.2";
const COPILOT_USER_AGENT: &str = "GitHubCopilotChat/0.26.7";

/// Status that advances to the next fallback URL (while one remains).
const RETRYABLE_STATUS: u16 = 429;

pub struct HttpExecutor {
    kind: ProviderKind,
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(kind: ProviderKind, config: ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            kind,
            config,
            client,
        }
    }

    /// The bearer credential for this connection.
    ///
    /// GitHub swaps in the short-lived Copilot session token when one is
    /// stored; everything else uses the access token or API key directly.
    fn bearer_token<'a>(&self, conn: &'a Connection) -> Result<&'a str> {
        if self.kind == ProviderKind::Github
            && let ProviderData::Github {
                copilot_token: Some(token),
                ..
            } = &conn.data
        {
            return Ok(token);
        }
        match conn.auth_type {
            AuthType::ApiKey => conn.api_key.as_deref(),
            AuthType::Oauth => conn.access_token.as_deref(),
        }
        .ok_or_else(|| {
            Error::MissingCredential(format!(
                "connection {} has no usable credential for {}",
                conn.id, self.kind
            ))
        })
    }

    fn event_stream(&self, response: reqwest::Response) -> EventStream {
        let dialect = Dialect::for_provider(self.kind);
        let stream = async_stream::stream! {
            let mut lines = SseLineBuffer::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => {
                        for data in lines.push(&chunk) {
                            for event in parse_data(dialect, &data) {
                                yield event;
                            }
                        }
                    }
                    Err(e) => {
                        yield ChatEvent::Error {
                            kind: "api_error".to_string(),
                            message: format!("upstream stream error: {e}"),
                        };
                        break;
                    }
                }
            }
        };
        Box::pin(stream)
    }
}

impl Executor for HttpExecutor {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn build_url(&self, _model: &str, _stream: bool, url_index: usize, _conn: &Connection) -> String {
        self.config.url_at(url_index)
    }

    fn build_headers(&self, conn: &Connection, _stream: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let token = self.bearer_token(conn)?;

        match Dialect::for_provider(self.kind) {
            Dialect::Anthropic => {
                headers.insert(
                    HeaderName::from_static("anthropic-version"),
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
                match conn.auth_type {
                    AuthType::ApiKey => {
                        headers.insert(
                            HeaderName::from_static("x-api-key"),
                            header_value(token)?,
                        );
                    }
                    AuthType::Oauth => {
                        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
                        headers.insert(
                            HeaderName::from_static("anthropic-beta"),
                            HeaderValue::from_static(CLAUDE_OAUTH_BETA),
                        );
                        headers.insert(USER_AGENT, HeaderValue::from_static(CLAUDE_USER_AGENT));
                    }
                }
            }
            _ => {
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
            }
        }

        if self.kind == ProviderKind::Github {
            headers.insert(
                HeaderName::from_static("editor-version"),
                HeaderValue::from_static(COPILOT_EDITOR_VERSION),
            );
            headers.insert(USER_AGENT, HeaderValue::from_static(COPILOT_USER_AGENT));
        }

        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Internal(format!("invalid header name '{name}': {e}")))?;
            headers.insert(name, header_value(value)?);
        }
        Ok(headers)
    }

    fn transform_request(
        &self,
        model: &str,
        body: &Value,
        _stream: bool,
        conn: &Connection,
    ) -> Result<RequestPayload> {
        let transformed = match Dialect::for_provider(self.kind) {
            Dialect::Anthropic => transform::openai_to_anthropic(model, body),
            Dialect::Gemini => transform::openai_to_gemini(model, body, conn.project_id.as_deref()),
            Dialect::Openai => transform::openai_passthrough(model, body),
        };
        Ok(RequestPayload::Json(transformed))
    }

    fn execute<'a>(
        &'a self,
        args: &'a ExecuteArgs,
    ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>> {
        Box::pin(async move {
            if self.config.base_urls.is_empty() {
                return Err(Error::Internal(format!(
                    "no base URLs configured for provider {}",
                    self.kind
                )));
            }

            let headers = self.build_headers(&args.connection, args.stream)?;
            let payload =
                self.transform_request(&args.model, &args.body, args.stream, &args.connection)?;

            let url_count = self.config.base_urls.len();
            for url_index in 0..url_count {
                let url = self.build_url(&args.model, args.stream, url_index, &args.connection);
                debug!(provider = %self.kind, url = %url, url_index, "calling upstream");

                let request = self.client.post(&url).headers(headers.clone());
                let request = match &payload {
                    RequestPayload::Json(json) => request.json(json),
                    RequestPayload::Bytes(bytes) => request.body(bytes.clone()),
                };

                match request.send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        if status == RETRYABLE_STATUS && url_index + 1 < url_count {
                            warn!(provider = %self.kind, url_index, "429 from base URL, advancing to fallback");
                            continue;
                        }
                        if !(200..300).contains(&status) {
                            let body = response
                                .text()
                                .await
                                .unwrap_or_else(|_| String::from("<no body>"));
                            return Ok(Outcome::Error { status, body });
                        }
                        return Ok(Outcome::Stream(self.event_stream(response)));
                    }
                    Err(e) if url_index + 1 < url_count => {
                        warn!(provider = %self.kind, url_index, error = %e, "network error, advancing to fallback URL");
                        continue;
                    }
                    Err(e) => return Err(Error::Network(e.to_string())),
                }
            }
            unreachable!("loop returns on the last URL attempt");
        })
    }

    fn refresh_credentials<'a>(
        &'a self,
        client: &'a reqwest::Client,
        conn: &'a Connection,
    ) -> Pin<Box<dyn Future<Output = gateway_auth::Result<Option<RefreshedTokens>>> + Send + 'a>>
    {
        Box::pin(refresh_connection(client, conn, &self.config.refresh))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Internal(format!("invalid header value: {e}")))
}
