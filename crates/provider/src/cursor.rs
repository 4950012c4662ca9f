//! Cursor executor
//!
//! Overrides the whole call path: the request body is framed protobuf from
//! the codec, authentication is the checksum/session header set rather
//! than a plain bearer token, and the response is a binary frame stream
//! decoded into events. HTTP/2 is preferred via ALPN on the shared client,
//! with HTTP/1.1 as the negotiated fallback.

use std::future::Future;
use std::pin::Pin;

use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use cursor_codec::{
    CursorEvent, StreamDecoder, ToolCallAssembler, clean_token, client_key, cursor_checksum,
    encode_chat_request, messages_from_openai, session_id,
};
use gateway_auth::{Connection, ProviderData, ProviderKind, RefreshedTokens};

use crate::config::ProviderConfig;
use crate::events::ChatEvent;
use crate::{Error, EventStream, ExecuteArgs, Executor, Outcome, RequestPayload, Result};

/// Client version reported to the Cursor API.
const CURSOR_CLIENT_VERSION: &str = "1.3.9";

pub struct CursorExecutor {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl CursorExecutor {
    pub fn new(config: ProviderConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn credentials<'a>(&self, conn: &'a Connection) -> Result<(&'a str, &'a str, bool)> {
        let access_token = conn.access_token.as_deref().ok_or_else(|| {
            Error::MissingCredential(format!("connection {} has no access token", conn.id))
        })?;
        let (machine_id, ghost_mode) = match &conn.data {
            ProviderData::Cursor {
                machine_id: Some(machine_id),
                ghost_mode,
            } => (machine_id.as_str(), *ghost_mode),
            _ => {
                return Err(Error::MissingCredential(
                    "Machine ID is required for Cursor API".to_string(),
                ));
            }
        };
        Ok((access_token, machine_id, ghost_mode))
    }

    fn event_stream(&self, response: reqwest::Response) -> EventStream {
        let stream = async_stream::stream! {
            let mut decoder = StreamDecoder::new();
            let mut assembler = ToolCallAssembler::new();
            let mut body = response.bytes_stream();
            'outer: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield ChatEvent::Error {
                            kind: "api_error".to_string(),
                            message: format!("upstream stream error: {e}"),
                        };
                        break;
                    }
                };
                for event in decoder.push(&chunk) {
                    match event {
                        CursorEvent::Text(text) => yield ChatEvent::Text(text),
                        CursorEvent::ToolCall {
                            id,
                            name,
                            arguments_fragment,
                            is_last,
                        } => {
                            let delta = assembler.observe(
                                &id,
                                name.as_deref(),
                                &arguments_fragment,
                                is_last,
                            );
                            yield ChatEvent::ToolCallDelta {
                                index: Some(delta.index),
                                id: Some(delta.id),
                                name: delta.name,
                                arguments_fragment: delta.arguments_fragment,
                                is_last,
                            };
                        }
                        CursorEvent::Error { kind, message } => {
                            yield ChatEvent::Error { kind, message };
                            break 'outer;
                        }
                    }
                }
            }
        };
        Box::pin(stream)
    }
}

impl Executor for CursorExecutor {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cursor
    }

    fn build_url(&self, _model: &str, _stream: bool, url_index: usize, _conn: &Connection) -> String {
        self.config.url_at(url_index)
    }

    fn build_headers(&self, conn: &Connection, _stream: bool) -> Result<HeaderMap> {
        let (access_token, machine_id, ghost_mode) = self.credentials(conn)?;
        let token = clean_token(access_token);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/connect+proto"),
        );
        headers.insert(
            HeaderName::from_static("connect-accept-encoding"),
            HeaderValue::from_static("gzip"),
        );
        headers.insert(
            HeaderName::from_static("connect-protocol-version"),
            HeaderValue::from_static("1"),
        );
        headers.insert(
            HeaderName::from_static("x-cursor-client-version"),
            HeaderValue::from_static(CURSOR_CLIENT_VERSION),
        );
        headers.insert(
            HeaderName::from_static("x-cursor-platform"),
            header_value(std::env::consts::OS)?,
        );
        headers.insert(
            HeaderName::from_static("x-cursor-arch"),
            header_value(std::env::consts::ARCH)?,
        );
        headers.insert(
            HeaderName::from_static("x-cursor-checksum"),
            header_value(&cursor_checksum(gateway_auth::now_millis(), machine_id))?,
        );
        headers.insert(
            HeaderName::from_static("x-client-key"),
            header_value(&client_key(access_token))?,
        );
        headers.insert(
            HeaderName::from_static("x-session-id"),
            header_value(&session_id(access_token))?,
        );
        headers.insert(
            HeaderName::from_static("x-ghost-mode"),
            HeaderValue::from_static(if ghost_mode { "true" } else { "false" }),
        );
        headers.insert(
            HeaderName::from_static("x-amzn-trace-id"),
            header_value(&format!("Root={}", Uuid::new_v4()))?,
        );
        headers.insert(
            HeaderName::from_static("x-cursor-config-version"),
            header_value(&Uuid::new_v4().to_string())?,
        );
        headers.insert(
            HeaderName::from_static("x-request-id"),
            header_value(&Uuid::new_v4().to_string())?,
        );
        Ok(headers)
    }

    fn transform_request(
        &self,
        model: &str,
        body: &Value,
        _stream: bool,
        _conn: &Connection,
    ) -> Result<RequestPayload> {
        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .map(|m| messages_from_openai(m))
            .unwrap_or_default();
        if messages.is_empty() {
            return Err(Error::Transform("request has no messages".to_string()));
        }
        Ok(RequestPayload::Bytes(encode_chat_request(
            model, &messages, None,
        )))
    }

    fn execute<'a>(
        &'a self,
        args: &'a ExecuteArgs,
    ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>> {
        Box::pin(async move {
            let headers = self.build_headers(&args.connection, args.stream)?;
            let payload =
                self.transform_request(&args.model, &args.body, args.stream, &args.connection)?;
            let frame = match payload {
                RequestPayload::Bytes(bytes) => bytes,
                RequestPayload::Json(_) => {
                    return Err(Error::Internal("cursor payload must be framed".into()));
                }
            };

            let url_count = self.config.base_urls.len().max(1);
            for url_index in 0..url_count {
                let url = self.build_url(&args.model, args.stream, url_index, &args.connection);
                debug!(url = %url, url_index, frame_len = frame.len(), "calling cursor upstream");

                match self
                    .client
                    .post(&url)
                    .headers(headers.clone())
                    .body(frame.clone())
                    .send()
                    .await
                {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        if status == 429 && url_index + 1 < url_count {
                            warn!(url_index, "429 from cursor base URL, advancing to fallback");
                            continue;
                        }
                        if status != 200 {
                            let body = response
                                .text()
                                .await
                                .unwrap_or_else(|_| String::from("<no body>"));
                            return Ok(Outcome::Error { status, body });
                        }
                        return Ok(Outcome::Stream(self.event_stream(response)));
                    }
                    Err(e) if url_index + 1 < url_count => {
                        warn!(url_index, error = %e, "network error, advancing to fallback URL");
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
        _client: &'a reqwest::Client,
        _conn: &'a Connection,
    ) -> Pin<Box<dyn Future<Output = gateway_auth::Result<Option<RefreshedTokens>>> + Send + 'a>>
    {
        // Cursor tokens are imported manually; there is no refresh endpoint
        Box::pin(async { Ok(None) })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Internal(format!("invalid header value: {e}")))
}
