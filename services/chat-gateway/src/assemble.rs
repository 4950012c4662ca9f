//! Normalised response assembly
//!
//! Both client-facing shapes — the `chat.completion.chunk` SSE stream and
//! the one-shot `chat.completion` JSON — consume the same upstream event
//! stream. Tool calls are re-indexed into a dense, stable OpenAI `index`
//! space regardless of how the upstream keyed them (cursor call ids,
//! anthropic block indices, gemini one-shot calls).

use std::collections::HashMap;
use std::convert::Infallible;

use axum::http::{StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use provider::{ChatEvent, EventStream};
use serde_json::{Value, json};

/// Request-scoped data the assembler stamps on every chunk.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub model: String,
    pub request_id: String,
    /// Local prompt-token estimate, used when the upstream reports none
    pub prompt_estimate: u64,
}

/// Client-facing error envelope: `{"error": {message, type, code}}`.
pub fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": status.as_u16(),
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Sum of message content lengths / 4, with a floor of 1.
pub fn estimate_prompt_tokens(body: &Value) -> u64 {
    let chars: usize = body
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|message| match message.get("content") {
            Some(Value::String(s)) => s.len(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .map(str::len)
                .sum(),
            _ => 0,
        })
        .sum();
    ((chars / 4) as u64).max(1)
}

/// Serialise the event stream into the shape the client asked for.
pub async fn respond(meta: ResponseMeta, events: EventStream, client_streaming: bool) -> Response {
    if client_streaming {
        streaming_response(meta, events)
    } else {
        json_response(meta, events).await
    }
}

// --- tool-call re-indexing -------------------------------------------------

#[derive(Debug, Default)]
struct AccTool {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// What one fragment contributed, in output-index space.
#[derive(Debug)]
struct ToolDelta {
    out_index: usize,
    /// Id to emit on this chunk (first sighting only)
    id: Option<String>,
    /// Name to emit on this chunk (first sighting only)
    name: Option<String>,
    fragment: String,
}

/// Assigns dense output indices in first-seen order.
///
/// Keying prefers the upstream index (OpenAI/Anthropic always carry one and
/// reuse it across fragments), then the call id (Cursor), and falls back to
/// one fresh entry per event for sources that emit complete calls.
#[derive(Debug, Default)]
struct ToolAccumulator {
    entries: Vec<AccTool>,
    keys: HashMap<String, usize>,
    anon: usize,
}

impl ToolAccumulator {
    fn observe(
        &mut self,
        index: Option<usize>,
        id: Option<&str>,
        name: Option<&str>,
        fragment: &str,
    ) -> ToolDelta {
        let key = match (index, id) {
            (Some(index), _) => format!("idx:{index}"),
            (None, Some(id)) => format!("id:{id}"),
            (None, None) => {
                self.anon += 1;
                format!("anon:{}", self.anon)
            }
        };

        let is_new = !self.keys.contains_key(&key);
        let out_index = *self.keys.entry(key).or_insert_with(|| {
            self.entries.push(AccTool::default());
            self.entries.len() - 1
        });
        let entry = &mut self.entries[out_index];

        if entry.id.is_none()
            && let Some(id) = id
        {
            entry.id = Some(id.to_string());
        }
        let newly_named = entry.name.is_none() && name.is_some();
        if newly_named {
            entry.name = name.map(str::to_string);
        }
        entry.arguments.push_str(fragment);

        ToolDelta {
            out_index,
            id: if is_new { entry.id.clone() } else { None },
            name: if newly_named { entry.name.clone() } else { None },
            fragment: fragment.to_string(),
        }
    }

    fn completed(self) -> Vec<Value> {
        self.entries
            .into_iter()
            .enumerate()
            .map(|(i, tool)| {
                json!({
                    "id": tool.id.unwrap_or_else(|| format!("call_{i}")),
                    "type": "function",
                    "function": {
                        "name": tool.name.unwrap_or_default(),
                        "arguments": tool.arguments,
                    }
                })
            })
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Max-merge partial usage reports (Anthropic splits prompt and completion
/// across two events).
#[derive(Debug, Default, Clone, Copy)]
struct UsageTracker {
    prompt: u64,
    completion: u64,
}

impl UsageTracker {
    fn merge(&mut self, prompt: u64, completion: u64) {
        self.prompt = self.prompt.max(prompt);
        self.completion = self.completion.max(completion);
    }

    fn finalize(self, prompt_estimate: u64, completion_chars: usize) -> Value {
        let prompt = if self.prompt > 0 {
            self.prompt
        } else {
            prompt_estimate
        };
        let completion = if self.completion > 0 {
            self.completion
        } else {
            ((completion_chars / 4) as u64).max(1)
        };
        json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        })
    }
}

// --- streaming -------------------------------------------------------------

fn chunk_envelope(meta: &ResponseMeta, delta: Value, finish_reason: Value) -> Value {
    json!({
        "id": format!("chatcmpl-{}", meta.request_id),
        "object": "chat.completion.chunk",
        "created": gateway_auth::now_millis() / 1000,
        "model": meta.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }]
    })
}

fn streaming_response(meta: ResponseMeta, mut events: EventStream) -> Response {
    let stream = async_stream::stream! {
        let mut first = true;
        let mut tools = ToolAccumulator::default();
        let mut usage = UsageTracker::default();
        let mut completion_chars = 0usize;
        let mut errored = false;

        while let Some(event) = events.next().await {
            match event {
                ChatEvent::Text(text) => {
                    completion_chars += text.len();
                    let delta = if first {
                        json!({"role": "assistant", "content": text})
                    } else {
                        json!({"content": text})
                    };
                    first = false;
                    yield Ok::<Event, Infallible>(Event::default()
                        .data(chunk_envelope(&meta, delta, Value::Null).to_string()));
                }
                ChatEvent::ToolCallDelta { index, id, name, arguments_fragment, is_last: _ } => {
                    let tool = tools.observe(index, id.as_deref(), name.as_deref(), &arguments_fragment);
                    let mut call = serde_json::Map::new();
                    call.insert("index".into(), json!(tool.out_index));
                    if let Some(id) = tool.id {
                        call.insert("id".into(), json!(id));
                        call.insert("type".into(), json!("function"));
                    }
                    let mut function = serde_json::Map::new();
                    if let Some(name) = tool.name {
                        function.insert("name".into(), json!(name));
                    }
                    function.insert("arguments".into(), json!(tool.fragment));
                    call.insert("function".into(), Value::Object(function));

                    let delta = if first {
                        json!({"role": "assistant", "content": "", "tool_calls": [Value::Object(call)]})
                    } else {
                        json!({"tool_calls": [Value::Object(call)]})
                    };
                    first = false;
                    yield Ok(Event::default()
                        .data(chunk_envelope(&meta, delta, Value::Null).to_string()));
                }
                ChatEvent::Usage { prompt_tokens, completion_tokens } => {
                    usage.merge(prompt_tokens, completion_tokens);
                }
                ChatEvent::Error { kind, message } => {
                    let body = json!({"error": {"message": message, "type": kind, "code": 500}});
                    yield Ok(Event::default().data(body.to_string()));
                    errored = true;
                    break;
                }
            }
        }

        if !errored {
            let finish = if tools.is_empty() { "stop" } else { "tool_calls" };
            let mut final_chunk = chunk_envelope(&meta, json!({}), json!(finish));
            final_chunk["usage"] = usage.finalize(meta.prompt_estimate, completion_chars);
            yield Ok(Event::default().data(final_chunk.to_string()));
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream).into_response()
}

// --- one-shot JSON ---------------------------------------------------------

async fn json_response(meta: ResponseMeta, mut events: EventStream) -> Response {
    let mut content = String::new();
    let mut tools = ToolAccumulator::default();
    let mut usage = UsageTracker::default();

    while let Some(event) = events.next().await {
        match event {
            ChatEvent::Text(text) => content.push_str(&text),
            ChatEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_fragment,
                is_last: _,
            } => {
                tools.observe(index, id.as_deref(), name.as_deref(), &arguments_fragment);
            }
            ChatEvent::Usage {
                prompt_tokens,
                completion_tokens,
            } => usage.merge(prompt_tokens, completion_tokens),
            ChatEvent::Error { kind, message } => {
                let status = if kind == "rate_limit_error" {
                    StatusCode::TOO_MANY_REQUESTS
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                return error_response(status, &kind, &message);
            }
        }
    }

    let completion_chars = content.len();
    let finish = if tools.is_empty() { "stop" } else { "tool_calls" };
    let mut message = json!({"role": "assistant", "content": content});
    let completed = tools.completed();
    if !completed.is_empty() {
        message["tool_calls"] = json!(completed);
    }

    let body = json!({
        "id": format!("chatcmpl-{}", meta.request_id),
        "object": "chat.completion",
        "created": gateway_auth::now_millis() / 1000,
        "model": meta.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish,
        }],
        "usage": usage.finalize(meta.prompt_estimate, completion_chars),
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
