//! Upstream SSE parsing
//!
//! Splits a chunked byte stream into `data:` payloads and maps each payload
//! into normalised events. Three dialects cover the HTTP providers:
//! OpenAI-compatible chunks (codex, github, kiro, qwen, iflow,
//! openai-compat), Anthropic message events (claude, anthropic-compat), and
//! Gemini generate-content chunks (gemini-cli, antigravity).

use gateway_auth::ProviderKind;
use serde_json::Value;

use crate::events::ChatEvent;

/// Which response vocabulary an upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Openai,
    Anthropic,
    Gemini,
}

impl Dialect {
    pub fn for_provider(kind: ProviderKind) -> Dialect {
        match kind {
            ProviderKind::Claude | ProviderKind::AnthropicCompat => Dialect::Anthropic,
            ProviderKind::GeminiCli | ProviderKind::Antigravity => Dialect::Gemini,
            // Cursor never reaches the SSE path, but the OpenAI mapping is
            // the harmless default
            _ => Dialect::Openai,
        }
    }
}

/// Incremental `data:` line extractor over chunked bytes.
///
/// Buffers raw bytes so multi-byte UTF-8 sequences split across transport
/// chunks survive intact; lines only decode once a `\n` completes them.
/// The `[DONE]` sentinel is swallowed — end of stream is signalled by the
/// transport, not by an event.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buf.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() && data != "[DONE]" {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// Map one `data:` payload into events for the given dialect.
pub fn parse_data(dialect: Dialect, data: &str) -> Vec<ChatEvent> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        // Non-JSON keepalives and comments are dropped
        Err(_) => return Vec::new(),
    };
    match dialect {
        Dialect::Openai => parse_openai(&value),
        Dialect::Anthropic => parse_anthropic(&value),
        Dialect::Gemini => parse_gemini(&value),
    }
}

fn parse_openai(value: &Value) -> Vec<ChatEvent> {
    let mut events = Vec::new();

    if let Some(error) = value.get("error") {
        events.push(ChatEvent::Error {
            kind: error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("api_error")
                .to_string(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string(),
        });
        return events;
    }

    if let Some(delta) = value
        .pointer("/choices/0/delta")
        .and_then(Value::as_object)
    {
        if let Some(content) = delta.get("content").and_then(Value::as_str)
            && !content.is_empty()
        {
            events.push(ChatEvent::text(content));
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in tool_calls {
                events.push(ChatEvent::ToolCallDelta {
                    index: call.get("index").and_then(Value::as_u64).map(|i| i as usize),
                    id: call.get("id").and_then(Value::as_str).map(str::to_string),
                    name: call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    arguments_fragment: call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    is_last: false,
                });
            }
        }
    }

    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        events.push(ChatEvent::Usage {
            prompt_tokens: usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });
    }

    events
}

fn parse_anthropic(value: &Value) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    match value.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            match value.pointer("/delta/type").and_then(Value::as_str) {
                Some("text_delta") => {
                    if let Some(text) = value.pointer("/delta/text").and_then(Value::as_str)
                        && !text.is_empty()
                    {
                        events.push(ChatEvent::text(text));
                    }
                }
                Some("input_json_delta") => {
                    events.push(ChatEvent::ToolCallDelta {
                        index: value.get("index").and_then(Value::as_u64).map(|i| i as usize),
                        id: None,
                        name: None,
                        arguments_fragment: value
                            .pointer("/delta/partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        is_last: false,
                    });
                }
                _ => {}
            }
        }
        Some("content_block_start") => {
            if value.pointer("/content_block/type").and_then(Value::as_str) == Some("tool_use") {
                events.push(ChatEvent::ToolCallDelta {
                    index: value.get("index").and_then(Value::as_u64).map(|i| i as usize),
                    id: value
                        .pointer("/content_block/id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    name: value
                        .pointer("/content_block/name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    arguments_fragment: String::new(),
                    is_last: false,
                });
            }
        }
        Some("content_block_stop") => {
            events.push(ChatEvent::ToolCallDelta {
                index: value.get("index").and_then(Value::as_u64).map(|i| i as usize),
                id: None,
                name: None,
                arguments_fragment: String::new(),
                is_last: true,
            });
        }
        Some("message_start") => {
            if let Some(input) = value
                .pointer("/message/usage/input_tokens")
                .and_then(Value::as_u64)
            {
                events.push(ChatEvent::Usage {
                    prompt_tokens: input,
                    completion_tokens: 0,
                });
            }
        }
        Some("message_delta") => {
            if let Some(output) = value.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                events.push(ChatEvent::Usage {
                    prompt_tokens: 0,
                    completion_tokens: output,
                });
            }
        }
        Some("error") => {
            events.push(ChatEvent::Error {
                kind: value
                    .pointer("/error/type")
                    .and_then(Value::as_str)
                    .unwrap_or("api_error")
                    .to_string(),
                message: value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error")
                    .to_string(),
            });
        }
        _ => {}
    }
    events
}

fn parse_gemini(value: &Value) -> Vec<ChatEvent> {
    // Cloud Code wraps the payload in {"response": ...}; plain Gemini doesn't
    let body = value.get("response").unwrap_or(value);
    let mut events = Vec::new();

    if let Some(parts) = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str)
                && !text.is_empty()
                && part.get("thought").and_then(Value::as_bool) != Some(true)
            {
                events.push(ChatEvent::text(text));
            }
            if let Some(call) = part.get("functionCall") {
                let args = call.get("args").cloned().unwrap_or(Value::Null);
                events.push(ChatEvent::ToolCallDelta {
                    index: None,
                    id: None,
                    name: call.get("name").and_then(Value::as_str).map(str::to_string),
                    arguments_fragment: args.to_string(),
                    is_last: true,
                });
            }
        }
    }

    if let Some(usage) = body.get("usageMetadata") {
        events.push(ChatEvent::Usage {
            prompt_tokens: usage
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            completion_tokens: usage
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_buffer_extracts_data_payloads() {
        let mut buf = SseLineBuffer::new();
        let payloads = buf.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(payloads, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn line_buffer_handles_split_lines() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: {\"par").is_empty());
        let payloads = buf.push(b"tial\":true}\n");
        assert_eq!(payloads, vec![r#"{"partial":true}"#]);
    }

    #[test]
    fn line_buffer_swallows_done_and_comments() {
        let mut buf = SseLineBuffer::new();
        let payloads = buf.push(b": keepalive\ndata: [DONE]\nevent: ping\ndata: {}\n");
        assert_eq!(payloads, vec!["{}"]);
    }

    #[test]
    fn line_buffer_handles_crlf() {
        let mut buf = SseLineBuffer::new();
        let payloads = buf.push(b"data: {\"x\":1}\r\n\r\n");
        assert_eq!(payloads, vec![r#"{"x":1}"#]);
    }

    #[test]
    fn openai_text_delta() {
        let data = json!({"choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]});
        let events = parse_data(Dialect::Openai, &data.to_string());
        assert_eq!(events, vec![ChatEvent::text("hi")]);
    }

    #[test]
    fn openai_tool_call_delta() {
        let data = json!({"choices":[{"index":0,"delta":{"tool_calls":[
            {"index":0,"id":"call_1","type":"function","function":{"name":"f","arguments":"{\"a\""}}
        ]}}]});
        let events = parse_data(Dialect::Openai, &data.to_string());
        assert_eq!(
            events,
            vec![ChatEvent::ToolCallDelta {
                index: Some(0),
                id: Some("call_1".into()),
                name: Some("f".into()),
                arguments_fragment: "{\"a\"".into(),
                is_last: false,
            }]
        );
    }

    #[test]
    fn openai_usage_event() {
        let data = json!({"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":5}});
        let events = parse_data(Dialect::Openai, &data.to_string());
        assert_eq!(
            events,
            vec![ChatEvent::Usage {
                prompt_tokens: 12,
                completion_tokens: 5
            }]
        );
    }

    #[test]
    fn openai_error_payload() {
        let data = json!({"error":{"type":"rate_limit_error","message":"slow down"}});
        let events = parse_data(Dialect::Openai, &data.to_string());
        assert_eq!(
            events,
            vec![ChatEvent::Error {
                kind: "rate_limit_error".into(),
                message: "slow down".into()
            }]
        );
    }

    #[test]
    fn anthropic_text_delta() {
        let data =
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hey"}});
        let events = parse_data(Dialect::Anthropic, &data.to_string());
        assert_eq!(events, vec![ChatEvent::text("hey")]);
    }

    #[test]
    fn anthropic_tool_use_sequence() {
        let start = json!({"type":"content_block_start","index":1,
            "content_block":{"type":"tool_use","id":"toolu_1","name":"search"}});
        let delta = json!({"type":"content_block_delta","index":1,
            "delta":{"type":"input_json_delta","partial_json":"{\"q\":\"x\"}"}});
        let stop = json!({"type":"content_block_stop","index":1});

        let mut events = parse_data(Dialect::Anthropic, &start.to_string());
        events.extend(parse_data(Dialect::Anthropic, &delta.to_string()));
        events.extend(parse_data(Dialect::Anthropic, &stop.to_string()));

        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            ChatEvent::ToolCallDelta { id: Some(id), name: Some(name), .. }
                if id == "toolu_1" && name == "search"
        ));
        assert!(matches!(
            &events[1],
            ChatEvent::ToolCallDelta { arguments_fragment, .. } if arguments_fragment == "{\"q\":\"x\"}"
        ));
        assert!(matches!(
            &events[2],
            ChatEvent::ToolCallDelta { is_last: true, .. }
        ));
    }

    #[test]
    fn anthropic_usage_from_message_events() {
        let start = json!({"type":"message_start","message":{"usage":{"input_tokens":30}}});
        let delta = json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},
            "usage":{"output_tokens":11}});
        let mut events = parse_data(Dialect::Anthropic, &start.to_string());
        events.extend(parse_data(Dialect::Anthropic, &delta.to_string()));
        assert_eq!(
            events,
            vec![
                ChatEvent::Usage {
                    prompt_tokens: 30,
                    completion_tokens: 0
                },
                ChatEvent::Usage {
                    prompt_tokens: 0,
                    completion_tokens: 11
                },
            ]
        );
    }

    #[test]
    fn gemini_text_and_usage() {
        let data = json!({"response":{
            "candidates":[{"content":{"parts":[{"text":"answer"}]}}],
            "usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":3}
        }});
        let events = parse_data(Dialect::Gemini, &data.to_string());
        assert_eq!(
            events,
            vec![
                ChatEvent::text("answer"),
                ChatEvent::Usage {
                    prompt_tokens: 7,
                    completion_tokens: 3
                }
            ]
        );
    }

    #[test]
    fn gemini_unwrapped_payload_and_thoughts() {
        let data = json!({"candidates":[{"content":{"parts":[
            {"text":"internal","thought":true},
            {"text":"visible"}
        ]}}]});
        let events = parse_data(Dialect::Gemini, &data.to_string());
        assert_eq!(events, vec![ChatEvent::text("visible")]);
    }

    #[test]
    fn gemini_function_call_is_single_complete_tool_event() {
        let data = json!({"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"get_time","args":{"tz":"UTC"}}}
        ]}}]});
        let events = parse_data(Dialect::Gemini, &data.to_string());
        assert_eq!(
            events,
            vec![ChatEvent::ToolCallDelta {
                index: None,
                id: None,
                name: Some("get_time".into()),
                arguments_fragment: r#"{"tz":"UTC"}"#.into(),
                is_last: true,
            }]
        );
    }

    #[test]
    fn non_json_payload_is_dropped() {
        assert!(parse_data(Dialect::Openai, "not-json").is_empty());
    }

    #[test]
    fn dialect_mapping() {
        assert_eq!(
            Dialect::for_provider(ProviderKind::Claude),
            Dialect::Anthropic
        );
        assert_eq!(
            Dialect::for_provider(ProviderKind::Antigravity),
            Dialect::Gemini
        );
        assert_eq!(Dialect::for_provider(ProviderKind::Qwen), Dialect::Openai);
        assert_eq!(Dialect::for_provider(ProviderKind::Github), Dialect::Openai);
    }
}
