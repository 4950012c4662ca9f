//! Response stream decoding
//!
//! Turns the raw ConnectRPC byte stream into a flat sequence of events the
//! response assemblers consume. Error payloads arrive as JSON rather than
//! protobuf — the upstream writes `{"error": ...}` straight into a frame —
//! and terminate the stream.
//!
//! Inner response schema:
//! - field 2: StreamUnifiedChatResponse { 1: text } → a text delta
//! - field 1: tool-call event { 1: id, 2: name, 3: args fragment, 4: is_last }

use serde_json::Value;
use tracing::debug;

use crate::frame::FrameDecoder;
use crate::proto::{FieldValue, ProtoReader, lossy_string};

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorEvent {
    Text(String),
    ToolCall {
        id: String,
        name: Option<String>,
        arguments_fragment: String,
        is_last: bool,
    },
    /// Synthesised from an upstream error payload; terminates the stream
    Error { kind: String, message: String },
}

/// Stateful decoder over the chunked response body.
///
/// Frames may straddle chunk boundaries; the inner `FrameDecoder` buffers
/// the tail. After an error event the decoder goes quiet — the upstream
/// sends nothing meaningful past an error payload.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    frames: FrameDecoder,
    errored: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of body bytes, returning every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<CursorEvent> {
        if self.errored {
            return Vec::new();
        }
        let mut events = Vec::new();
        for payload in self.frames.push(chunk) {
            decode_payload(&payload, &mut events);
            if events
                .iter()
                .any(|e| matches!(e, CursorEvent::Error { .. }))
            {
                self.errored = true;
                break;
            }
        }
        events
    }
}

/// Decode one frame payload into events.
fn decode_payload(payload: &[u8], events: &mut Vec<CursorEvent>) {
    if payload.starts_with(b"{\"error\"") {
        events.push(synthesize_error(payload));
        return;
    }

    let mut reader = ProtoReader::new(payload);
    loop {
        match reader.next_field() {
            Ok(Some((2, FieldValue::Bytes(inner)))) => {
                if let Some(text) = decode_text(inner)
                    && !text.is_empty()
                {
                    events.push(CursorEvent::Text(text));
                }
            }
            Ok(Some((1, FieldValue::Bytes(inner)))) => {
                if let Some(event) = decode_tool_call(inner) {
                    events.push(event);
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                // A malformed frame ends this payload but not the stream
                debug!(error = %e, len = payload.len(), "undecodable response payload");
                break;
            }
        }
    }
}

/// StreamUnifiedChatResponse { 1: text }
fn decode_text(inner: &[u8]) -> Option<String> {
    let mut reader = ProtoReader::new(inner);
    while let Ok(Some((field, value))) = reader.next_field() {
        if field == 1
            && let FieldValue::Bytes(text) = value
        {
            return Some(lossy_string(text));
        }
    }
    None
}

/// Tool-call event { 1: id, 2: name, 3: args fragment, 4: is_last }
fn decode_tool_call(inner: &[u8]) -> Option<CursorEvent> {
    let mut id = None;
    let mut name = None;
    let mut arguments_fragment = String::new();
    let mut is_last = false;

    let mut reader = ProtoReader::new(inner);
    while let Ok(Some((field, value))) = reader.next_field() {
        match (field, value) {
            (1, FieldValue::Bytes(b)) => id = Some(lossy_string(b)),
            (2, FieldValue::Bytes(b)) => name = Some(lossy_string(b)),
            (3, FieldValue::Bytes(b)) => arguments_fragment = lossy_string(b),
            (4, FieldValue::Varint(v)) => is_last = v != 0,
            _ => {}
        }
    }

    id.map(|id| CursorEvent::ToolCall {
        id,
        name,
        arguments_fragment,
        is_last,
    })
}

/// Map an upstream JSON error payload to a normalised error event.
fn synthesize_error(payload: &[u8]) -> CursorEvent {
    let text = String::from_utf8_lossy(payload);
    match serde_json::from_str::<Value>(&text) {
        Ok(parsed) => {
            let error = parsed.get("error").cloned().unwrap_or(Value::Null);
            let code = error.get("code").and_then(Value::as_str).unwrap_or("");
            let kind = if code == "resource_exhausted" {
                "rate_limit_error"
            } else {
                "api_error"
            };
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| text.to_string());
            CursorEvent::Error {
                kind: kind.to_string(),
                message,
            }
        }
        Err(_) => CursorEvent::Error {
            kind: "api_error".to_string(),
            message: text.to_string(),
        },
    }
}
