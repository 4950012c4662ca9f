//! Request body transforms
//!
//! The ingress body is OpenAI chat-completion JSON. OpenAI-compatible
//! upstreams take it nearly verbatim (stream flag forced on — the gateway
//! always streams from upstream and aggregates locally for non-streaming
//! clients). Claude and Gemini upstreams need a structural rewrite.

use serde_json::{Map, Value, json};

const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Pass the OpenAI body through, forcing `stream: true` and dropping
/// fields the upstream would reject.
pub fn openai_passthrough(model: &str, body: &Value) -> Value {
    let mut out = body.as_object().cloned().unwrap_or_else(Map::new);
    out.insert("model".into(), json!(model));
    out.insert("stream".into(), json!(true));
    // Usage in the final chunk, so local estimation is a fallback only
    out.insert("stream_options".into(), json!({"include_usage": true}));
    Value::Object(out)
}

/// OpenAI chat body → Anthropic messages body.
///
/// System messages move to the top-level `system` field; consecutive text
/// content is preserved as plain strings. `reasoning_effort` is dropped
/// (Anthropic models it differently).
pub fn openai_to_anthropic(model: &str, body: &Value) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in body
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = flatten_text(message.get("content"));
        match role {
            "system" => system_parts.push(content),
            "assistant" => messages.push(json!({"role": "assistant", "content": content})),
            _ => messages.push(json!({"role": "user", "content": content})),
        }
    }

    let mut out = json!({
        "model": model,
        "messages": messages,
        "max_tokens": body.get("max_tokens").and_then(Value::as_u64).unwrap_or(DEFAULT_MAX_TOKENS),
        "stream": true,
    });
    if !system_parts.is_empty() {
        out["system"] = json!(system_parts.join("\n"));
    }
    if let Some(temperature) = body.get("temperature").and_then(Value::as_f64) {
        out["temperature"] = json!(temperature);
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(json!({
                    "name": function.get("name")?,
                    "description": function.get("description").cloned().unwrap_or(json!("")),
                    "input_schema": function.get("parameters").cloned()
                        .unwrap_or(json!({"type": "object", "properties": {}})),
                }))
            })
            .collect();
        if !mapped.is_empty() {
            out["tools"] = json!(mapped);
        }
    }
    out
}

/// OpenAI chat body → Cloud Code generate-content body.
///
/// The Cloud Code endpoints wrap the Gemini request in
/// `{model, project?, request}`; roles map user→user, assistant→model, and
/// system messages become `systemInstruction`.
pub fn openai_to_gemini(model: &str, body: &Value, project_id: Option<&str>) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in body
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = flatten_text(message.get("content"));
        match role {
            "system" => system_parts.push(text),
            "assistant" => {
                contents.push(json!({"role": "model", "parts": [{"text": text}]}));
            }
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    let mut request = json!({"contents": contents});
    if !system_parts.is_empty() {
        request["systemInstruction"] = json!({"parts": [{"text": system_parts.join("\n")}]});
    }
    let mut generation_config = Map::new();
    if let Some(temperature) = body.get("temperature").and_then(Value::as_f64) {
        generation_config.insert("temperature".into(), json!(temperature));
    }
    if let Some(max_tokens) = body.get("max_tokens").and_then(Value::as_u64) {
        generation_config.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if !generation_config.is_empty() {
        request["generationConfig"] = Value::Object(generation_config);
    }

    let mut out = json!({"model": model, "request": request});
    if let Some(project) = project_id {
        out["project"] = json!(project);
    }
    out
}

/// Concatenate the text of a string or multi-part content value.
fn flatten_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}
