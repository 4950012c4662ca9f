//! Chat request encoding
//!
//! Builds the nested protobuf request Cursor expects and wraps it in one
//! ConnectRPC frame. The payload is gzip-compressed once the conversation
//! reaches three messages; shorter requests go out raw.
//!
//! Role handling: Cursor only knows user (1) and assistant (2). System
//! messages are rewritten into user messages with a `[System Instructions]`
//! banner so their content survives the translation.

use serde_json::Value;
use uuid::Uuid;

use crate::frame::encode_frame;
use crate::proto::ProtoWriter;

/// Conversation length at which the payload is gzip-compressed.
const GZIP_THRESHOLD: usize = 3;

const ROLE_USER: u64 = 1;
const ROLE_ASSISTANT: u64 = 2;

/// Chat mode written on user messages (field 47): 1 = "Ask".
const CHAT_MODE_ASK: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn wire_value(self) -> u64 {
        match self {
            Role::User => ROLE_USER,
            Role::Assistant => ROLE_ASSISTANT,
        }
    }
}

/// One normalised message ready for encoding.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Normalise OpenAI-shaped messages for the Cursor wire.
///
/// System messages become user messages prefixed `[System Instructions]\n`.
/// Array content keeps only the `type: "text"` parts, concatenated in order.
/// Unknown roles are treated as user input.
pub fn messages_from_openai(messages: &[Value]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|message| {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = flatten_content(message.get("content"));
            match role {
                "assistant" => ChatMessage {
                    role: Role::Assistant,
                    content,
                },
                "system" => ChatMessage {
                    role: Role::User,
                    content: format!("[System Instructions]\n{content}"),
                },
                _ => ChatMessage {
                    role: Role::User,
                    content,
                },
            }
        })
        .collect()
}

fn flatten_content(content: Option<&Value>) -> String {
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

/// Encode a chat request into one framed ConnectRPC message.
///
/// `instruction` becomes the request-level instruction text (empty when the
/// caller has none). Message ids are random per call, as the upstream
/// expects unique ids per request.
pub fn encode_chat_request(
    model: &str,
    messages: &[ChatMessage],
    instruction: Option<&str>,
) -> Vec<u8> {
    let message_ids: Vec<String> = messages.iter().map(|_| Uuid::new_v4().to_string()).collect();

    let mut request = ProtoWriter::new();

    // 1: repeated Message
    for (message, id) in messages.iter().zip(&message_ids) {
        let mut msg = ProtoWriter::new();
        msg.string(1, &message.content);
        msg.varint(2, message.role.wire_value());
        msg.string(13, id);
        if message.role == Role::User {
            msg.varint(47, CHAT_MODE_ASK);
        }
        request.message(1, msg);
    }

    request.varint(2, 1);

    // 3: Instruction { 1: text }
    let mut instruction_msg = ProtoWriter::new();
    instruction_msg.string(1, instruction.unwrap_or(""));
    request.message(3, instruction_msg);

    request.varint(4, 1);

    // 5: Model { 1: name, 4: empty }
    let mut model_msg = ProtoWriter::new();
    model_msg.string(1, model);
    model_msg.string(4, "");
    request.message(5, model_msg);

    request.string(8, "");
    request.varint(13, 1);
    request.message(15, cursor_setting());
    request.varint(19, 1);
    request.string(23, &Uuid::new_v4().to_string());
    request.message(26, metadata());
    request.varint(27, 0);

    // 30: repeated MessageId { 1: id, 3: role }
    for (message, id) in messages.iter().zip(&message_ids) {
        let mut id_msg = ProtoWriter::new();
        id_msg.string(1, id);
        id_msg.varint(3, message.role.wire_value());
        request.message(30, id_msg);
    }

    request.varint(35, 0);
    request.varint(38, 0);
    request.varint(46, 1);
    request.string(47, "");
    request.varint(48, 0);
    request.varint(49, 0);
    request.varint(51, 0);
    request.varint(53, 1);
    request.string(54, "Ask");

    let mut payload = ProtoWriter::new();
    payload.message(1, request);

    encode_frame(&payload.into_bytes(), messages.len() >= GZIP_THRESHOLD)
}

/// 15: CursorSetting { 1: name, 3: "", 6: { 1: "", 2: "" }, 8: 1, 9: 1 }
fn cursor_setting() -> ProtoWriter {
    let mut setting = ProtoWriter::new();
    setting.string(1, "cursor\\aisettings");
    setting.string(3, "");
    let mut unknown6 = ProtoWriter::new();
    unknown6.string(1, "");
    unknown6.string(2, "");
    setting.message(6, unknown6);
    setting.varint(8, 1);
    setting.varint(9, 1);
    setting
}

/// 26: Metadata { os, arch, runtime version, cwd, timestamp }
fn metadata() -> ProtoWriter {
    let mut meta = ProtoWriter::new();
    meta.string(1, std::env::consts::OS);
    meta.string(2, std::env::consts::ARCH);
    meta.string(3, env!("CARGO_PKG_VERSION"));
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "/".to_string());
    meta.string(4, &cwd);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string();
    meta.string(5, &timestamp);
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FLAG_GZIP, FLAG_RAW, FrameDecoder};
    use crate::proto::{FieldValue, ProtoReader, lossy_string};
    use serde_json::json;

    fn user(content: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    fn decode_request(frame: &[u8]) -> Vec<u8> {
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(frame);
        assert_eq!(payloads.len(), 1);
        // payload = { 1: Request }
        let payload = &payloads[0];
        let mut reader = ProtoReader::new(payload);
        let (field, value) = reader.next_field().unwrap().unwrap();
        assert_eq!(field, 1);
        match value {
            FieldValue::Bytes(b) => b.to_vec(),
            other => panic!("expected request message, got {other:?}"),
        }
    }

    #[test]
    fn two_messages_stay_uncompressed() {
        let frame = encode_chat_request("gpt-4o", &[user("a"), user("b")], None);
        assert_eq!(frame[0], FLAG_RAW);
    }

    #[test]
    fn three_messages_trigger_gzip() {
        let frame = encode_chat_request("gpt-4o", &[user("a"), user("b"), user("c")], None);
        assert_eq!(frame[0], FLAG_GZIP);
        // And the frame still decodes through the tolerant path
        let request = decode_request(&frame);
        assert!(!request.is_empty());
    }

    #[test]
    fn encoded_request_carries_model_and_messages() {
        let messages = vec![user("hello"), ChatMessage {
            role: Role::Assistant,
            content: "hi there".into(),
        }];
        let frame = encode_chat_request("claude-4-sonnet", &messages, None);
        let request = decode_request(&frame);

        let mut reader = ProtoReader::new(&request);
        let mut seen_contents = Vec::new();
        let mut seen_roles = Vec::new();
        let mut model_name = None;
        let mut message_id_count = 0;
        let mut mode_label = None;

        while let Some((field, value)) = reader.next_field().unwrap() {
            match (field, value) {
                (1, FieldValue::Bytes(msg)) => {
                    let mut inner = ProtoReader::new(msg);
                    while let Some((f, v)) = inner.next_field().unwrap() {
                        match (f, v) {
                            (1, FieldValue::Bytes(content)) => {
                                seen_contents.push(lossy_string(content));
                            }
                            (2, FieldValue::Varint(role)) => seen_roles.push(role),
                            _ => {}
                        }
                    }
                }
                (5, FieldValue::Bytes(model)) => {
                    let mut inner = ProtoReader::new(model);
                    while let Some((f, v)) = inner.next_field().unwrap() {
                        if f == 1
                            && let FieldValue::Bytes(name) = v
                        {
                            model_name = Some(lossy_string(name));
                        }
                    }
                }
                (30, FieldValue::Bytes(_)) => message_id_count += 1,
                (54, FieldValue::Bytes(label)) => mode_label = Some(lossy_string(label)),
                _ => {}
            }
        }

        assert_eq!(seen_contents, vec!["hello", "hi there"]);
        assert_eq!(seen_roles, vec![ROLE_USER, ROLE_ASSISTANT]);
        assert_eq!(model_name.as_deref(), Some("claude-4-sonnet"));
        assert_eq!(message_id_count, 2);
        assert_eq!(mode_label.as_deref(), Some("Ask"));
    }

    #[test]
    fn system_message_rewritten_to_user() {
        let messages = messages_from_openai(&[
            json!({"role": "system", "content": "be terse"}),
            json!({"role": "user", "content": "hi"}),
        ]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "[System Instructions]\nbe terse");
        assert_eq!(messages[1].content, "hi");
    }

    #[test]
    fn multipart_content_keeps_only_text_parts() {
        let messages = messages_from_openai(&[json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look at "},
                {"type": "image_url", "image_url": {"url": "data:..."}},
                {"type": "text", "text": "this"},
            ]
        })]);
        assert_eq!(messages[0].content, "look at this");
    }

    #[test]
    fn unknown_role_defaults_to_user() {
        let messages = messages_from_openai(&[json!({"role": "tool", "content": "result"})]);
        assert_eq!(messages[0].role, Role::User);
    }

    #[test]
    fn missing_content_becomes_empty_string() {
        let messages = messages_from_openai(&[json!({"role": "user"})]);
        assert_eq!(messages[0].content, "");
    }

    #[test]
    fn instruction_is_encoded_when_present() {
        let frame = encode_chat_request("m", &[user("x")], Some("keep answers short"));
        let request = decode_request(&frame);
        let mut reader = ProtoReader::new(&request);
        let mut instruction = None;
        while let Some((field, value)) = reader.next_field().unwrap() {
            if field == 3
                && let FieldValue::Bytes(inner) = value
            {
                let mut inner_reader = ProtoReader::new(inner);
                while let Some((f, v)) = inner_reader.next_field().unwrap() {
                    if f == 1
                        && let FieldValue::Bytes(text) = v
                    {
                        instruction = Some(lossy_string(text));
                    }
                }
            }
        }
        assert_eq!(instruction.as_deref(), Some("keep answers short"));
    }
}
