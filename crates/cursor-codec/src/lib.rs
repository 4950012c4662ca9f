//! Cursor wire codec
//!
//! Cursor's chat API speaks ConnectRPC: each message on the wire is a
//! one-byte flags field, a 32-bit big-endian length, and a protobuf payload
//! that may be gzip-compressed. This crate owns both directions —
//! encoding an OpenAI-shaped chat request into a framed protobuf body, and
//! decoding the streamed response frames into text and tool-call events —
//! plus the checksum/session header material the API authenticates with.
//!
//! The protobuf layer is a minimal varint/length-delimited writer and
//! reader: the schema is a fixed field table with no evolution story, so
//! the wire constants live next to the encoder rather than in generated
//! code.

pub mod checksum;
pub mod decode;
pub mod error;
pub mod frame;
pub mod proto;
pub mod request;
pub mod toolcall;

pub use checksum::{clean_token, client_key, cursor_checksum, jyh_encode, session_id};
pub use decode::{CursorEvent, StreamDecoder};
pub use error::{Error, Result};
pub use frame::{FLAG_GZIP, FLAG_RAW, FrameDecoder, encode_frame};
pub use request::{ChatMessage, Role, encode_chat_request, messages_from_openai};
pub use toolcall::{CompletedToolCall, ToolCallAssembler, ToolCallDelta};
