//! Normalised stream events
//!
//! Every provider's response — OpenAI SSE, Anthropic SSE, Gemini SSE, or
//! Cursor's binary frames — is reduced to this one event vocabulary. The
//! SSE assembler and the one-shot JSON assembler both consume it, differing
//! only in serialisation.

/// One normalised chat event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A text delta appended to the assistant message
    Text(String),
    /// A tool-call argument fragment
    ToolCallDelta {
        /// OpenAI-style index; assigned by the source when it has one
        index: Option<usize>,
        /// Stable call id; always present for Cursor, first-fragment-only
        /// for OpenAI upstreams
        id: Option<String>,
        /// Function name, on the fragment that introduced it
        name: Option<String>,
        arguments_fragment: String,
        is_last: bool,
    },
    /// Real token usage reported by the upstream
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// Upstream emitted an error mid-stream; terminates the response
    Error { kind: String, message: String },
}

impl ChatEvent {
    pub fn text(s: impl Into<String>) -> Self {
        ChatEvent::Text(s.into())
    }
}
