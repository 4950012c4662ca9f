//! Static provider configuration
//!
//! Base URLs, chat paths, and refresh-endpoint overrides per provider. The
//! compiled-in defaults cover every known provider; the service config may
//! replace any field (and must, for the generic openai-compat and
//! anthropic-compat endpoints, which have no meaningful default host).

use gateway_auth::{ProviderKind, RefreshOverrides};

/// Per-provider static configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Ordered fallback URLs; the executor walks them on retryable failures
    pub base_urls: Vec<String>,
    pub chat_path: String,
    /// Token-endpoint overrides applied during refresh
    pub refresh: RefreshOverrides,
    /// Headers injected on every request to this provider
    pub headers: Vec<(String, String)>,
}

impl ProviderConfig {
    /// URL for the given fallback index, clamped to the last base URL.
    pub fn url_at(&self, index: usize) -> String {
        let base = self
            .base_urls
            .get(index)
            .or_else(|| self.base_urls.last())
            .map(String::as_str)
            .unwrap_or("");
        format!("{}{}", base.trim_end_matches('/'), self.chat_path)
    }
}

/// Compiled-in defaults for a provider.
pub fn default_config(kind: ProviderKind) -> ProviderConfig {
    let (base_urls, chat_path): (Vec<&str>, &str) = match kind {
        ProviderKind::Cursor => (
            vec!["https://api2.cursor.sh"],
            "/aiserver.v1.ChatService/StreamUnifiedChatWithTools",
        ),
        ProviderKind::Claude => (vec!["https://api.anthropic.com"], "/v1/messages"),
        ProviderKind::Codex => (
            vec!["https://chatgpt.com/backend-api/codex"],
            "/chat/completions",
        ),
        ProviderKind::GeminiCli => (
            vec!["https://cloudcode-pa.googleapis.com"],
            "/v1internal:streamGenerateContent?alt=sse",
        ),
        ProviderKind::Antigravity => (
            vec![
                "https://daily-cloudcode-pa.sandbox.googleapis.com",
                "https://cloudcode-pa.googleapis.com",
            ],
            "/v1internal:streamGenerateContent?alt=sse",
        ),
        ProviderKind::Github => (vec!["https://api.githubcopilot.com"], "/chat/completions"),
        ProviderKind::Kiro => (
            vec!["https://codewhisperer.us-east-1.amazonaws.com"],
            "/generateAssistantResponse",
        ),
        ProviderKind::Qwen => (vec!["https://portal.qwen.ai/v1"], "/chat/completions"),
        ProviderKind::Iflow => (vec!["https://apis.iflow.cn/v1"], "/chat/completions"),
        // Generic endpoints must be configured; empty base means "reject"
        ProviderKind::OpenaiCompat => (vec![], "/v1/chat/completions"),
        ProviderKind::AnthropicCompat => (vec![], "/v1/messages"),
    };

    ProviderConfig {
        base_urls: base_urls.into_iter().map(str::to_string).collect(),
        chat_path: chat_path.to_string(),
        refresh: RefreshOverrides::default(),
        headers: Vec::new(),
    }
}
