//! Model listing
//!
//! Static per-provider model tables, filtered by which providers currently
//! have at least one active connection. Combo names are appended so clients
//! can discover them alongside real models.

use gateway_auth::ProviderKind;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

fn model(id: &str, created: i64, owned_by: &str) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        object: "model".to_string(),
        created,
        owned_by: owned_by.to_string(),
    }
}

/// Known models served through a provider.
pub fn models_for(kind: ProviderKind) -> Vec<ModelInfo> {
    match kind {
        ProviderKind::Cursor => vec![
            model("cursor/gpt-4o", 1715299200, "cursor"),
            model("cursor/claude-4-sonnet", 1748476800, "cursor"),
            model("cursor/claude-4.5-sonnet", 1759104000, "cursor"),
            model("cursor/gemini-2.5-pro", 1750118400, "cursor"),
        ],
        ProviderKind::Claude => vec![
            model("claude/claude-3-5-haiku-20241022", 1729555200, "anthropic"),
            model("claude/claude-sonnet-4-20250514", 1715644800, "anthropic"),
            model("claude/claude-sonnet-4-5-20250929", 1759104000, "anthropic"),
            model("claude/claude-opus-4-5-20251101", 1761955200, "anthropic"),
        ],
        ProviderKind::Codex => vec![
            model("codex/gpt-5", 1754524800, "openai"),
            model("codex/gpt-5-codex", 1757894400, "openai"),
            model("codex/gpt-5.1", 1762905600, "openai"),
        ],
        ProviderKind::GeminiCli => vec![
            model("gemini-cli/gemini-2.5-pro", 1750118400, "google"),
            model("gemini-cli/gemini-2.5-flash", 1750118400, "google"),
            model("gemini-cli/gemini-3-pro-preview", 1737158400, "google"),
        ],
        ProviderKind::Antigravity => vec![
            model("antigravity/gemini-3-pro-high", 1737158400, "antigravity"),
            model("antigravity/gemini-3-flash", 1765929600, "antigravity"),
            model("antigravity/claude-sonnet-4-5", 1759104000, "antigravity"),
        ],
        ProviderKind::Github => vec![
            model("github/gpt-4o", 1715299200, "github"),
            model("github/claude-3.5-sonnet", 1729555200, "github"),
            model("github/o3-mini", 1737763200, "github"),
        ],
        ProviderKind::Kiro => vec![
            model("kiro/claude-sonnet-4-20250514", 1715644800, "kiro"),
            model("kiro/claude-sonnet-4-5-20250929", 1759104000, "kiro"),
        ],
        ProviderKind::Qwen => vec![
            model("qwen/qwen3-coder-plus", 1753142400, "alibaba"),
            model("qwen/qwen3-coder-flash", 1753142400, "alibaba"),
        ],
        ProviderKind::Iflow => vec![
            model("iflow/qwen3-coder", 1753142400, "iflow"),
            model("iflow/kimi-k2", 1752192000, "iflow"),
            model("iflow/deepseek-v3.1", 1755561600, "iflow"),
        ],
        // Generic endpoints serve whatever the operator points them at
        ProviderKind::OpenaiCompat | ProviderKind::AnthropicCompat => vec![],
    }
}

/// Build the `/v1/models` response for the currently usable providers.
pub fn models_response(
    active_providers: &[ProviderKind],
    combo_names: impl Iterator<Item = String>,
) -> ModelsResponse {
    let mut data: Vec<ModelInfo> = active_providers
        .iter()
        .flat_map(|kind| models_for(*kind))
        .collect();
    for name in combo_names {
        data.push(model(&name, 1735689600, "combo"));
    }
    ModelsResponse {
        object: "list".to_string(),
        data,
    }
}
