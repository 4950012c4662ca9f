//! OAuth endpoint constants per provider
//!
//! Public OAuth client configuration matching the respective vendor CLIs.
//! These values are not secrets — they identify the public client
//! applications. The actual secrets (access/refresh tokens) live in the
//! connection store. Provider config may override any of them.

/// Anthropic's public OAuth client ID (same as the Claude CLI)
pub const CLAUDE_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Token endpoint for Claude token refresh
pub const CLAUDE_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

/// OpenAI's public OAuth client ID (same as the Codex CLI)
pub const CODEX_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Token endpoint for Codex token refresh
pub const CODEX_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";

/// Scope requested on Codex refresh
pub const CODEX_SCOPE: &str = "openid profile email offline_access";

/// Google OAuth client pair used by the Gemini CLI
pub const GEMINI_CLI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const GEMINI_CLI_CLIENT_SECRET: &str = "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";

/// Google OAuth client pair used by Antigravity
pub const ANTIGRAVITY_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
pub const ANTIGRAVITY_CLIENT_SECRET: &str = "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";

/// Shared Google token endpoint (Gemini CLI and Antigravity)
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Qwen public OAuth client
pub const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
pub const QWEN_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";

/// iFlow public OAuth client (refresh uses HTTP Basic with this pair)
pub const IFLOW_CLIENT_ID: &str = "10009311001";
pub const IFLOW_CLIENT_SECRET: &str = "4Z3YjXycVsQvyGF6etEUOvZdfLnfSqP3";
pub const IFLOW_TOKEN_URL: &str = "https://iflow.cn/oauth/token";

/// GitHub public OAuth client (gh CLI application)
pub const GITHUB_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
pub const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";

/// GitHub API base for the Copilot session-token exchange
pub const GITHUB_API_BASE: &str = "https://api.github.com";

/// Editor identity headers required by the Copilot token endpoint
pub const COPILOT_EDITOR_VERSION: &str = "vscode/1.96.2";
pub const COPILOT_USER_AGENT: &str = "GitHubCopilotChat/0.26.7";

/// Kiro social-auth refresh endpoint (desktop login flavour)
pub const KIRO_SOCIAL_REFRESH_URL: &str =
    "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";

/// Region used for AWS SSO OIDC when the connection carries none
pub const KIRO_DEFAULT_REGION: &str = "us-east-1";

/// AWS SSO OIDC token endpoint for a region.
pub fn kiro_oidc_token_url(region: &str) -> String {
    format!("https://oidc.{region}.amazonaws.com/token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kiro_oidc_url_embeds_region() {
        assert_eq!(
            kiro_oidc_token_url("eu-west-1"),
            "https://oidc.eu-west-1.amazonaws.com/token"
        );
        assert_eq!(
            kiro_oidc_token_url(KIRO_DEFAULT_REGION),
            "https://oidc.us-east-1.amazonaws.com/token"
        );
    }
}
