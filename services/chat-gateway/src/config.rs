//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Provider entries override the compiled-in defaults field by field, so a
//! minimal config only names what actually differs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use gateway_auth::{ProviderKind, RefreshOverrides, Settings};
use gateway_pool::CooldownConfig;
use provider::{ProviderConfig, default_config};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
    /// Combo name → ordered `provider/model` targets
    #[serde(default)]
    pub combos: HashMap<String, Vec<String>>,
    /// Bare model alias → `provider/model` target
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderOverride>,
}

/// HTTP server settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Connection store settings
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// Per-provider override block; unset fields keep compiled-in defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderOverride {
    #[serde(default)]
    pub base_urls: Option<Vec<String>>,
    #[serde(default)]
    pub chat_path: Option<String>,
    #[serde(default)]
    pub refresh_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<common::Secret<String>>,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// Header to inject into upstream requests for one provider
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        // Unknown provider keys fail fast at startup instead of silently
        // never matching a request.
        for key in config.providers.keys() {
            ProviderKind::from_str(key)
                .map_err(|e| common::Error::Config(format!("[providers.{key}]: {e}")))?;
        }

        // Combo targets and aliases must be in provider/model shape with a
        // known provider tag.
        for (name, targets) in &config.combos {
            if targets.is_empty() {
                return Err(common::Error::Config(format!(
                    "combo '{name}' has no target models"
                )));
            }
            for target in targets {
                validate_target(target)
                    .map_err(|e| common::Error::Config(format!("combo '{name}': {e}")))?;
            }
        }
        for (alias, target) in &config.aliases {
            validate_target(target)
                .map_err(|e| common::Error::Config(format!("alias '{alias}': {e}")))?;
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("chat-gateway.toml")
    }

    /// Effective per-provider configs: compiled-in defaults patched by the
    /// override blocks.
    pub fn provider_configs(&self) -> HashMap<ProviderKind, ProviderConfig> {
        let mut configs = HashMap::new();
        for (key, patch) in &self.providers {
            let kind = match ProviderKind::from_str(key) {
                Ok(kind) => kind,
                // Validated at load; skip defensively if constructed by hand
                Err(_) => continue,
            };
            let mut config = default_config(kind);
            if let Some(base_urls) = &patch.base_urls {
                config.base_urls = base_urls.clone();
            }
            if let Some(chat_path) = &patch.chat_path {
                config.chat_path = chat_path.clone();
            }
            config.refresh = RefreshOverrides {
                refresh_url: patch.refresh_url.clone(),
                client_id: patch.client_id.clone(),
                client_secret: patch.client_secret.as_ref().map(|s| s.expose().clone()),
            };
            config.headers = patch
                .headers
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect();
            configs.insert(kind, config);
        }
        configs
    }
}

fn validate_target(target: &str) -> Result<(), String> {
    let (provider, model) = target
        .split_once('/')
        .ok_or_else(|| format!("'{target}' is not in provider/model form"))?;
    ProviderKind::from_str(provider)?;
    if model.is_empty() {
        return Err(format!("'{target}' has an empty model name"));
    }
    Ok(())
}
