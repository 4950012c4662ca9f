//! Executor registry
//!
//! Maps provider tags to executor instances. Executors are stateless apart
//! from their config and shared HTTP client, so defaults are constructed
//! lazily on first use and cached for the life of the process. Custom
//! per-provider configuration is supplied at construction; anything absent
//! falls back to the compiled-in defaults.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use gateway_auth::ProviderKind;

use crate::config::{ProviderConfig, default_config};
use crate::cursor::CursorExecutor;
use crate::http::HttpExecutor;
use crate::Executor;

pub struct Registry {
    client: reqwest::Client,
    configs: HashMap<ProviderKind, ProviderConfig>,
    cache: RwLock<HashMap<ProviderKind, Arc<dyn Executor>>>,
}

impl Registry {
    /// Build a registry with per-provider config overrides.
    pub fn new(client: reqwest::Client, configs: HashMap<ProviderKind, ProviderConfig>) -> Self {
        Self {
            client,
            configs,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Effective config for a provider (override or compiled-in default).
    pub fn config_for(&self, kind: ProviderKind) -> ProviderConfig {
        self.configs
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| default_config(kind))
    }

    /// The executor serving a provider, constructing and caching on first use.
    pub fn executor(&self, kind: ProviderKind) -> Arc<dyn Executor> {
        if let Some(executor) = self.cache.read().expect("registry lock").get(&kind) {
            return executor.clone();
        }

        let config = self.config_for(kind);
        let executor: Arc<dyn Executor> = match kind {
            ProviderKind::Cursor => Arc::new(CursorExecutor::new(config, self.client.clone())),
            _ => Arc::new(HttpExecutor::new(kind, config, self.client.clone())),
        };

        let mut cache = self.cache.write().expect("registry lock");
        cache.entry(kind).or_insert(executor).clone()
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}
