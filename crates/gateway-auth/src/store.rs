//! Connection storage
//!
//! Manages a JSON file mapping connection IDs to `Connection` records. All
//! writes use atomic temp-file + rename to prevent corruption on crash. A
//! tokio Mutex serialises concurrent writes from the arbiter and the token
//! refresher.
//!
//! The store file is the single source of truth for credential data. The
//! arbiter reads connection snapshots at selection time and patches them
//! back through `update()`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connection::{Connection, ProviderKind, Settings};
use crate::error::{Error, Result};

/// Thread-safe connection file manager.
///
/// The Mutex serialises all access. Reads clone the matching records, so
/// callers hold snapshots and never references into the store.
pub struct ConnectionStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Connection>>,
    settings: Settings,
}

impl ConnectionStore {
    /// Load connections from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// connections). Selection will answer "no credentials" until records
    /// are imported.
    pub async fn load(path: PathBuf, settings: Settings) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading connection file: {e}")))?;
            let connections: HashMap<String, Connection> = serde_json::from_str(&contents)
                .map_err(|e| Error::ConnectionParse(format!("parsing connection file: {e}")))?;
            info!(path = %path.display(), connections = connections.len(), "loaded connections");
            connections
        } else {
            info!(path = %path.display(), "connection file not found, starting with empty store");
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            settings,
        })
    }

    /// Process-wide selection settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Get a clone of a specific connection.
    pub async fn get(&self, id: &str) -> Option<Connection> {
        let state = self.state.lock().await;
        state.get(id).cloned()
    }

    /// Connections for one provider, sorted by `priority` ascending.
    ///
    /// With `active_only` set, inactive records are filtered out; cooldown
    /// state is NOT considered here — that is soft state the arbiter
    /// re-checks against the clock.
    pub async fn connections(&self, provider: ProviderKind, active_only: bool) -> Vec<Connection> {
        let state = self.state.lock().await;
        let mut matching: Vec<Connection> = state
            .values()
            .filter(|c| c.provider == provider && (!active_only || c.is_active))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        matching
    }

    /// Providers that currently have at least one active connection.
    pub async fn active_providers(&self) -> Vec<ProviderKind> {
        let state = self.state.lock().await;
        let mut kinds: Vec<ProviderKind> = ProviderKind::ALL
            .iter()
            .filter(|k| state.values().any(|c| c.provider == **k && c.is_active))
            .copied()
            .collect();
        kinds.dedup();
        kinds
    }

    /// Add or replace a connection and persist to disk.
    pub async fn add(&self, connection: Connection) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(connection_id = %connection.id, "added connection");
        state.insert(connection.id.clone(), connection);
        write_atomic(&self.path, &state).await
    }

    /// Atomically patch one connection by id and persist to disk.
    ///
    /// The patch closure runs under the store lock, so no concurrent update
    /// can interleave between read and write. Returns the patched snapshot.
    pub async fn update<F>(&self, id: &str, patch: F) -> Result<Connection>
    where
        F: FnOnce(&mut Connection),
    {
        let mut state = self.state.lock().await;
        let connection = state
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("connection {id} not in store")))?;
        patch(connection);
        let snapshot = connection.clone();
        debug!(connection_id = id, "updated connection");
        write_atomic(&self.path, &state).await?;
        Ok(snapshot)
    }

    /// Number of stored connections.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write connections to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. This prevents corruption if the process crashes mid-write.
/// Sets file permissions to 0600 (owner read/write only) since the file
/// contains OAuth tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, Connection>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::ConnectionParse(format!("serializing connections: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("connection path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".connections.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp connection file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting connection file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp connection file: {e}")))?;

    debug!(path = %path.display(), "persisted connections");
    Ok(())
}
