use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    sync::{Mutex, RwLock},
};

use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier assigned to a game server by storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u64);

impl Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ServerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: ServerId,
    /// Name of the [`GameProfile`](crate::profile::GameProfile) this server runs.
    pub game: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub password: String,
}

impl ServerDescriptor {
    #[must_use]
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No server with id {0}")]
    NotFound(ServerId),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// The authoritative list of game servers. Backed by the platform's database
/// in production; the relay only ever reads from it.
pub trait ServerStore: Send + Sync {
    /// Every server that should currently hold a protocol connection.
    fn servers_requiring_connection(&self) -> BoxFuture<'_, Result<Vec<ServerDescriptor>, StoreError>>;

    fn server_by_id(&self, id: ServerId) -> BoxFuture<'_, Result<ServerDescriptor, StoreError>>;
}

/// In-memory [`ServerStore`] seeded from the settings file.
#[derive(Debug, Default)]
pub struct StaticServerStore {
    servers: RwLock<Vec<ServerDescriptor>>,
}

impl StaticServerStore {
    #[must_use]
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self {
            servers: RwLock::new(servers),
        }
    }

    /// Adds or replaces the server with the same id.
    pub fn upsert(&self, server: ServerDescriptor) {
        let mut servers = self.servers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        servers.retain(|s| s.id != server.id);
        servers.push(server);
    }

    /// Removes a server record. Whoever calls this is responsible for also
    /// deleting the server's client from the pool.
    pub fn remove(&self, id: ServerId) -> Option<ServerDescriptor> {
        let mut servers = self.servers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let idx = servers.iter().position(|s| s.id == id)?;
        Some(servers.remove(idx))
    }
}

impl ServerStore for StaticServerStore {
    fn servers_requiring_connection(&self) -> BoxFuture<'_, Result<Vec<ServerDescriptor>, StoreError>> {
        let servers = self
            .servers
            .read()
            .map(|s| s.clone())
            .map_err(|e| StoreError::Unavailable(e.to_string()));
        Box::pin(future::ready(servers))
    }

    fn server_by_id(&self, id: ServerId) -> BoxFuture<'_, Result<ServerDescriptor, StoreError>> {
        let server = self
            .servers
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
            .and_then(|servers| {
                servers
                    .iter()
                    .find(|s| s.id == id)
                    .cloned()
                    .ok_or(StoreError::NotFound(id))
            });
        Box::pin(future::ready(server))
    }
}

// Players

/// Where player presence ends up. Both operations must be idempotent since
/// the same join line can be seen again after a reconnect.
pub trait PlayerStore: Send + Sync {
    /// # Errors
    /// If the record could not be written
    fn record_join(&self, server: ServerId, player: &str) -> Result<(), StoreError>;

    /// # Errors
    /// If the record could not be written
    fn record_quit(&self, server: ServerId, player: &str) -> Result<(), StoreError>;
}

/// Tracks which players are online on which server.
#[derive(Debug, Default)]
pub struct OnlinePlayers {
    online: Mutex<HashMap<ServerId, HashSet<String>>>,
}

impl OnlinePlayers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn online(&self, server: ServerId) -> Vec<String> {
        let online = self.online.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut players: Vec<String> = online
            .get(&server)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default();
        players.sort();
        players
    }
}

impl PlayerStore for OnlinePlayers {
    fn record_join(&self, server: ServerId, player: &str) -> Result<(), StoreError> {
        let mut online = self
            .online
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        online.entry(server).or_default().insert(player.to_owned());
        Ok(())
    }

    fn record_quit(&self, server: ServerId, player: &str) -> Result<(), StoreError> {
        let mut online = self
            .online
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if let Some(players) = online.get_mut(&server) {
            players.remove(player);
            if players.is_empty() {
                online.remove(&server);
            }
        }
        Ok(())
    }
}
