use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    broadcast::{self, Broadcast, BroadcastKind, Fields, ParsedLine},
    profile::{GameProfile, ProfileRegistry},
    store::{ServerDescriptor, ServerId},
};

pub mod client;
pub mod transport;

pub use client::{ClientHandle, ClientInfo, ClientTimeouts};
pub use transport::{ClientError, ConnectionError};

use client::ProtocolClient;
use transport::Transport;

/// Callback run for every broadcast of the kind it subscribed to. Runs on the
/// reading connection's task, so it must not block.
pub type Subscriber = Arc<dyn Fn(&Fields, ServerId, &GameProfile) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Server {0} already has a connection")]
    AlreadyConnected(ServerId),
    #[error("Unknown game {0:?}")]
    UnknownGame(String),
    #[error("RCON is disabled for game {0:?}")]
    ProtocolDisabled(String),
    #[error("Couldn't connect to server {server}: {source}")]
    Connection {
        server: ServerId,
        #[source]
        source: ConnectionError,
    },
    #[error("No connection for server {0}")]
    NotFound(ServerId),
    #[error("Connection for server {0} was removed while it was being established")]
    Removed(ServerId),
    #[error("Command failed on server {server}: {source}")]
    Client {
        server: ServerId,
        #[source]
        source: ClientError,
    },
    #[error("Game {game:?} has no {command} command")]
    Unsupported { game: String, command: &'static str },
}

impl PoolError {
    /// The server is most likely just offline.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connection { source, .. } if source.is_unreachable())
    }
}

struct Entry {
    handle: ClientHandle,
    shutdown: oneshot::Sender<()>,
}

#[derive(Default)]
struct Clients {
    live: HashMap<ServerId, Entry>,
    /// Servers with a connection attempt in flight, by attempt id.
    connecting: HashMap<ServerId, u64>,
}

impl Clients {
    fn reserve(&mut self, server: ServerId, attempt: u64) -> bool {
        if self.live.contains_key(&server) || self.connecting.contains_key(&server) {
            return false;
        }
        self.connecting.insert(server, attempt);
        true
    }

    /// Ends a connection attempt. False if it was abandoned meanwhile, even
    /// when a newer attempt holds the reservation now.
    fn release(&mut self, server: ServerId, attempt: u64) -> bool {
        if self.connecting.get(&server) == Some(&attempt) {
            self.connecting.remove(&server);
            true
        } else {
            false
        }
    }
}

pub(crate) struct Shared {
    profiles: Arc<ProfileRegistry>,
    timeouts: ClientTimeouts,
    clients: Mutex<Clients>,
    subscribers: RwLock<HashMap<BroadcastKind, Vec<Subscriber>>>,
    next_connection: AtomicU64,
}

impl Shared {
    fn clients(&self) -> MutexGuard<'_, Clients> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by a client's read loop for every line it didn't ask for.
    pub(crate) fn handle_line(&self, server: ServerId, profile: &Arc<GameProfile>, line: &str) -> bool {
        if !profile.broadcasts_enabled {
            return false;
        }

        let Some(parsed) = broadcast::classify(line, profile) else {
            return false;
        };

        self.dispatch(&Broadcast::new(parsed, server, profile.clone()));
        true
    }

    fn dispatch(&self, event: &Broadcast) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        tracing::debug!(
            "{:?} broadcast {:?} from server {} ({} subscribers)",
            event.kind,
            event.pattern,
            event.server,
            subscribers.len()
        );

        for (i, subscriber) in subscribers.iter().enumerate() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                subscriber(&event.fields, event.server, &event.profile)
            }));

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    "Subscriber #{i} for {:?} failed on server {}: {e:#}",
                    event.kind,
                    event.server
                ),
                Err(_) => tracing::error!(
                    "Subscriber #{i} for {:?} panicked on server {}",
                    event.kind,
                    event.server
                ),
            }
        }
    }

    /// A client's task ended. Only removes the entry if it still belongs to
    /// that connection, a newer one may have replaced it already.
    pub(crate) fn client_closed(&self, server: ServerId, connection: u64) {
        let mut clients = self.clients();
        if clients
            .live
            .get(&server)
            .is_some_and(|e| e.handle.connection_id() == connection)
        {
            clients.live.remove(&server);
            tracing::debug!("Removed client for server {server}");
        }
    }
}

/// The pool of live protocol clients, one per connected game server, plus
/// the broadcast subscriber registry they dispatch into.
#[derive(Clone)]
pub struct RconService {
    shared: Arc<Shared>,
}

impl RconService {
    #[must_use]
    pub fn new(profiles: Arc<ProfileRegistry>, timeouts: ClientTimeouts) -> Self {
        Self {
            shared: Arc::new(Shared {
                profiles,
                timeouts,
                clients: Mutex::new(Clients::default()),
                subscribers: RwLock::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn profiles(&self) -> &ProfileRegistry {
        &self.shared.profiles
    }

    /// Opens a connection to the server and starts its client.
    ///
    /// # Errors
    /// - `AlreadyConnected` if the server has (or is getting) a connection
    /// - `UnknownGame` / `ProtocolDisabled` if the game's profile doesn't allow it
    /// - `Connection` if the server couldn't be reached or rejected us
    /// - `Removed` if [`RconService::delete_client`] was called meanwhile
    pub async fn create_client(&self, server: ServerDescriptor) -> Result<ClientHandle, PoolError> {
        let id = server.id;
        let attempt = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        if !self.shared.clients().reserve(id, attempt) {
            return Err(PoolError::AlreadyConnected(id));
        }

        let connected = self.connect(&server).await;

        let mut clients = self.shared.clients();
        let still_wanted = clients.release(id, attempt);
        let (transport, profile) = connected?;
        if !still_wanted {
            return Err(PoolError::Removed(id));
        }

        let spawned = ProtocolClient::spawn(
            Arc::new(server),
            profile,
            attempt,
            transport,
            Arc::downgrade(&self.shared),
            self.shared.timeouts,
        );
        let handle = spawned.handle.clone();
        clients.live.insert(
            id,
            Entry {
                handle: spawned.handle,
                shutdown: spawned.shutdown,
            },
        );

        Ok(handle)
    }

    async fn connect(
        &self,
        server: &ServerDescriptor,
    ) -> Result<(Transport, Arc<GameProfile>), PoolError> {
        let profile = self
            .shared
            .profiles
            .get(&server.game)
            .ok_or_else(|| PoolError::UnknownGame(server.game.clone()))?;
        if !profile.rcon_enabled {
            return Err(PoolError::ProtocolDisabled(server.game.clone()));
        }

        let transport = Transport::connect(server, &profile, self.shared.timeouts.connect)
            .await
            .map_err(|source| PoolError::Connection {
                server: server.id,
                source,
            })?;

        Ok((transport, profile))
    }

    /// Snapshot of the connected clients.
    #[must_use]
    pub fn get_clients(&self) -> HashMap<ServerId, ClientHandle> {
        self.shared
            .clients()
            .live
            .iter()
            .map(|(id, entry)| (*id, entry.handle.clone()))
            .collect()
    }

    #[must_use]
    pub fn get_client(&self, server: ServerId) -> Option<ClientHandle> {
        self.shared
            .clients()
            .live
            .get(&server)
            .map(|e| e.handle.clone())
    }

    /// Stops and forgets the server's client. Returns whether there was one.
    /// Also abandons a connection attempt that is still in flight.
    pub fn delete_client(&self, server: ServerId) -> bool {
        let mut clients = self.shared.clients();
        let connecting = clients.connecting.remove(&server).is_some();
        let Some(entry) = clients.live.remove(&server) else {
            return connecting;
        };
        drop(clients);

        // The task may already be on its way out.
        let _ = entry.shutdown.send(());
        tracing::info!("Deleted client for server {server}");
        true
    }

    /// Registers a callback for one kind of broadcast. Callbacks run in
    /// registration order.
    pub fn subscribe<F>(&self, kind: BroadcastKind, callback: F)
    where
        F: Fn(&Fields, ServerId, &GameProfile) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Delivers a broadcast to every subscriber of its kind. A subscriber
    /// that fails or panics is logged and the rest still run.
    pub fn dispatch(&self, event: &Broadcast) {
        self.shared.dispatch(event);
    }

    /// Classifies a raw line as if `server` had sent it, dispatching it if it
    /// is a broadcast.
    ///
    /// # Errors
    /// `UnknownGame` if the server's game has no profile
    pub fn inject_line(&self, server: &ServerDescriptor, line: &str) -> Result<bool, PoolError> {
        let profile = self
            .shared
            .profiles
            .get(&server.game)
            .ok_or_else(|| PoolError::UnknownGame(server.game.clone()))?;
        Ok(self.shared.handle_line(server.id, &profile, line))
    }

    /// # Errors
    /// `NotFound` if the server isn't connected, `Client` if the command failed
    pub async fn send_command(&self, server: ServerId, command: &str) -> Result<String, PoolError> {
        let handle = self.get_client(server).ok_or(PoolError::NotFound(server))?;
        handle
            .send(command)
            .await
            .map_err(|source| PoolError::Client { server, source })
    }

    /// Runs a command and parses its output with the game's command patterns.
    ///
    /// # Errors
    /// See [`RconService::send_command`]
    pub async fn query(&self, server: ServerId, command: &str) -> Result<Vec<ParsedLine>, PoolError> {
        let handle = self.get_client(server).ok_or(PoolError::NotFound(server))?;
        let output = handle
            .send(command)
            .await
            .map_err(|source| PoolError::Client { server, source })?;
        Ok(broadcast::parse_command_output(&output, handle.profile()))
    }

    /// # Errors
    /// `Unsupported` if the game has no player list command, otherwise see
    /// [`RconService::send_command`]
    pub async fn list_players(&self, server: ServerId) -> Result<Vec<ParsedLine>, PoolError> {
        let handle = self.get_client(server).ok_or(PoolError::NotFound(server))?;
        let command = handle
            .profile()
            .player_list_command
            .clone()
            .ok_or_else(|| PoolError::Unsupported {
                game: handle.server().game.clone(),
                command: "player list",
            })?;
        self.query(server, &command).await
    }
}
