use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};

use super::{
    transport::{ClientError, Transport},
    Shared,
};
use crate::{
    profile::GameProfile,
    store::{ServerDescriptor, ServerId},
};

#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub connect: Duration,
    /// Longest a command may take, including gathering console output.
    pub command: Duration,
    /// How long a line console has to stay silent before a command's response
    /// is considered complete.
    pub response_window: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            command: Duration::from_secs(5),
            response_window: Duration::from_millis(250),
        }
    }
}

pub(crate) struct Request {
    command: String,
    reply: oneshot::Sender<Result<String, ClientError>>,
}

/// Cheap, cloneable way to talk to one connected server. Holding a handle
/// doesn't keep the connection alive: once the pool drops the client, `send`
/// fails with [`ClientError::Closed`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    server: Arc<ServerDescriptor>,
    profile: Arc<GameProfile>,
    connection: u64,
    connected_at: DateTime<Utc>,
    requests: mpsc::Sender<Request>,
}

/// What the web API shows about a connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub server_id: ServerId,
    pub game: String,
    pub address: String,
    pub connected_at: DateTime<Utc>,
}

impl ClientHandle {
    /// Sends a command and waits for its response.
    ///
    /// # Errors
    /// If the client has shut down or the command failed on the wire
    pub async fn send(&self, command: &str) -> Result<String, ClientError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request {
                command: command.to_owned(),
                reply,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        response.await.map_err(|_| ClientError::Closed)?
    }

    #[must_use]
    pub fn server(&self) -> &ServerDescriptor {
        &self.server
    }

    #[must_use]
    pub fn profile(&self) -> &Arc<GameProfile> {
        &self.profile
    }

    /// Distinguishes successive connections to the same server.
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection
    }

    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    #[must_use]
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            server_id: self.server.id,
            game: self.server.game.clone(),
            address: self.server.socket_address(),
            connected_at: self.connected_at,
        }
    }
}

enum Stop {
    Requested,
    Closed,
}

/// The task side of a connection. Owns the transport and the keep-alive
/// timer, so both go away together when the task ends.
pub(crate) struct ProtocolClient {
    server: Arc<ServerDescriptor>,
    profile: Arc<GameProfile>,
    connection: u64,
    transport: Transport,
    requests: mpsc::Receiver<Request>,
    shutdown: oneshot::Receiver<()>,
    pool: Weak<Shared>,
    timeouts: ClientTimeouts,
}

pub(crate) struct Spawned {
    pub handle: ClientHandle,
    pub shutdown: oneshot::Sender<()>,
}

impl ProtocolClient {
    pub(crate) fn spawn(
        server: Arc<ServerDescriptor>,
        profile: Arc<GameProfile>,
        connection: u64,
        transport: Transport,
        pool: Weak<Shared>,
        timeouts: ClientTimeouts,
    ) -> Spawned {
        const REQUEST_QUEUE: usize = 32;

        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE);
        let (shutdown_tx, shutdown) = oneshot::channel();

        let handle = ClientHandle {
            server: server.clone(),
            profile: profile.clone(),
            connection,
            connected_at: Utc::now(),
            requests: requests_tx,
        };

        let client = Self {
            server,
            profile,
            connection,
            transport,
            requests,
            shutdown,
            pool,
            timeouts,
        };
        tokio::task::spawn(client.run());

        Spawned {
            handle,
            shutdown: shutdown_tx,
        }
    }

    async fn run(mut self) {
        let id = self.server.id;
        // Dropped on every way out of this task, unwinding included.
        let _closed = ClosedNotifier {
            pool: self.pool.clone(),
            server: id,
            connection: self.connection,
        };
        tracing::info!("Connected to server {id} ({})", self.server.socket_address());

        match self.serve().await {
            Ok(Stop::Requested) => tracing::debug!("Client for server {id} stopped."),
            Ok(Stop::Closed) => tracing::info!("Server {id} closed the connection."),
            Err(e) => tracing::warn!("Lost connection to server {id}: {e}"),
        }
    }

    async fn serve(&mut self) -> Result<Stop, ClientError> {
        let mut keep_alive = self.profile.keep_alive.as_ref().and_then(|k| {
            let Some(start) = Instant::now().checked_add(k.interval) else {
                tracing::warn!(
                    "Keep-alive interval {:?} for server {} is out of range, not sending keep-alives.",
                    k.interval,
                    self.server.id
                );
                return None;
            };
            let mut interval = interval_at(start, k.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some((interval, k.command.clone()))
        });

        loop {
            tokio::select! {
                _ = &mut self.shutdown => return Ok(Stop::Requested),
                request = self.requests.recv() => {
                    let Some(Request { command, reply }) = request else {
                        return Ok(Stop::Requested);
                    };
                    let result = self.execute(&command, false).await;
                    let fatal = match &result {
                        Err(e) if e.is_fatal() => Some(e.to_string()),
                        _ => None,
                    };
                    // The caller may have given up waiting, that's fine.
                    let _ = reply.send(result);
                    if let Some(reason) = fatal {
                        tracing::debug!("Command {command:?} broke the connection to server {}: {reason}", self.server.id);
                        return Err(ClientError::Closed);
                    }
                }
                () = tick(keep_alive.as_mut().map(|(i, _)| i)) => {
                    let command = keep_alive.as_ref().map(|(_, c)| c.clone()).unwrap_or_default();
                    tracing::trace!("Keep-alive for server {}", self.server.id);
                    self.execute(&command, true).await?;
                }
                line = self.transport.next_line() => {
                    match line? {
                        Some(line) => {
                            if !deliver(&self.pool, self.server.id, &self.profile, &line) {
                                tracing::trace!("[{}] {line}", self.server.id);
                            }
                        }
                        None => return Ok(Stop::Closed),
                    }
                }
            }
        }
    }

    /// Runs one command. With `reply_required` a console that prints nothing
    /// before the command timeout counts as dead.
    async fn execute(&mut self, command: &str, reply_required: bool) -> Result<String, ClientError> {
        let timeouts = self.timeouts;
        match &mut self.transport {
            Transport::Source(connection) => {
                tokio::time::timeout(timeouts.command, connection.cmd(command))
                    .await
                    .map_err(|_| ClientError::Timeout(timeouts.command))?
                    .map_err(ClientError::from)
            }
            Transport::Console(console) => {
                let (pool, server, profile) = (&self.pool, self.server.id, &self.profile);
                console
                    .exchange(
                        command,
                        timeouts.response_window,
                        timeouts.command,
                        reply_required,
                        |line| deliver(pool, server, profile, line),
                    )
                    .await
            }
        }
    }
}

/// Takes the client out of the pool when its task ends, however it ends.
pub(crate) struct ClosedNotifier {
    pub pool: Weak<Shared>,
    pub server: ServerId,
    pub connection: u64,
}

impl Drop for ClosedNotifier {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.client_closed(self.server, self.connection);
        }
    }
}

/// Hands a line to the pool for classification. Returns whether it was a
/// broadcast. Dispatch runs to completion before the next line is read.
fn deliver(pool: &Weak<Shared>, server: ServerId, profile: &Arc<GameProfile>, line: &str) -> bool {
    pool.upgrade()
        .is_some_and(|pool| pool.handle_line(server, profile, line))
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
