use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};

pub type ClientId = u64;

/// Messages waiting for a slow UI client before new ones are dropped.
const OUTBOUND_QUEUE: usize = 64;

/// Something pushed to every connected UI client. Serializes as
/// `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

impl PushMessage {
    /// # Errors
    /// If the payload can't be represented as JSON
    pub fn new(kind: impl Into<String>, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedClient {
    pub id: ClientId,
    pub user: String,
}

struct UiClient {
    user: String,
    outbound: mpsc::Sender<Arc<str>>,
}

enum HubRequest {
    Register(ClientId, UiClient),
    Unregister(ClientId),
    Broadcast(PushMessage),
    Connected(oneshot::Sender<Vec<ConnectedClient>>),
}

/// Handle to the push hub. The hub task is the only thing that touches the
/// set of connected UI clients; everything else goes through this handle,
/// and requests are handled in the order they were made.
#[derive(Clone)]
pub struct WebsocketService {
    requests: mpsc::UnboundedSender<HubRequest>,
    next_id: Arc<AtomicU64>,
}

impl WebsocketService {
    /// Spawns the hub task. It stops once every handle has been dropped.
    #[must_use]
    pub fn start() -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        tokio::task::spawn(run_hub(rx));
        Self {
            requests,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Adds a UI client for an authenticated user. Returns the guard that
    /// unregisters it on drop and the queue of serialized messages to write
    /// to its socket.
    #[must_use]
    pub fn register(&self, user: impl Into<String>) -> (ClientGuard, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, messages) = mpsc::channel(OUTBOUND_QUEUE);
        self.request(HubRequest::Register(
            id,
            UiClient {
                user: user.into(),
                outbound,
            },
        ));

        let guard = ClientGuard {
            hub: self.clone(),
            id,
            writer: None,
        };
        (guard, messages)
    }

    /// Removes a client. Unknown ids are ignored.
    pub fn unregister(&self, id: ClientId) {
        self.request(HubRequest::Unregister(id));
    }

    /// Sends a message to every client registered before this call.
    pub fn broadcast(&self, message: PushMessage) {
        self.request(HubRequest::Broadcast(message));
    }

    /// Currently registered clients, ordered by id.
    pub async fn connected_clients(&self) -> Vec<ConnectedClient> {
        let (tx, rx) = oneshot::channel();
        self.request(HubRequest::Connected(tx));
        rx.await.unwrap_or_default()
    }

    fn request(&self, request: HubRequest) {
        if self.requests.send(request).is_err() {
            tracing::error!("Push hub is no longer running.");
        }
    }
}

/// Keeps a UI client registered for as long as it lives. Dropping it
/// unregisters the client and stops its socket writer, whichever way the
/// connection ended.
pub struct ClientGuard {
    hub: WebsocketService,
    id: ClientId,
    writer: Option<JoinHandle<()>>,
}

impl ClientGuard {
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Ties the task writing to the client's socket to this guard.
    pub fn attach_writer(&mut self, writer: JoinHandle<()>) {
        self.writer = Some(writer);
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn run_hub(mut requests: mpsc::UnboundedReceiver<HubRequest>) {
    let mut clients: HashMap<ClientId, UiClient> = HashMap::new();

    while let Some(request) = requests.recv().await {
        match request {
            HubRequest::Register(id, client) => {
                tracing::info!("UI client {id} ({}) connected.", client.user);
                clients.insert(id, client);
            }
            HubRequest::Unregister(id) => {
                if let Some(client) = clients.remove(&id) {
                    tracing::info!("UI client {id} ({}) disconnected.", client.user);
                }
            }
            HubRequest::Broadcast(message) => broadcast(&clients, &message),
            HubRequest::Connected(reply) => {
                let mut connected: Vec<_> = clients
                    .iter()
                    .map(|(id, c)| ConnectedClient {
                        id: *id,
                        user: c.user.clone(),
                    })
                    .collect();
                connected.sort_by_key(|c| c.id);
                let _ = reply.send(connected);
            }
        }
    }

    tracing::debug!("Push hub stopped.");
}

fn broadcast(clients: &HashMap<ClientId, UiClient>, message: &PushMessage) {
    let text: Arc<str> = match serde_json::to_string(message) {
        Ok(text) => text.into(),
        Err(e) => {
            tracing::error!("Couldn't serialize {:?} message: {e}", message.kind);
            return;
        }
    };

    for (id, client) in clients {
        // A client that went away gets unregistered by its own read loop.
        match client.outbound.try_send(text.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("UI client {id} is falling behind, dropped a {:?} message.", message.kind);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("UI client {id} is closing, skipped a {:?} message.", message.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    async fn next(messages: &mut mpsc::Receiver<Arc<str>>) -> Option<PushMessage> {
        tokio::time::timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .map(|text| serde_json::from_str(&text).unwrap())
    }

    #[tokio::test]
    async fn registered_clients_receive_broadcasts() {
        let hub = WebsocketService::start();
        let (_alice, mut to_alice) = hub.register("alice");
        let (_bob, mut to_bob) = hub.register("bob");

        let message = PushMessage::new("chat", json!({"message": "hi"})).unwrap();
        hub.broadcast(message.clone());

        assert_eq!(next(&mut to_alice).await, Some(message.clone()));
        assert_eq!(next(&mut to_bob).await, Some(message));
    }

    #[tokio::test]
    async fn unregistered_clients_get_nothing() {
        let hub = WebsocketService::start();
        let (alice, mut to_alice) = hub.register("alice");
        let (_bob, mut to_bob) = hub.register("bob");

        hub.unregister(alice.id());
        hub.broadcast(PushMessage::new("player_join", json!({"player": "x"})).unwrap());

        // The hub dropped alice's queue without writing to it.
        assert_eq!(next(&mut to_alice).await, None);
        assert_eq!(next(&mut to_bob).await.unwrap().kind, "player_join");

        // Unregistering twice is harmless.
        hub.unregister(alice.id());
        assert_eq!(hub.connected_clients().await.len(), 1);
    }

    #[tokio::test]
    async fn dropping_the_guard_unregisters() {
        let hub = WebsocketService::start();
        let (guard, mut messages) = hub.register("carol");
        assert_eq!(
            hub.connected_clients().await,
            vec![ConnectedClient {
                id: guard.id(),
                user: "carol".into()
            }]
        );

        drop(guard);
        assert!(hub.connected_clients().await.is_empty());
        assert_eq!(next(&mut messages).await, None);
    }

    #[tokio::test]
    async fn slow_clients_do_not_hold_up_others() {
        let hub = WebsocketService::start();
        let (_slow, _never_read) = hub.register("slow");
        let (_fast, mut fast) = hub.register("fast");

        for n in 0..OUTBOUND_QUEUE + 10 {
            hub.broadcast(PushMessage::new("tick", n).unwrap());
            assert_eq!(next(&mut fast).await.unwrap().payload, json!(n));
        }
        assert_eq!(hub.connected_clients().await.len(), 2);
    }

    #[test]
    fn wire_format() {
        let message = PushMessage::new("chat", json!({"server_id": 1})).unwrap();
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"chat","payload":{"server_id":1}}"#
        );
    }
}
