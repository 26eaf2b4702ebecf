use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::{
    chat::ChatRelay,
    rcon::{ClientInfo, PoolError, RconService},
    store::{ServerId, ServerStore, StoreError},
    websocket::{ConnectedClient, WebsocketService},
};

/// Turns a session token into the id of the user it belongs to.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<String>;
}

/// Fixed token table from the settings file.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    #[must_use]
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).cloned()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: RconService,
    pub hub: WebsocketService,
    pub chat: ChatRelay,
    pub servers: Arc<dyn ServerStore>,
    pub auth: Arc<dyn Authenticator>,
}

/// What UI clients may send over their socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Chat { server_id: ServerId, message: String },
}

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket))
        .route("/api/clients", get(list_clients))
        .route("/api/clients/:id", post(create_client).delete(delete_client))
        .route("/api/clients/:id/command", post(send_command))
        .route("/api/ui_clients", get(ui_clients))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API on all interfaces until the server fails.
///
/// # Errors
/// If the port couldn't be bound or the server stopped with an error
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    serve_listener(state, listener).await
}

/// # Errors
/// If the listener can't be used or the server stopped with an error
pub async fn serve_listener(state: AppState, listener: std::net::TcpListener) -> anyhow::Result<()> {
    let server = axum::Server::from_tcp(listener)?.serve(router(state).into_make_service());
    tracing::info!("Serving API on {}", server.local_addr());
    server.await?;
    Ok(())
}

// Errors

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Missing or invalid session token")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        let status = match &e {
            PoolError::AlreadyConnected(_) | PoolError::Removed(_) => StatusCode::CONFLICT,
            PoolError::UnknownGame(_)
            | PoolError::ProtocolDisabled(_)
            | PoolError::Unsupported { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PoolError::NotFound(_) => StatusCode::NOT_FOUND,
            PoolError::Connection { .. } | PoolError::Client { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e)
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| state.auth.authenticate(token.trim()))
        .ok_or_else(ApiError::unauthorized)
}

// REST

async fn list_clients(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ClientInfo>>, ApiError> {
    authorize(&state, &headers)?;
    let mut clients: Vec<ClientInfo> = state.pool.get_clients().values().map(|c| c.info()).collect();
    clients.sort_by_key(|c| c.server_id);
    Ok(Json(clients))
}

async fn create_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<(StatusCode, Json<ClientInfo>), ApiError> {
    let user = authorize(&state, &headers)?;
    let server = state.servers.server_by_id(ServerId(id)).await?;
    let handle = state.pool.create_client(server).await?;
    tracing::info!("{user} connected server {id}");
    Ok((StatusCode::CREATED, Json(handle.info())))
}

async fn delete_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let user = authorize(&state, &headers)?;
    if state.pool.delete_client(ServerId(id)) {
        tracing::info!("{user} disconnected server {id}");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn send_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = authorize(&state, &headers)?;
    tracing::info!("{user} ran {:?} on server {id}", request.command);
    let response = state.pool.send_command(ServerId(id), &request.command).await?;
    Ok(Json(json!({ "response": response })))
}

async fn ui_clients(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConnectedClient>>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.hub.connected_clients().await))
}

// Websocket

async fn websocket(
    ws: WebSocketUpgrade,
    Query(session): Query<SessionQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(user) = state.auth.authenticate(&session.token) else {
        tracing::debug!("Rejected websocket connection with a bad token.");
        return ApiError::unauthorized().into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: String, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (mut guard, mut outbound) = state.hub.register(user.clone());
    let id = guard.id();

    guard.attach_writer(tokio::task::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = sink.send(Message::Text(text.to_string())).await {
                tracing::debug!("Couldn't write to UI client {id}: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    }));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_client_message(&state, &user, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("UI client {id} read failed: {e}");
                break;
            }
        }
    }

    // Dropping the guard unregisters the client and stops the writer.
    drop(guard);
}

async fn handle_client_message(state: &AppState, user: &str, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Chat { server_id, message }) => {
            if let Err(e) = state
                .chat
                .relay_admin_message(user, server_id, &message)
                .await
            {
                tracing::warn!("Couldn't relay chat from {user} to server {server_id}: {e}");
            }
        }
        Err(e) => tracing::warn!("Ignoring malformed message from {user}: {e}"),
    }
}
