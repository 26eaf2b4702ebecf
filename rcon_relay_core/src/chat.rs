use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    broadcast::{BroadcastKind, Fields},
    profile::GameProfile,
    rcon::{PoolError, RconService},
    store::ServerId,
    websocket::{PushMessage, WebsocketService},
};

/// Capture group chat patterns put the message text in.
pub const MESSAGE_FIELD: &str = "message";

/// A chat line as the UI sees it, whether it came from a player in game or
/// from an admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub server_id: ServerId,
    pub player: String,
    pub message: String,
    pub time: DateTime<Utc>,
    /// Sent by an admin through the relay rather than typed in game.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub from_admin: bool,
}

/// Forwards in-game chat to the UI, and admin chat from the UI to the game.
#[derive(Clone)]
pub struct ChatRelay {
    pool: RconService,
    hub: WebsocketService,
}

impl ChatRelay {
    #[must_use]
    pub const fn new(pool: RconService, hub: WebsocketService) -> Self {
        Self { pool, hub }
    }

    /// The callback holds the hub only. Holding the pool would keep the pool
    /// alive through its own subscriber list.
    pub fn subscribe(&self) {
        let hub = self.hub.clone();
        self.pool
            .subscribe(BroadcastKind::Chat, move |fields, server, profile| {
                forward_chat(&hub, fields, server, profile)
            });
    }

    /// # Errors
    /// If the line had no message
    pub fn on_chat(&self, fields: &Fields, server: ServerId, profile: &GameProfile) -> anyhow::Result<()> {
        forward_chat(&self.hub, fields, server, profile)
    }

    /// Says `message` on the server as `user` and shows it to every admin.
    ///
    /// # Errors
    /// - `NotFound` if the server isn't connected
    /// - `Unsupported` if the game has no chat command
    /// - `Client` if the server didn't take the command
    pub async fn relay_admin_message(
        &self,
        user: &str,
        server: ServerId,
        message: &str,
    ) -> Result<(), PoolError> {
        let handle = self.pool.get_client(server).ok_or(PoolError::NotFound(server))?;
        let command = handle
            .profile()
            .render_chat_command(message)
            .ok_or_else(|| PoolError::Unsupported {
                game: handle.server().game.clone(),
                command: "chat",
            })?;

        self.pool.send_command(server, &command).await?;
        tracing::info!("{user} said on server {server}: {message}");

        let echo = ChatMessage {
            server_id: server,
            player: user.to_owned(),
            message: message.trim().to_owned(),
            time: Utc::now(),
            from_admin: true,
        };
        if let Err(e) = push(&self.hub, echo) {
            tracing::error!("Couldn't echo admin chat: {e}");
        }
        Ok(())
    }

}

fn forward_chat(
    hub: &WebsocketService,
    fields: &Fields,
    server: ServerId,
    profile: &GameProfile,
) -> anyhow::Result<()> {
    let Some(message) = fields.get(MESSAGE_FIELD).filter(|m| !m.trim().is_empty()) else {
        anyhow::bail!("{} chat broadcast has no message", profile.name);
    };
    let player = fields
        .get(&profile.player_field)
        .cloned()
        .unwrap_or_default();

    tracing::debug!("[{server}] {player}: {message}");
    push(
        hub,
        ChatMessage {
            server_id: server,
            player,
            message: message.trim().to_owned(),
            time: Utc::now(),
            from_admin: false,
        },
    )
}

fn push(hub: &WebsocketService, chat: ChatMessage) -> anyhow::Result<()> {
    hub.broadcast(PushMessage::new("chat", chat)?);
    Ok(())
}
