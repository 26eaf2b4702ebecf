use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    broadcast::{BroadcastKind, Fields},
    profile::GameProfile,
    rcon::RconService,
    store::{PlayerStore, ServerId},
    websocket::{PushMessage, WebsocketService},
};

#[derive(Debug, Clone, Serialize)]
pub struct PlayerPresence<'a> {
    pub server_id: ServerId,
    pub player: &'a str,
    pub time: DateTime<Utc>,
}

/// Keeps the player store in step with join and quit broadcasts and tells the
/// UI about them.
#[derive(Clone)]
pub struct PlayerTracker {
    store: Arc<dyn PlayerStore>,
    hub: WebsocketService,
}

impl PlayerTracker {
    #[must_use]
    pub fn new(store: Arc<dyn PlayerStore>, hub: WebsocketService) -> Self {
        Self { store, hub }
    }

    pub fn subscribe(&self, pool: &RconService) {
        let tracker = self.clone();
        pool.subscribe(BroadcastKind::Join, move |fields, server, profile| {
            tracker.on_player_join(fields, server, profile)
        });
        let tracker = self.clone();
        pool.subscribe(BroadcastKind::Quit, move |fields, server, profile| {
            tracker.on_player_quit(fields, server, profile)
        });
    }

    /// # Errors
    /// If the line didn't carry the game's player field or the store failed
    pub fn on_player_join(&self, fields: &Fields, server: ServerId, profile: &GameProfile) -> anyhow::Result<()> {
        let player = player_id(fields, profile)?;
        self.store
            .record_join(server, player)
            .with_context(|| format!("Recording {player} joining server {server}"))?;
        tracing::info!("{player} joined server {server}");
        self.push("player_join", server, player)
    }

    /// # Errors
    /// If the line didn't carry the game's player field or the store failed
    pub fn on_player_quit(&self, fields: &Fields, server: ServerId, profile: &GameProfile) -> anyhow::Result<()> {
        let player = player_id(fields, profile)?;
        self.store
            .record_quit(server, player)
            .with_context(|| format!("Recording {player} leaving server {server}"))?;
        tracing::info!("{player} left server {server}");
        self.push("player_quit", server, player)
    }

    fn push(&self, kind: &str, server: ServerId, player: &str) -> anyhow::Result<()> {
        let presence = PlayerPresence {
            server_id: server,
            player,
            time: Utc::now(),
        };
        self.hub.broadcast(PushMessage::new(kind, presence)?);
        Ok(())
    }
}

fn player_id<'a>(fields: &'a Fields, profile: &GameProfile) -> anyhow::Result<&'a str> {
    fields
        .get(&profile.player_field)
        .map(String::as_str)
        .filter(|p| !p.is_empty())
        .with_context(|| {
            format!(
                "{} broadcast has no {:?} field",
                profile.name, profile.player_field
            )
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{
        rcon::tests::{test_profiles, test_timeouts, FakeConsole},
        store::OnlinePlayers,
    };

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[tokio::test]
    async fn join_and_quit_update_store_and_ui() {
        let hub = WebsocketService::start();
        let (_ui, mut messages) = hub.register("admin");
        let store = Arc::new(OnlinePlayers::new());
        let tracker = PlayerTracker::new(store.clone(), hub);
        let profile = test_profiles().get("linegame").unwrap();

        tracker
            .on_player_join(&fields(&[("ID", "abc123")]), ServerId(2), &profile)
            .unwrap();
        // Seen again after a reconnect.
        tracker
            .on_player_join(&fields(&[("ID", "abc123")]), ServerId(2), &profile)
            .unwrap();
        assert_eq!(store.online(ServerId(2)), vec!["abc123"]);

        tracker
            .on_player_quit(&fields(&[("ID", "abc123")]), ServerId(2), &profile)
            .unwrap();
        assert!(store.online(ServerId(2)).is_empty());

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let text = messages.recv().await.unwrap();
            let message: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(message["payload"]["player"], "abc123");
            assert_eq!(message["payload"]["server_id"], 2);
            kinds.push(message["type"].as_str().unwrap().to_owned());
        }
        assert_eq!(kinds, ["player_join", "player_join", "player_quit"]);
    }

    #[tokio::test]
    async fn missing_player_field_is_an_error() {
        let tracker = PlayerTracker::new(Arc::new(OnlinePlayers::new()), WebsocketService::start());
        let profile = test_profiles().get("linegame").unwrap();

        let error = tracker
            .on_player_join(&fields(&[("name", "bob")]), ServerId(1), &profile)
            .unwrap_err();
        assert!(error.to_string().contains("\"ID\""), "{error}");
        assert!(tracker
            .on_player_quit(&fields(&[("ID", "")]), ServerId(1), &profile)
            .is_err());
    }

    #[tokio::test]
    async fn tracks_players_from_a_live_console() {
        let pool = RconService::new(test_profiles(), test_timeouts());
        let store = Arc::new(OnlinePlayers::new());
        PlayerTracker::new(store.clone(), WebsocketService::start()).subscribe(&pool);

        let mut console = FakeConsole::start().await;
        pool.create_client(console.descriptor(6)).await.unwrap();
        let mut server_side = console.accepted.recv().await.unwrap();
        server_side
            .write_all(b"alice joined\nbob joined\nalice left\n")
            .await
            .unwrap();

        for _ in 0..100 {
            if store.online(ServerId(6)) == ["bob"] {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("players online: {:?}", store.online(ServerId(6)));
    }
}
