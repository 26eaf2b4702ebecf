pub mod args;
pub mod broadcast;
pub mod chat;
pub mod players;
pub mod profile;
pub mod rcon;
pub mod settings;
pub mod store;
pub mod watchdog;
pub mod web;
pub mod websocket;

pub use broadcast::{Broadcast, BroadcastKind, Fields};
pub use profile::{GameProfile, ProfileRegistry};
pub use self::rcon::{ClientHandle, PoolError, RconService};
pub use store::{ServerDescriptor, ServerId};
pub use watchdog::Watchdog;
pub use websocket::{PushMessage, WebsocketService};

pub use serde_json;

use settings::AppDetails;

pub const APP: AppDetails<'static> = AppDetails {
    qualifier: "org",
    organization: "rcon-relay",
    application: "rcon_relay",
};
