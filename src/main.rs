use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use rcon_relay_core::{
    args::Args,
    chat::ChatRelay,
    players::PlayerTracker,
    profile::ProfileRegistry,
    settings::{self, Settings},
    store::{OnlinePlayers, StaticServerStore},
    web::{self, AppState, StaticTokens},
    RconService, Watchdog, WebsocketService, APP,
};

mod tracing_setup;

fn main() -> anyhow::Result<()> {
    let _guard = tracing_setup::init_tracing();
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(|| {
        Settings::default_file_location(APP).unwrap_or_else(|e| {
            tracing::error!("Failed to find a suitable location to store settings ({e}). Settings will be written to {}", settings::CONFIG_FILE_NAME);
            PathBuf::from(settings::CONFIG_FILE_NAME)
        })
    });
    let mut settings = Settings::load_or_create(config_path)?;
    // Write back so a fresh install gets a file with every option in it.
    settings.save_ok();
    settings.apply_args(&args);

    let profiles = Arc::new(settings.profile_registry()?);
    tracing::info!("Game profiles: {}", profiles.names().join(", "));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(settings, profiles))
}

async fn run(settings: Settings, profiles: Arc<ProfileRegistry>) -> anyhow::Result<()> {
    let pool = RconService::new(profiles, settings.client_timeouts());
    let hub = WebsocketService::start();

    PlayerTracker::new(Arc::new(OnlinePlayers::new()), hub.clone()).subscribe(&pool);
    let chat = ChatRelay::new(pool.clone(), hub.clone());
    chat.subscribe();

    for server in &settings.servers {
        if pool.profiles().get(&server.game).is_none() {
            tracing::warn!("Server {} runs unknown game {:?}, it won't be connected.", server.id, server.game);
        }
    }
    let servers = Arc::new(StaticServerStore::new(settings.servers.clone()));
    let watchdog = Watchdog::new(servers.clone(), pool.clone(), settings.watchdog_interval()).spawn();

    if settings.api_tokens.is_empty() {
        tracing::warn!("No API tokens are configured, UI clients won't be able to connect.");
    }
    let state = AppState {
        pool: pool.clone(),
        hub,
        chat,
        servers,
        auth: Arc::new(StaticTokens::new(settings.api_tokens.clone())),
    };

    tokio::select! {
        result = web::serve(state, settings.web_port) => result?,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Error with Ctrl+C handler: {e}");
            }
            tracing::info!("Shutting down.");
        }
    }

    watchdog.abort();
    for server in pool.get_clients().into_keys() {
        pool.delete_client(server);
    }
    Ok(())
}
