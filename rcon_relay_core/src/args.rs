use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load settings from this file instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Override the port to host the websocket and API on
    #[arg(long)]
    pub web_port: Option<u16>,
    /// Override how often (in seconds) missing server connections are retried
    #[arg(long)]
    pub watchdog_interval: Option<u64>,
}
