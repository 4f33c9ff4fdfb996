//! Standalone relay server for easel clients.
//!
//! Usage: `easel-relay --bind 0.0.0.0:9191 --room-capacity 256 --max-peers 100`
//! Log level comes from `RUST_LOG` (e.g. `RUST_LOG=info`).

use clap::Parser;
use easel_sync::relay::{RelayConfig, RelayServer};

#[derive(Parser)]
#[command(name = "easel-relay")]
#[command(version)]
#[command(about = "WebSocket relay fanning canvas changes out to peers", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// Frames buffered per peer before it lags
    #[arg(long)]
    room_capacity: Option<usize>,

    /// Peers allowed per canvas room
    #[arg(long)]
    max_peers: Option<usize>,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        let defaults = RelayConfig::default();
        RelayConfig {
            bind_addr: self.bind.unwrap_or(defaults.bind_addr),
            room_capacity: self.room_capacity.unwrap_or(defaults.room_capacity),
            max_peers_per_room: self.max_peers.unwrap_or(defaults.max_peers_per_room),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Cli::parse().into_config();
    log::info!(
        "Starting relay on {} (room capacity {}, max {} peers)",
        config.bind_addr,
        config.room_capacity,
        config.max_peers_per_room
    );

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
