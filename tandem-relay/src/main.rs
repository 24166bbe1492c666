//! Relay server binary.
//!
//! Usage:
//!   # Relay only
//!   cargo run -p tandem-relay
//!
//!   # Relay and keep the change log on disk
//!   cargo run -p tandem-relay -- --bind 0.0.0.0:9090 --storage ./tandem_data
//!
//! Log level comes from `RUST_LOG` (default `info`).

use clap::Parser;
use std::path::PathBuf;

use tandem_collab::server::{RelayServer, ServerConfig};

/// WebSocket relay for collaborative editing.
#[derive(Parser, Debug)]
#[command(name = "tandem-relay")]
#[command(about = "Relays edits, presence and cursors between editor clients")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory for the change-log database; omit to relay without storage
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Broadcast buffer per room, in frames
    #[arg(long, default_value_t = 256)]
    capacity: usize,

    /// Maximum connections per room
    #[arg(long, default_value_t = 100)]
    max_members: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: args.bind,
        max_members_per_room: args.max_members,
        broadcast_capacity: args.capacity,
        storage_path: args.storage,
    };

    match &config.storage_path {
        Some(path) => log::info!("Persisting change log to {}", path.display()),
        None => log::info!("Running without storage"),
    }

    let server = RelayServer::new(config)?;
    server.run().await
}
