use clap::Parser;
use log::{error, info};
use std::time::Duration;
use sync_server::config::ServerConfig;
use sync_server::events::{DEFAULT_EVENT_HORIZON, DEFAULT_MAX_PENDING_EVENTS};
use sync_server::network::Server;
use sync_shared::{BROADCAST_PORT, COMMAND_BASE_PORT, DEFAULT_TICK_INTERVAL_MS, REGISTRATION_PORT};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to bind every endpoint to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Registration port clients say HELLO to
    #[arg(short = 'r', long, default_value_t = REGISTRATION_PORT)]
    registration_port: u16,

    /// Port snapshots are published from
    #[arg(short = 'b', long, default_value_t = BROADCAST_PORT)]
    broadcast_port: u16,

    /// First per-client command port
    #[arg(short = 'c', long, default_value_t = COMMAND_BASE_PORT)]
    command_base_port: u16,

    /// Broadcast interval in milliseconds
    #[arg(short = 't', long, default_value_t = DEFAULT_TICK_INTERVAL_MS)]
    tick_ms: u64,

    /// Seconds of silence before a client is evicted
    #[arg(long, default_value = "3")]
    idle_timeout: u64,

    /// Maximum number of simultaneous clients
    #[arg(short = 'm', long, default_value = "32")]
    max_clients: usize,

    /// Furthest number of ticks ahead a client may schedule an event
    #[arg(long, default_value_t = DEFAULT_EVENT_HORIZON)]
    event_horizon: u32,

    /// Pending events held before new ones are dropped
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING_EVENTS)]
    max_pending_events: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        registration_port: args.registration_port,
        broadcast_port: args.broadcast_port,
        command_base_port: args.command_base_port,
        tick_interval: Duration::from_millis(args.tick_ms.max(1)),
        idle_timeout: Duration::from_secs(args.idle_timeout),
        max_clients: args.max_clients,
        event_horizon: args.event_horizon,
        max_pending_events: args.max_pending_events,
    };

    info!("Starting server...");
    info!(
        "Tick interval {:?}, idle timeout {:?}, max {} clients",
        config.tick_interval, config.idle_timeout, config.max_clients
    );

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Could not bind server endpoints: {}", e);
            return Err(e);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down gracefully...");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await
}
