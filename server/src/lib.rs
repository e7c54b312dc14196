//! # State Synchronization Server
//!
//! This library provides the authoritative server side of the state
//! synchronization protocol. It owns the canonical player and object state,
//! accepts commands from clients over dedicated per-client channels, and
//! publishes a full world snapshot to every subscriber at a fixed cadence.
//!
//! ## Core Responsibilities
//!
//! ### Registration
//! New clients say `HELLO` on the well-known registration port. The server
//! hands out the next client id and answers with the port of that client's
//! own command channel, or `FULL` when no more clients fit.
//!
//! ### Command Processing
//! Each command channel is half-duplex: one request, one `Acknowledged`
//! reply. Commands overwrite the sending client's player state and may carry
//! domain events, which are queued for the tick the command names.
//!
//! ### Snapshot Broadcasting
//! Every tick the broadcaster advances the server-controlled objects,
//! dispatches due events, evicts idle sessions, and publishes one snapshot
//! listing every live player, every synced object and the ids that left
//! since the previous tick.
//!
//! ## Architecture Design
//!
//! ### Task Layout
//! The server runs one registrar task, one task per command channel and one
//! broadcaster task on the tokio runtime. They share a single
//! [`state::ServerState`] whose maps each sit behind their own mutex. No lock
//! is ever held across socket I/O.
//!
//! ### Transports
//! Registration and command channels use TCP so every request gets exactly
//! one reply. Snapshots go out over UDP, fire-and-forget: a slow or vanished
//! subscriber never stalls the tick.
//!
//! ### Shutdown
//! Every task watches a shared `watch` channel. Flipping it to `true` makes
//! the registrar stop accepting, every channel close, and the broadcaster
//! finish its current tick.
//!
//! ## Module Organization
//!
//! - `config`: endpoints, cadence and limits
//! - `session`: per-client session and player state
//! - `world`: server-controlled synced objects and their motion rules
//! - `events`: tick-scheduled domain event dispatch
//! - `state`: the state shared by every task
//! - `registrar`: handshake handling and command channel ownership
//! - `channel`: one client's command channel
//! - `broadcaster`: the tick loop and snapshot publishing
//! - `network`: binds the endpoints and runs everything
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use sync_server::config::ServerConfig;
//! use sync_server::network::Server;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         let _ = shutdown_tx.send(true);
//!     });
//!
//!     server.run(shutdown_rx).await
//! }
//! ```

pub mod broadcaster;
pub mod channel;
pub mod config;
pub mod events;
pub mod network;
pub mod registrar;
pub mod session;
pub mod state;
pub mod world;
