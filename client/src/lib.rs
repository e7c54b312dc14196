//! # State Synchronization Client
//!
//! This library provides the client side of the state synchronization
//! protocol. A game embeds it to push its local player's state to the server
//! once per tick and to keep a local mirror of everything else in the world.
//!
//! ## Architecture Overview
//!
//! ### Command Transmission
//! Each client owns a dedicated half-duplex command channel. Only one request
//! may be in flight, so a tick whose previous request is still unanswered
//! is skipped instead of queued. The next tick carries the newer state anyway.
//!
//! ### Snapshot Mirroring
//! The server publishes a full world snapshot every tick. The client drains
//! its snapshot socket without blocking, keeps only the newest snapshot and
//! merges it into a [`mirror::MirrorState`]: synced objects are created or
//! updated, other players are created, updated or removed, and the local
//! player is left to the game itself.
//!
//! ### Failure Model
//! Nothing here panics or blocks the game loop on the network. Transport
//! failures come back as [`error::ClientError`] values; a missing or
//! malformed snapshot simply leaves the mirror as it was.
//!
//! ## Module Organization
//!
//! - `config`: server address, ports and timeouts
//! - `error`: the error type of every fallible client call
//! - `network`: [`network::Client`], the connection as a whole
//! - `transmitter`: the half-duplex command transmitter
//! - `poller`: non-blocking snapshot reception
//! - `mirror`: the local copy of the world
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use sync_client::config::ClientConfig;
//! use sync_client::network::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::connect(ClientConfig::default()).await?;
//!     let mirror = client.spawn_poller();
//!
//!     let mut ticker = tokio::time::interval(Duration::from_millis(33));
//!     for tick in 0..300 {
//!         ticker.tick().await;
//!         let cmd = client.command(tick, 0, 100.0, 200.0);
//!         client.send_command(&cmd).await?;
//!
//!         let mirror = mirror.lock().await;
//!         for (id, position) in mirror.players() {
//!             println!("player {} at ({}, {})", id, position.x, position.y);
//!         }
//!     }
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod mirror;
pub mod network;
pub mod poller;
pub mod transmitter;
