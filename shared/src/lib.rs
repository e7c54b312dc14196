//! # Shared Protocol Library
//!
//! Types and constants used by both the authoritative server and the game
//! clients. Everything that crosses the network is defined here, together with
//! the text codec that turns it into frames.
//!
//! ## Message shapes
//!
//! From the gameplay layer's point of view the protocol carries exactly two
//! things:
//! - a per-tick [`ClientCommand`] (action bitmask, position, pending events)
//!   sent client → server over the client's dedicated command channel
//! - a [`WorldSnapshot`] (live players, synced-object positions, removed ids)
//!   broadcast server → every client
//!
//! The framing and grammar live in the [`wire`] module.

pub mod event;
pub mod wire;

pub use event::{Event, ParamValue};
pub use wire::WireError;

use serde::{Deserialize, Serialize};

/// Well-known TCP port clients send their `HELLO` handshake to.
pub const REGISTRATION_PORT: u16 = 5550;
/// Well-known UDP port the server publishes snapshots from.
pub const BROADCAST_PORT: u16 = 5555;
/// Command channels are bound at `COMMAND_BASE_PORT + client_id`.
pub const COMMAND_BASE_PORT: u16 = 5556;

pub const WORLD_WIDTH: f32 = 1920.0;
pub const WORLD_HEIGHT: f32 = 1080.0;

/// Server tick interval in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 33;
/// Upper bound on events embedded in a single command frame.
pub const MAX_EVENTS_PER_COMMAND: usize = 64;

pub type ClientId = u32;
pub type ObjectId = u32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Input sent from a client to the server once per client tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCommand {
    pub client_id: ClientId,
    pub tick: u32,
    /// 32 bit action mask, each game assigns its own meaning to the bits
    pub actions: u32,
    pub x: f32,
    pub y: f32,
    pub events: Vec<Event>,
}

impl ClientCommand {
    pub fn new(client_id: ClientId, tick: u32, actions: u32, x: f32, y: f32) -> Self {
        Self {
            client_id,
            tick,
            actions,
            x,
            y,
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }
}

/// Position of one server-simulated object as seen in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncedObjectData {
    pub id: ObjectId,
    pub type_id: u32,
    pub position: Vec2,
}

/// Complete world state at one server tick
///
/// `player_ids` and `player_positions` are parallel arrays indexed together.
/// Use [`WorldSnapshot::push_player`] to keep them the same length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u32,
    pub player_ids: Vec<ClientId>,
    pub player_positions: Vec<Vec2>,
    pub synced_objects: Vec<SyncedObjectData>,
    pub removed_ids: Vec<ClientId>,
}

impl WorldSnapshot {
    pub fn new(tick: u32) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    pub fn push_player(&mut self, id: ClientId, position: Vec2) {
        self.player_ids.push(id);
        self.player_positions.push(position);
    }

    /// Iterates `(id, position)` pairs of every live player
    pub fn players(&self) -> impl Iterator<Item = (ClientId, Vec2)> + '_ {
        self.player_ids
            .iter()
            .copied()
            .zip(self.player_positions.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_player_keeps_arrays_parallel() {
        let mut snapshot = WorldSnapshot::new(7);
        snapshot.push_player(3, Vec2::new(1.0, 2.0));
        snapshot.push_player(9, Vec2::new(-4.0, 8.5));

        assert_eq!(snapshot.tick, 7);
        assert_eq!(snapshot.player_ids.len(), snapshot.player_positions.len());

        let players: Vec<_> = snapshot.players().collect();
        assert_eq!(players, vec![(3, Vec2::new(1.0, 2.0)), (9, Vec2::new(-4.0, 8.5))]);
    }

    #[test]
    fn test_command_builder() {
        let cmd = ClientCommand::new(2, 40, 0b101, 12.5, 80.0).with_event(Event::new("Jump"));

        assert_eq!(cmd.client_id, 2);
        assert_eq!(cmd.tick, 40);
        assert_eq!(cmd.actions, 5);
        assert_eq!(cmd.events.len(), 1);
        assert_eq!(cmd.events[0].kind, "Jump");
    }

    #[test]
    fn test_port_layout() {
        assert!(COMMAND_BASE_PORT > BROADCAST_PORT);
        assert!(COMMAND_BASE_PORT > REGISTRATION_PORT);
    }
}
