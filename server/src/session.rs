//! Per-client session tracking for the authoritative server
//!
//! This module keeps the server's view of every registered client:
//! - Session lifecycle (registration, first command, disconnect, timeout)
//! - The last command state each client reported (position, actions, tick)
//! - Last-contact tracking used by the broadcaster's idle eviction
//!
//! A session's player state is only ever written by that client's own
//! command channel (and by event handlers running inside the broadcaster
//! tick). The broadcaster reads it once per tick to build the snapshot.

use log::info;
use sync_shared::{ClientCommand, ClientId, Vec2};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Last command state reported by one client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerState {
    pub tick: u32,
    pub actions: u32,
    pub x: f32,
    pub y: f32,
    pub last_update: Instant,
}

impl PlayerState {
    pub fn from_command(cmd: &ClientCommand, now: Instant) -> Self {
        Self {
            tick: cmd.tick,
            actions: cmd.actions,
            x: cmd.x,
            y: cmd.y,
            last_update: now,
        }
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake done, no command received yet
    Registered,
    /// At least one valid command applied; the player is live in snapshots
    Active,
}

/// Server-side record of one connected client
#[derive(Debug)]
pub struct ClientSession {
    pub client_id: ClientId,
    /// Port of the client's dedicated command channel
    pub port: u16,
    pub state: SessionState,
    pub player: Option<PlayerState>,
    /// Last time the session was created, updated or respawned
    pub last_contact: Instant,
}

impl ClientSession {
    pub fn new(client_id: ClientId, port: u16, now: Instant) -> Self {
        Self {
            client_id,
            port,
            state: SessionState::Registered,
            player: None,
            last_contact: now,
        }
    }

    /// True once no contact happened for longer than `timeout` before `now`
    pub fn is_timed_out(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_contact) > timeout
    }
}

/// All live sessions, keyed and iterated in client id order
pub struct SessionRegistry {
    sessions: BTreeMap<ClientId, ClientSession>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: BTreeMap::new(),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Records a freshly registered client
    pub fn register(&mut self, client_id: ClientId, port: u16, now: Instant) {
        info!("Client {} registered on port {}", client_id, port);
        self.sessions
            .insert(client_id, ClientSession::new(client_id, port, now));
    }

    /// Stores the state carried by a valid command frame
    ///
    /// Last received wins; commands are never reordered. A command for a
    /// session that was already evicted re-creates it. Returns true if the
    /// session had to be created.
    pub fn apply_command(
        &mut self,
        client_id: ClientId,
        port: u16,
        cmd: &ClientCommand,
        now: Instant,
    ) -> bool {
        let mut created = false;
        let session = self.sessions.entry(client_id).or_insert_with(|| {
            created = true;
            ClientSession::new(client_id, port, now)
        });

        session.player = Some(PlayerState::from_command(cmd, now));
        session.state = SessionState::Active;
        session.last_contact = now;

        if created {
            info!("Client {} resumed after its session was dropped", client_id);
        }
        created
    }

    /// Moves a live player, used by spawn handling
    pub fn teleport(&mut self, client_id: ClientId, position: Vec2, now: Instant) -> bool {
        let Some(session) = self.sessions.get_mut(&client_id) else {
            return false;
        };
        let Some(player) = session.player.as_mut() else {
            return false;
        };

        player.x = position.x;
        player.y = position.y;
        player.last_update = now;
        session.last_contact = now;
        true
    }

    /// Removes a session. Returns false if it was already gone.
    pub fn remove(&mut self, client_id: ClientId) -> bool {
        self.sessions.remove(&client_id).is_some()
    }

    /// Drops every session idle for longer than the configured timeout
    ///
    /// Returns the evicted ids. Eviction is routine and logged at info.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<ClientId> {
        let timeout = self.idle_timeout;
        let timed_out: Vec<ClientId> = self
            .sessions
            .values()
            .filter(|session| session.is_timed_out(timeout, now))
            .map(|session| session.client_id)
            .collect();

        for client_id in &timed_out {
            self.sessions.remove(client_id);
            info!("Client {} timed out", client_id);
        }

        timed_out
    }

    pub fn session(&self, client_id: ClientId) -> Option<&ClientSession> {
        self.sessions.get(&client_id)
    }

    pub fn player(&self, client_id: ClientId) -> Option<&PlayerState> {
        self.sessions
            .get(&client_id)
            .and_then(|session| session.player.as_ref())
    }

    /// Ids and positions of every active player, in id order
    pub fn live_players(&self) -> Vec<(ClientId, Vec2)> {
        self.sessions
            .values()
            .filter_map(|session| {
                session
                    .player
                    .map(|player| (session.client_id, player.position()))
            })
            .collect()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.sessions.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
