//! Fixed-cadence snapshot broadcaster
//!
//! Every tick the broadcaster, in order:
//! 1. advances every synced object
//! 2. dispatches domain events due at this tick
//! 3. evicts idle sessions
//! 4. computes the ids that left since the previous tick
//! 5. publishes one full snapshot to every subscriber, fire-and-forget

use crate::state::ServerState;
use log::{debug, error, info, trace};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_shared::{wire, ClientId, WorldSnapshot};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Ids present at the previous tick but missing now
pub fn compute_removed_ids(
    previous: &BTreeSet<ClientId>,
    current: &BTreeSet<ClientId>,
) -> Vec<ClientId> {
    previous.difference(current).copied().collect()
}

/// Builds one snapshot per tick from the shared server state
pub struct Broadcaster {
    state: Arc<ServerState>,
    tick: u32,
    previous_players: BTreeSet<ClientId>,
}

impl Broadcaster {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            tick: 0,
            previous_players: BTreeSet::new(),
        }
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Runs one broadcaster tick as of `now` and returns the snapshot to publish
    pub async fn step(&mut self, now: Instant) -> WorldSnapshot {
        self.tick = self.tick.wrapping_add(1);
        let mut snapshot = WorldSnapshot::new(self.tick);

        {
            let mut objects = self.state.objects.lock().await;
            objects.advance(self.state.config.tick_seconds());
            snapshot.synced_objects = objects.snapshot_data();
        }

        let players = {
            let mut sessions = self.state.sessions.lock().await;
            let dispatched = self.state.events.dispatch(self.tick, &mut sessions).await;
            if dispatched > 0 {
                trace!("Tick {}: dispatched {} event(s)", self.tick, dispatched);
            }
            sessions.evict_idle(now);
            sessions.live_players()
        };

        let current: BTreeSet<ClientId> = players.iter().map(|(id, _)| *id).collect();
        snapshot.removed_ids = compute_removed_ids(&self.previous_players, &current);
        self.previous_players = current;

        for (id, position) in players {
            snapshot.push_player(id, position);
        }

        snapshot
    }
}

/// Broadcast endpoint bookkeeping: who subscribed and when they last did
pub struct SnapshotPublisher {
    socket: Arc<UdpSocket>,
    subscribers: HashMap<SocketAddr, Instant>,
    ttl: Duration,
}

impl SnapshotPublisher {
    pub fn new(socket: Arc<UdpSocket>, ttl: Duration) -> Self {
        Self {
            socket,
            subscribers: HashMap::new(),
            ttl,
        }
    }

    /// Handles a control datagram sent to the broadcast endpoint
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        let text = String::from_utf8_lossy(data);
        if wire::is_control(&text, wire::SUBSCRIBE) {
            if self.subscribers.insert(from, now).is_none() {
                info!("Subscriber {} joined", from);
            }
        } else if wire::is_control(&text, wire::UNSUBSCRIBE) {
            if self.subscribers.remove(&from).is_some() {
                info!("Subscriber {} left", from);
            }
        } else {
            debug!("Ignoring datagram from {}", from);
        }
    }

    /// Forgets subscribers that stopped refreshing their subscription
    pub fn expire(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.subscribers.retain(|addr, seen| {
            let alive = now.saturating_duration_since(*seen) <= ttl;
            if !alive {
                debug!("Subscriber {} expired", addr);
            }
            alive
        });
    }

    /// Sends `frame` to every subscriber without waiting
    ///
    /// Returns how many datagrams left the socket. Failures are dropped.
    pub fn publish(&self, frame: &str) -> usize {
        self.subscribers
            .keys()
            .filter(|addr| match self.socket.try_send_to(frame.as_bytes(), **addr) {
                Ok(_) => true,
                Err(e) => {
                    trace!("Snapshot to {} dropped: {}", addr, e);
                    false
                }
            })
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Runs the broadcaster until shutdown
pub async fn run_broadcaster(
    state: Arc<ServerState>,
    socket: UdpSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let mut broadcaster = Broadcaster::new(Arc::clone(&state));
    let mut publisher = SnapshotPublisher::new(Arc::clone(&socket), state.config.idle_timeout);

    match socket.local_addr() {
        Ok(addr) => info!("Publishing snapshots on {}", addr),
        Err(e) => error!("Broadcast address unavailable: {}", e),
    }

    let mut ticker = interval(state.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Skip the first tick since it fires immediately
    ticker.tick().await;

    let mut buffer = [0u8; 512];
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                let snapshot = broadcaster.step(now).await;
                publisher.expire(now);

                match wire::encode_snapshot(&snapshot) {
                    Ok(frame) => {
                        let sent = publisher.publish(&frame);
                        if snapshot.tick % 300 == 0 {
                            debug!(
                                "Tick {}: {} player(s), {} subscriber(s), {} sent",
                                snapshot.tick,
                                snapshot.player_ids.len(),
                                publisher.subscriber_count(),
                                sent
                            );
                        }
                    }
                    Err(e) => error!("Could not encode snapshot {}: {}", snapshot.tick, e),
                }
            },
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, from)) => publisher.handle_datagram(&buffer[..len], from, Instant::now()),
                Err(e) => debug!("Broadcast endpoint receive error: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("Broadcaster stopped after tick {}", broadcaster.tick());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use sync_shared::{ClientCommand, Event, Vec2};

    fn set(ids: &[ClientId]) -> BTreeSet<ClientId> {
        ids.iter().copied().collect()
    }

    async fn activate(state: &ServerState, id: ClientId, x: f32, y: f32, now: Instant) {
        let mut sessions = state.sessions.lock().await;
        sessions.register(id, 5556 + id as u16, now);
        sessions.apply_command(id, 5556 + id as u16, &ClientCommand::new(id, 1, 0, x, y), now);
    }

    #[test]
    fn test_removed_ids_difference() {
        assert_eq!(compute_removed_ids(&set(&[1, 2, 3]), &set(&[1, 3])), vec![2]);
        assert!(compute_removed_ids(&set(&[1, 2, 3]), &set(&[1, 2, 3])).is_empty());
        assert!(compute_removed_ids(&set(&[]), &set(&[4])).is_empty());
        assert_eq!(compute_removed_ids(&set(&[5, 6]), &set(&[])), vec![5, 6]);
    }

    #[tokio::test]
    async fn test_step_builds_full_snapshot() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let now = Instant::now();
        activate(&state, 0, 10.0, 20.0, now).await;
        activate(&state, 1, 30.0, 40.0, now).await;

        let mut broadcaster = Broadcaster::new(Arc::clone(&state));
        let snapshot = broadcaster.step(now).await;

        assert_eq!(snapshot.tick, 1);
        assert_eq!(snapshot.player_ids, vec![0, 1]);
        assert_eq!(snapshot.player_positions, vec![Vec2::new(10.0, 20.0), Vec2::new(30.0, 40.0)]);
        assert_eq!(snapshot.synced_objects.len(), 3);
        assert!(snapshot.removed_ids.is_empty());

        // Objects moved before the snapshot was taken
        assert!(snapshot.synced_objects[0].position.x > 1100.0);
    }

    #[tokio::test]
    async fn test_registered_but_silent_clients_are_not_players() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let now = Instant::now();
        state.sessions.lock().await.register(0, 5556, now);

        let mut broadcaster = Broadcaster::new(Arc::clone(&state));
        assert!(broadcaster.step(now).await.player_ids.is_empty());
    }

    #[tokio::test]
    async fn test_idle_session_evicted_and_reported_once() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let start = Instant::now();
        activate(&state, 0, 1.0, 1.0, start).await;
        activate(&state, 1, 2.0, 2.0, start).await;

        let mut broadcaster = Broadcaster::new(Arc::clone(&state));
        assert_eq!(broadcaster.step(start).await.player_ids, vec![0, 1]);

        // Client 1 keeps talking, client 0 goes silent
        let later = start + Duration::from_secs(2);
        state.sessions.lock().await.apply_command(
            1,
            5557,
            &ClientCommand::new(1, 2, 0, 2.0, 2.0),
            later,
        );

        let evicted_at = start + Duration::from_millis(3500);
        let snapshot = broadcaster.step(evicted_at).await;
        assert_eq!(snapshot.player_ids, vec![1]);
        assert_eq!(snapshot.removed_ids, vec![0]);

        let snapshot = broadcaster.step(evicted_at).await;
        assert_eq!(snapshot.player_ids, vec![1]);
        assert!(snapshot.removed_ids.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_shows_up_in_removed_ids() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let now = Instant::now();
        activate(&state, 0, 1.0, 1.0, now).await;
        activate(&state, 2, 1.0, 1.0, now).await;

        let mut broadcaster = Broadcaster::new(Arc::clone(&state));
        broadcaster.step(now).await;

        state.sessions.lock().await.remove(2);
        let snapshot = broadcaster.step(now).await;
        assert_eq!(snapshot.removed_ids, vec![2]);
        assert_eq!(snapshot.player_ids, vec![0]);
    }

    #[tokio::test]
    async fn test_step_dispatches_due_events() {
        let state = Arc::new(ServerState::new(ServerConfig::default()));
        let now = Instant::now();
        activate(&state, 0, 1.0, 1.0, now).await;
        state
            .events
            .raise(Event::new("Death").with_param("playerId", 0), 1)
            .await;

        let mut broadcaster = Broadcaster::new(Arc::clone(&state));
        let snapshot = broadcaster.step(now).await;

        assert_eq!(snapshot.player_positions, vec![Vec2::new(300.0, 500.0)]);
    }

    #[tokio::test]
    async fn test_publisher_subscriptions() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let mut publisher = SnapshotPublisher::new(server, Duration::from_secs(3));
        let start = Instant::now();

        publisher.handle_datagram(b"SUBSCRIBE", client_addr, start);
        publisher.handle_datagram(b"SUBSCRIBE\n", client_addr, start);
        publisher.handle_datagram(b"garbage", client_addr, start);
        assert_eq!(publisher.subscriber_count(), 1);

        assert_eq!(publisher.publish("SNAP 1 0 0 0\n"), 1);
        let mut buf = [0u8; 64];
        let len = client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"SNAP 1 0 0 0\n");

        publisher.expire(start + Duration::from_secs(4));
        assert_eq!(publisher.subscriber_count(), 0);

        publisher.handle_datagram(b"SUBSCRIBE", client_addr, start);
        publisher.handle_datagram(b"UNSUBSCRIBE", client_addr, start);
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
