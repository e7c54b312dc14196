//! Snapshot poller
//!
//! Snapshots arrive as UDP datagrams from the server's broadcast endpoint.
//! Delivery is lossy and latest-wins: a poll drains whatever has queued up
//! and keeps only the newest snapshot that decodes.

use crate::mirror::MirrorState;
use log::{debug, info, trace, warn};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_shared::{wire, WorldSnapshot};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};

const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

pub struct SnapshotPoller {
    socket: UdpSocket,
    buffer: Vec<u8>,
    resubscribe_interval: Duration,
    last_subscribe: Option<Instant>,
}

impl SnapshotPoller {
    /// Binds an ephemeral socket aimed at the server's broadcast endpoint
    pub async fn bind(server: SocketAddr, resubscribe_interval: Duration) -> io::Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        Ok(Self {
            socket,
            buffer: vec![0u8; MAX_DATAGRAM_BYTES],
            resubscribe_interval,
            last_subscribe: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn subscribe(&mut self) -> io::Result<()> {
        self.socket.send(wire::SUBSCRIBE.as_bytes()).await?;
        self.last_subscribe = Some(Instant::now());
        Ok(())
    }

    /// Refreshes the subscription if the last one is older than the interval
    pub async fn resubscribe_if_due(&mut self, now: Instant) -> io::Result<()> {
        let due = self
            .last_subscribe
            .map_or(true, |at| now.saturating_duration_since(at) >= self.resubscribe_interval);
        if due {
            self.subscribe().await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&mut self) -> io::Result<()> {
        self.socket.send(wire::UNSUBSCRIBE.as_bytes()).await?;
        self.last_subscribe = None;
        Ok(())
    }

    /// Drains every queued datagram without blocking
    ///
    /// Returns the decodable snapshot with the highest tick, or None when
    /// nothing usable arrived.
    pub fn poll(&mut self) -> Option<WorldSnapshot> {
        let mut newest: Option<WorldSnapshot> = None;

        loop {
            let len = match self.socket.try_recv(&mut self.buffer) {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Snapshot receive failed: {}", e);
                    break;
                }
            };

            let text = String::from_utf8_lossy(&self.buffer[..len]);
            match wire::decode_snapshot(&text) {
                Ok(snapshot) => {
                    if newest.as_ref().map_or(true, |n| snapshot.tick >= n.tick) {
                        newest = Some(snapshot);
                    }
                }
                Err(e) => warn!("Dropping undecodable snapshot: {}", e),
            }
        }

        newest
    }

    /// Waits until a datagram may be available
    pub async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }
}

/// Merges `snapshot` into the shared mirror, flagging the first arrival
pub async fn merge_into(
    mirror: &Mutex<MirrorState>,
    received: &AtomicBool,
    snapshot: &WorldSnapshot,
) {
    let report = mirror.lock().await.merge(snapshot);
    if let Some(report) = report {
        if !received.swap(true, Ordering::SeqCst) {
            info!("First snapshot received at tick {}", snapshot.tick);
        }
        trace!("Merged snapshot {}: {:?}", snapshot.tick, report);
    }
}

/// Background poller: merges snapshots as they arrive and keeps the
/// subscription alive until `stop` flips
pub async fn run_poller(
    mut poller: SnapshotPoller,
    mirror: Arc<Mutex<MirrorState>>,
    received: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut resubscribe = interval(poller.resubscribe_interval);
    resubscribe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ready = poller.readable() => {
                if let Err(e) = ready {
                    warn!("Snapshot socket failed: {}", e);
                    break;
                }
                if let Some(snapshot) = poller.poll() {
                    merge_into(&mirror, &received, &snapshot).await;
                }
            },
            _ = resubscribe.tick() => {
                if let Err(e) = poller.subscribe().await {
                    debug!("Resubscribe failed: {}", e);
                }
            },
            _ = stop.changed() => break,
        }
    }

    if let Err(e) = poller.unsubscribe().await {
        debug!("Unsubscribe failed: {}", e);
    }
    debug!("Snapshot poller stopped");
}
