//! Client connection to the synchronization server

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::mirror::MirrorState;
use crate::poller::{merge_into, run_poller, SnapshotPoller};
use crate::transmitter::{CommandTransmitter, SendOutcome, TcpRequestChannel, TransmitStats};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sync_shared::wire::{self, HandshakeReply};
use sync_shared::{ClientCommand, ClientId, WorldSnapshot};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub struct Client {
    client_id: ClientId,
    config: ClientConfig,
    transmitter: CommandTransmitter<TcpRequestChannel>,
    connected: bool,

    poller: Option<SnapshotPoller>,
    poller_task: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,

    mirror: Arc<Mutex<MirrorState>>,
    received: Arc<AtomicBool>,
}

impl Client {
    /// Registers with the server, opens the command channel and subscribes
    /// to snapshots
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        info!(
            "Connecting to {}:{}...",
            config.server_host, config.registration_port
        );

        let port = handshake(&config).await?;
        let client_id = port
            .checked_sub(config.command_base_port)
            .map(ClientId::from)
            .ok_or(ClientError::BadPort {
                port,
                base: config.command_base_port,
            })?;

        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect((config.server_host.as_str(), port)),
        )
        .await
        .map_err(|_| ClientError::Timeout("command channel"))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle: {}", e);
        }

        let broadcast = resolve(&config.server_host, config.broadcast_port).await?;
        let mut poller = SnapshotPoller::bind(broadcast, config.resubscribe_interval).await?;
        poller.subscribe().await?;

        info!("Connected! Client ID: {} (command port {})", client_id, port);

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            client_id,
            transmitter: CommandTransmitter::new(TcpRequestChannel::new(stream)),
            connected: true,
            poller: Some(poller),
            poller_task: None,
            stop_tx,
            mirror: Arc::new(Mutex::new(MirrorState::new(Some(client_id)))),
            received: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn id(&self) -> ClientId {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Command stamped with this client's id
    pub fn command(&self, tick: u32, actions: u32, x: f32, y: f32) -> ClientCommand {
        ClientCommand::new(self.client_id, tick, actions, x, y)
    }

    /// Sends this tick's command, or skips it while a reply is outstanding
    pub async fn send_command(&mut self, cmd: &ClientCommand) -> Result<SendOutcome, ClientError> {
        if !self.connected {
            return Err(not_connected());
        }
        let result = self.transmitter.send_command(cmd).await;
        if let Err(ClientError::NotConnected(e)) = &result {
            warn!("Command channel lost: {}", e);
            self.connected = false;
        }
        result
    }

    /// Waits up to the configured reply timeout for the outstanding reply
    pub async fn await_reply(&mut self) -> Result<(), ClientError> {
        self.transmitter.wait_for_reply(self.config.reply_timeout).await
    }

    pub fn stats(&self) -> TransmitStats {
        self.transmitter.stats()
    }

    /// Polls for snapshots without blocking and merges the newest one
    ///
    /// Always None once the background poller owns the socket.
    pub async fn poll_snapshot(&mut self) -> Option<WorldSnapshot> {
        let poller = self.poller.as_mut()?;
        if let Err(e) = poller.resubscribe_if_due(Instant::now()).await {
            debug!("Resubscribe failed: {}", e);
        }

        let snapshot = poller.poll()?;
        merge_into(&self.mirror, &self.received, &snapshot).await;
        Some(snapshot)
    }

    /// Hands the snapshot socket to a background task that keeps the mirror
    /// current. Calling it again just returns the mirror.
    pub fn spawn_poller(&mut self) -> Arc<Mutex<MirrorState>> {
        if let Some(poller) = self.poller.take() {
            self.poller_task = Some(tokio::spawn(run_poller(
                poller,
                Arc::clone(&self.mirror),
                Arc::clone(&self.received),
                self.stop_tx.subscribe(),
            )));
        }
        self.mirror()
    }

    pub fn mirror(&self) -> Arc<Mutex<MirrorState>> {
        Arc::clone(&self.mirror)
    }

    pub fn has_received_snapshot(&self) -> bool {
        self.received.load(Ordering::SeqCst)
    }

    /// Says goodbye on the command channel and stops receiving snapshots
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        let result = if self.connected {
            self.transmitter
                .disconnect(self.client_id, self.config.reply_timeout)
                .await
        } else {
            Ok(())
        };
        self.connected = false;

        if let Some(mut poller) = self.poller.take() {
            if let Err(e) = poller.unsubscribe().await {
                debug!("Unsubscribe failed: {}", e);
            }
        }
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.poller_task.take() {
            if let Err(e) = task.await {
                warn!("Snapshot poller task failed: {}", e);
            }
        }

        info!("Client {} disconnected", self.client_id);
        result
    }
}

fn not_connected() -> ClientError {
    ClientError::NotConnected(io::Error::new(
        io::ErrorKind::NotConnected,
        "command channel closed",
    ))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            ClientError::NotConnected(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}", host),
            ))
        })
}

/// Says `HELLO` and returns the assigned command port
async fn handshake(config: &ClientConfig) -> Result<u16, ClientError> {
    let exchange = async {
        let mut stream =
            TcpStream::connect((config.server_host.as_str(), config.registration_port)).await?;
        stream
            .write_all(format!("{}\n", wire::HELLO).as_bytes())
            .await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok::<_, io::Error>(reply)
    };

    let reply = timeout(config.connect_timeout, exchange)
        .await
        .map_err(|_| ClientError::Timeout("registration"))??;

    match wire::decode_handshake_reply(&reply).map_err(ClientError::Handshake)? {
        HandshakeReply::Assigned(port) => Ok(port),
        HandshakeReply::Full => Err(ClientError::ServerFull),
    }
}
