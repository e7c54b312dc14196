//! Connection registrar
//!
//! Accepts `HELLO` handshakes on the well-known registration port, allocates
//! the next client id, binds that client's dedicated command channel and
//! answers with the assigned port. Command channel tasks are owned here and
//! joined on shutdown.
//!
//! Each handshake is read in its own task so a slow or silent peer never
//! holds up other registrations. Only channel assignment runs in the
//! registrar loop itself.

use crate::channel::run_command_channel;
use crate::state::ServerState;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_shared::{wire, ClientId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;

/// How long a registering peer may take to send its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// A peer that said `HELLO` and is waiting for its port
struct Greeting {
    writer: OwnedWriteHalf,
    addr: SocketAddr,
}

pub struct Registrar {
    state: Arc<ServerState>,
    listener: TcpListener,
    handlers: JoinSet<ClientId>,
    greeters: JoinSet<Option<Greeting>>,
    shutdown: watch::Receiver<bool>,
}

impl Registrar {
    pub fn new(
        state: Arc<ServerState>,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            listener,
            handlers: JoinSet::new(),
            greeters: JoinSet::new(),
            shutdown,
        }
    }

    /// Accepts handshakes until shutdown, then waits for every channel
    pub async fn run(mut self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Waiting for client registrations on {}", addr),
            Err(e) => warn!("Registrar address unavailable: {}", e),
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        self.greeters.spawn(read_handshake(stream, addr));
                    }
                    Err(e) => warn!("Registration accept failed: {}", e),
                },
                Some(greeted) = self.greeters.join_next(), if !self.greeters.is_empty() => {
                    match greeted {
                        Ok(Some(greeting)) => self.answer(greeting).await,
                        Ok(None) => {}
                        Err(e) => error!("Handshake task failed: {}", e),
                    }
                },
                Some(finished) = self.handlers.join_next(), if !self.handlers.is_empty() => {
                    match finished {
                        Ok(client_id) => debug!("Command channel for client {} finished", client_id),
                        Err(e) => error!("Command channel task failed: {}", e),
                    }
                },
                _ = self.shutdown.changed() => break,
            }
        }

        self.greeters.shutdown().await;
        info!("Registrar stopping, joining {} channel(s)", self.handlers.len());
        while let Some(finished) = self.handlers.join_next().await {
            if let Err(e) = finished {
                error!("Command channel task failed: {}", e);
            }
        }
    }

    /// Assigns a channel to a greeted peer and sends the reply off the loop
    async fn answer(&mut self, greeting: Greeting) {
        let reply = match self.assign_channel().await {
            Some(port) => wire::encode_port_reply(port),
            None => format!("{}\n", wire::FULL),
        };

        let Greeting { mut writer, addr } = greeting;
        tokio::spawn(async move {
            match timeout(HANDSHAKE_TIMEOUT, writer.write_all(reply.as_bytes())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Could not answer handshake from {}: {}", addr, e),
                Err(_) => warn!("Answering handshake from {} timed out", addr),
            }
        });
    }

    /// Allocates an id, binds its channel and spawns the handler
    ///
    /// Returns the assigned port, or None when no channel can be opened.
    async fn assign_channel(&mut self) -> Option<u16> {
        if self.handlers.len() >= self.state.config.max_clients {
            warn!("Rejecting registration, server full");
            return None;
        }

        let client_id = self.state.allocate_client_id();
        let Some(port) = self.state.config.command_port(client_id) else {
            error!("No command port left for client {}", client_id);
            return None;
        };

        let listener = match bind_channel(&self.state.config.host, port).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Could not bind port {} for client {}: {}", port, client_id, e);
                return None;
            }
        };

        self.state
            .sessions
            .lock()
            .await
            .register(client_id, port, Instant::now());

        self.handlers.spawn(run_command_channel(
            Arc::clone(&self.state),
            client_id,
            port,
            listener,
            self.shutdown.clone(),
        ));

        info!("Registered client {} on port {}", client_id, port);
        Some(port)
    }
}

/// Waits for a `HELLO` line; anything else closes the connection unanswered
async fn read_handshake(stream: TcpStream, addr: SocketAddr) -> Option<Greeting> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    match timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(read)) if read > 0 => {}
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => {
            debug!("Handshake read from {} failed: {}", addr, e);
            return None;
        }
        Err(_) => {
            debug!("Handshake from {} timed out", addr);
            return None;
        }
    }

    if !wire::is_control(&line, wire::HELLO) {
        warn!("Ignoring unexpected handshake {:?} from {}", line.trim(), addr);
        return None;
    }
    Some(Greeting { writer, addr })
}

async fn bind_channel(host: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((host, port)).await
}
