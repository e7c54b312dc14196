//! Server entry point tying the registrar and broadcaster together

use crate::broadcaster::run_broadcaster;
use crate::config::ServerConfig;
use crate::registrar::Registrar;
use crate::state::ServerState;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

/// Synchronization server with its well-known endpoints bound
pub struct Server {
    state: Arc<ServerState>,
    registration: TcpListener,
    broadcast: UdpSocket,
}

impl Server {
    /// Binds the registration and broadcast endpoints
    ///
    /// Failing to bind either one is the only fatal server error.
    pub async fn bind(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let registration =
            TcpListener::bind((config.host.as_str(), config.registration_port)).await?;
        let broadcast = UdpSocket::bind((config.host.as_str(), config.broadcast_port)).await?;
        info!(
            "Server bound: registration {}, broadcast {}",
            registration.local_addr()?,
            broadcast.local_addr()?
        );

        Ok(Self {
            state: Arc::new(ServerState::new(config)),
            registration,
            broadcast,
        })
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub fn registration_addr(&self) -> std::io::Result<SocketAddr> {
        self.registration.local_addr()
    }

    pub fn broadcast_addr(&self) -> std::io::Result<SocketAddr> {
        self.broadcast.local_addr()
    }

    /// Runs until `shutdown` flips to true, then waits for every task
    pub async fn run(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let registrar = Registrar::new(Arc::clone(&self.state), self.registration, shutdown.clone());
        let registrar_handle = tokio::spawn(registrar.run());
        let broadcaster_handle = tokio::spawn(run_broadcaster(
            Arc::clone(&self.state),
            self.broadcast,
            shutdown,
        ));

        let (registrar_result, broadcaster_result) = tokio::join!(registrar_handle, broadcaster_handle);
        if let Err(e) = &registrar_result {
            error!("Registrar task panicked: {}", e);
        }
        if let Err(e) = &broadcaster_result {
            error!("Broadcaster task panicked: {}", e);
        }
        registrar_result?;
        broadcaster_result?;

        info!("Server stopped");
        Ok(())
    }
}
