use std::time::Duration;
use sync_shared::{BROADCAST_PORT, COMMAND_BASE_PORT, REGISTRATION_PORT};

/// Where the server lives and how patient the client is with it
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub registration_port: u16,
    pub broadcast_port: u16,
    /// Must match the server's base; the client id is derived from it
    pub command_base_port: u16,
    /// Bound on each connect and on the handshake reply
    pub connect_timeout: Duration,
    /// Bound on waiting for an outstanding reply when the caller asks to
    pub reply_timeout: Duration,
    /// How often the broadcast subscription is refreshed
    pub resubscribe_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            registration_port: REGISTRATION_PORT,
            broadcast_port: BROADCAST_PORT,
            command_base_port: COMMAND_BASE_PORT,
            connect_timeout: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(1),
            resubscribe_interval: Duration::from_secs(1),
        }
    }
}
