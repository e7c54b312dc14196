//! Server configuration

use crate::events::{DEFAULT_EVENT_HORIZON, DEFAULT_MAX_PENDING_EVENTS};
use sync_shared::{
    ClientId, BROADCAST_PORT, COMMAND_BASE_PORT, DEFAULT_TICK_INTERVAL_MS, REGISTRATION_PORT,
};
use std::time::Duration;

/// Runtime settings for the authoritative server
///
/// `Default` gives the well-known ports and the timings the game clients
/// expect; the binary overrides individual fields from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface every endpoint binds to
    pub host: String,
    pub registration_port: u16,
    pub broadcast_port: u16,
    /// Command channel for client `n` is bound at `command_base_port + n`
    pub command_base_port: u16,
    /// Broadcaster cadence, also the fixed motion integration step
    pub tick_interval: Duration,
    /// Sessions silent for longer than this are evicted
    pub idle_timeout: Duration,
    /// Maximum number of concurrently open command channels
    pub max_clients: usize,
    /// Events may be scheduled at most this many ticks past the server tick
    pub event_horizon: u32,
    /// Capacity of the pending event queue
    pub max_pending_events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            registration_port: REGISTRATION_PORT,
            broadcast_port: BROADCAST_PORT,
            command_base_port: COMMAND_BASE_PORT,
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            idle_timeout: Duration::from_secs(3),
            max_clients: 32,
            event_horizon: DEFAULT_EVENT_HORIZON,
            max_pending_events: DEFAULT_MAX_PENDING_EVENTS,
        }
    }
}

impl ServerConfig {
    /// Port of the dedicated command channel for `client_id`
    ///
    /// Returns None once ids run past the end of the port range.
    pub fn command_port(&self, client_id: ClientId) -> Option<u16> {
        u16::try_from(client_id)
            .ok()
            .and_then(|offset| self.command_base_port.checked_add(offset))
    }

    pub fn tick_seconds(&self) -> f32 {
        self.tick_interval.as_secs_f32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_defaults_match_well_known_ports() {
        let config = ServerConfig::default();
        assert_eq!(config.registration_port, 5550);
        assert_eq!(config.broadcast_port, 5555);
        assert_eq!(config.command_base_port, 5556);
        assert_eq!(config.idle_timeout, Duration::from_secs(3));
        assert_approx_eq!(config.tick_seconds(), 0.033, 1e-6);
    }

    #[test]
    fn test_command_port_derivation() {
        let config = ServerConfig::default();
        assert_eq!(config.command_port(0), Some(5556));
        assert_eq!(config.command_port(1), Some(5557));
        assert_eq!(config.command_port(70_000), None);

        let config = ServerConfig {
            command_base_port: u16::MAX - 1,
            ..ServerConfig::default()
        };
        assert_eq!(config.command_port(1), Some(u16::MAX));
        assert_eq!(config.command_port(2), None);
    }
}
