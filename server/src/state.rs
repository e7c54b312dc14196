//! Process-wide server state shared by every task

use crate::config::ServerConfig;
use crate::events::EventScheduler;
use crate::session::SessionRegistry;
use crate::world::SyncedObjectStore;
use std::sync::atomic::{AtomicU32, Ordering};
use sync_shared::ClientId;
use tokio::sync::Mutex;

/// Everything the registrar, command channels and broadcaster share
///
/// Each map sits behind its own mutex, held only for the mutation itself and
/// never across socket I/O.
pub struct ServerState {
    pub config: ServerConfig,
    pub sessions: Mutex<SessionRegistry>,
    pub objects: Mutex<SyncedObjectStore>,
    pub events: EventScheduler,
    next_client_id: AtomicU32,
}

impl ServerState {
    /// State with the default world layout and built-in event handlers
    pub fn new(config: ServerConfig) -> Self {
        let events = EventScheduler::with_default_handlers()
            .with_limits(config.event_horizon, config.max_pending_events);
        Self::with_parts(config, SyncedObjectStore::with_default_objects(), events)
    }

    pub fn with_parts(
        config: ServerConfig,
        objects: SyncedObjectStore,
        events: EventScheduler,
    ) -> Self {
        Self {
            sessions: Mutex::new(SessionRegistry::new(config.idle_timeout)),
            objects: Mutex::new(objects),
            events,
            next_client_id: AtomicU32::new(0),
            config,
        }
    }

    /// Hands out the next client id; unique for the life of the process
    pub fn allocate_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }
}
