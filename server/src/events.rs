//! Tick-scheduled dispatch of domain events raised by clients
//!
//! Command channels raise the events embedded in each command, tagged with
//! the command's tick. The broadcaster dispatches everything due once per
//! server tick. Handlers never run while the queue lock is held, and a
//! handler that wants to raise a follow-up event defers it through its
//! [`EventContext`] instead of re-entering the dispatch it is running inside.
//!
//! Client ticks are untrusted. Events scheduled further than the horizon past
//! the last dispatched tick are dropped, as is anything raised while the queue
//! is full.

use crate::session::SessionRegistry;
use log::{debug, trace, warn};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;
use sync_shared::{ClientId, Event, Vec2};
use tokio::sync::Mutex;

pub type Handler = Box<dyn Fn(&Event, &mut EventContext<'_>) + Send + Sync>;

/// How far past the current server tick a client may schedule an event
pub const DEFAULT_EVENT_HORIZON: u32 = 300;

/// Events held at once before new ones are refused
pub const DEFAULT_MAX_PENDING_EVENTS: usize = 4096;

/// Spawn locations addressed by a `Spawn` event's `spawnIndex`
pub const SPAWN_POINTS: [Vec2; 2] = [Vec2::new(300.0, 500.0), Vec2::new(700.0, 400.0)];

/// What a handler can touch while it runs
pub struct EventContext<'a> {
    pub tick: u32,
    pub now: Instant,
    pub sessions: &'a mut SessionRegistry,
    deferred: &'a mut Vec<Event>,
}

impl EventContext<'_> {
    /// Queues `event` for the follow-up pass of the current dispatch
    pub fn defer(&mut self, event: Event) {
        self.deferred.push(event);
    }
}

struct Scheduled {
    at: u32,
    seq: u64,
    event: Event,
}

// BinaryHeap pops the greatest element: earliest tick, then highest
// priority, then first raised.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then(self.event.priority.cmp(&other.event.priority))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

pub struct EventScheduler {
    handlers: HashMap<String, Vec<Handler>>,
    queue: Mutex<BinaryHeap<Scheduled>>,
    next_seq: AtomicU64,
    /// Last tick handed to `dispatch`
    current_tick: AtomicU32,
    horizon: u32,
    max_pending: usize,
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            current_tick: AtomicU32::new(0),
            horizon: DEFAULT_EVENT_HORIZON,
            max_pending: DEFAULT_MAX_PENDING_EVENTS,
        }
    }
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the scheduling horizon (in ticks) and the queue capacity
    pub fn with_limits(mut self, horizon: u32, max_pending: usize) -> Self {
        self.horizon = horizon;
        self.max_pending = max_pending;
        self
    }

    /// Scheduler with the server's built-in handlers installed
    pub fn with_default_handlers() -> Self {
        let mut scheduler = Self::new();
        install_default_handlers(&mut scheduler);
        scheduler
    }

    pub fn subscribe<F>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(&Event, &mut EventContext<'_>) + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Queues `event` for dispatch at or after tick `at`
    ///
    /// Returns false if the event was dropped because `at` lies beyond the
    /// horizon or the queue is full. Ticks in the past are always accepted
    /// and run at the next dispatch.
    pub async fn raise(&self, event: Event, at: u32) -> bool {
        let current = self.current_tick.load(AtomicOrdering::Relaxed);
        let latest = current.saturating_add(self.horizon);
        if at > latest {
            warn!(
                "Dropping {} event for tick {}: more than {} ticks past tick {}",
                event.kind, at, self.horizon, current
            );
            return false;
        }

        let mut queue = self.queue.lock().await;
        if queue.len() >= self.max_pending {
            warn!(
                "Dropping {} event for tick {}: {} events already pending",
                event.kind,
                at,
                queue.len()
            );
            return false;
        }
        self.push(&mut queue, event, at);
        true
    }

    fn push(&self, queue: &mut BinaryHeap<Scheduled>, event: Event, at: u32) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        trace!("Raised {} for tick {}", event.kind, at);
        queue.push(Scheduled { at, seq, event });
    }

    /// Re-queues handler follow-ups; these bypass the limits since they
    /// replace events that were just taken off the queue
    async fn requeue(&self, events: Vec<Event>, at: u32) {
        let mut queue = self.queue.lock().await;
        for event in events {
            self.push(&mut queue, event, at);
        }
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Runs handlers for every event due at or before `tick`
    ///
    /// Events deferred by handlers get one follow-up pass within the same
    /// call; anything deferred during that pass waits for the next tick.
    /// Returns the number of events dispatched.
    pub async fn dispatch(&self, tick: u32, sessions: &mut SessionRegistry) -> usize {
        self.current_tick.store(tick, AtomicOrdering::Relaxed);
        let now = Instant::now();
        let (mut dispatched, deferred) = self.run_ready(tick, now, sessions).await;

        if !deferred.is_empty() {
            self.requeue(deferred, tick).await;
            let (count, later) = self.run_ready(tick, now, sessions).await;
            dispatched += count;
            if !later.is_empty() {
                self.requeue(later, tick.saturating_add(1)).await;
            }
        }

        dispatched
    }

    async fn run_ready(
        &self,
        tick: u32,
        now: Instant,
        sessions: &mut SessionRegistry,
    ) -> (usize, Vec<Event>) {
        let ready = {
            let mut queue = self.queue.lock().await;
            let mut ready = Vec::new();
            while queue.peek().is_some_and(|next| next.at <= tick) {
                if let Some(scheduled) = queue.pop() {
                    ready.push(scheduled);
                }
            }
            ready
        };

        let mut deferred = Vec::new();
        let count = ready.len();
        for Scheduled { at, mut event, .. } in ready {
            event.age = tick.saturating_sub(at);
            let Some(handlers) = self.handlers.get(&event.kind) else {
                trace!("No handler for {} event", event.kind);
                continue;
            };

            let mut ctx = EventContext {
                tick,
                now,
                sessions: &mut *sessions,
                deferred: &mut deferred,
            };
            for handler in handlers {
                handler(&event, &mut ctx);
            }
        }

        (count, deferred)
    }
}

fn player_id(event: &Event) -> Option<ClientId> {
    event
        .int_param("playerId")
        .and_then(|id| ClientId::try_from(id).ok())
}

/// Installs the gameplay hooks the server itself reacts to
pub fn install_default_handlers(scheduler: &mut EventScheduler) {
    scheduler.subscribe("InputPressed", |event, _ctx| {
        debug!(
            "Player {:?} pressed key {:?}",
            event.int_param("playerId"),
            event.int_param("key")
        );
    });

    scheduler.subscribe("Collision", |event, _ctx| {
        debug!(
            "Player {:?} collided with object {:?}",
            event.int_param("playerId"),
            event.int_param("objectId")
        );
    });

    scheduler.subscribe("Death", |event, ctx| {
        let Some(id) = player_id(event) else {
            return;
        };
        ctx.defer(
            Event::new("Spawn")
                .with_priority(1)
                .with_param("playerId", id as i32)
                .with_param("spawnIndex", 0),
        );
    });

    scheduler.subscribe("Spawn", |event, ctx| {
        let Some(id) = player_id(event) else {
            return;
        };
        let index = event.int_param("spawnIndex").unwrap_or(0);
        let point = if index == 1 {
            SPAWN_POINTS[1]
        } else {
            SPAWN_POINTS[0]
        };

        if ctx.sessions.teleport(id, point, ctx.now) {
            debug!("Respawned player {} at ({}, {})", id, point.x, point.y);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use sync_shared::ClientCommand;

    fn sessions_with_player(id: ClientId) -> SessionRegistry {
        let mut sessions = SessionRegistry::new(Duration::from_secs(3));
        let now = Instant::now();
        sessions.register(id, 5556 + id as u16, now);
        sessions.apply_command(id, 5556 + id as u16, &ClientCommand::new(id, 1, 0, 50.0, 60.0), now);
        sessions
    }

    fn recorder(scheduler: &mut EventScheduler, kind: &str) -> Arc<StdMutex<Vec<Event>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        scheduler.subscribe(kind, move |event, _ctx| {
            sink.lock().unwrap().push(event.clone());
        });
        seen
    }

    #[tokio::test]
    async fn test_dispatch_only_due_events() {
        let mut scheduler = EventScheduler::new();
        let seen = recorder(&mut scheduler, "Ping");
        let mut sessions = SessionRegistry::new(Duration::from_secs(3));

        scheduler.raise(Event::new("Ping").with_param("n", 1), 5).await;
        scheduler.raise(Event::new("Ping").with_param("n", 2), 9).await;

        assert_eq!(scheduler.dispatch(4, &mut sessions).await, 0);
        assert_eq!(scheduler.dispatch(5, &mut sessions).await, 1);
        assert_eq!(scheduler.pending().await, 1);
        assert_eq!(scheduler.dispatch(12, &mut sessions).await, 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].int_param("n"), Some(1));
        assert_eq!(seen[0].age, 0);
        assert_eq!(seen[1].int_param("n"), Some(2));
        assert_eq!(seen[1].age, 3);
    }

    #[tokio::test]
    async fn test_dispatch_order() {
        let mut scheduler = EventScheduler::new();
        let seen = recorder(&mut scheduler, "Ping");
        let mut sessions = SessionRegistry::new(Duration::from_secs(3));

        scheduler.raise(Event::new("Ping").with_param("n", 1), 3).await;
        scheduler.raise(Event::new("Ping").with_param("n", 2).with_priority(5), 3).await;
        scheduler.raise(Event::new("Ping").with_param("n", 3), 2).await;
        scheduler.raise(Event::new("Ping").with_param("n", 4), 3).await;

        scheduler.dispatch(3, &mut sessions).await;

        let order: Vec<i32> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.int_param("n"))
            .collect();
        assert_eq!(order, vec![3, 2, 1, 4]);
    }

    #[tokio::test]
    async fn test_unhandled_events_are_consumed() {
        let scheduler = EventScheduler::new();
        let mut sessions = SessionRegistry::new(Duration::from_secs(3));

        scheduler.raise(Event::new("Nobody"), 1).await;
        assert_eq!(scheduler.dispatch(1, &mut sessions).await, 1);
        assert_eq!(scheduler.pending().await, 0);
    }

    #[tokio::test]
    async fn test_death_respawns_player_in_same_tick() {
        let scheduler = EventScheduler::with_default_handlers();
        let mut sessions = sessions_with_player(0);

        scheduler
            .raise(Event::new("Death").with_param("playerId", 0), 10)
            .await;
        assert_eq!(scheduler.dispatch(10, &mut sessions).await, 2);

        assert_eq!(sessions.player(0).unwrap().position(), SPAWN_POINTS[0]);
        assert_eq!(scheduler.pending().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_index_selects_point() {
        let scheduler = EventScheduler::with_default_handlers();
        let mut sessions = sessions_with_player(3);

        scheduler
            .raise(
                Event::new("Spawn")
                    .with_param("playerId", 3)
                    .with_param("spawnIndex", 1),
                1,
            )
            .await;
        scheduler.dispatch(1, &mut sessions).await;

        assert_eq!(sessions.player(3).unwrap().position(), SPAWN_POINTS[1]);
    }

    #[tokio::test]
    async fn test_spawn_for_unknown_player_is_ignored() {
        let scheduler = EventScheduler::with_default_handlers();
        let mut sessions = sessions_with_player(0);

        scheduler
            .raise(Event::new("Spawn").with_param("playerId", 8), 1)
            .await;
        scheduler
            .raise(Event::new("Death").with_param("playerId", -1), 1)
            .await;
        scheduler.dispatch(1, &mut sessions).await;

        assert_eq!(sessions.player(0).unwrap().position(), Vec2::new(50.0, 60.0));
    }

    #[tokio::test]
    async fn test_far_future_ticks_are_dropped() {
        let scheduler = EventScheduler::with_default_handlers();
        let mut sessions = sessions_with_player(0);

        for t in 0..100u32 {
            for _ in 0..64 {
                let accepted = scheduler
                    .raise(Event::new("Death").with_param("playerId", 0), u32::MAX - t)
                    .await;
                assert!(!accepted);
            }
        }
        for tick in 1..=300 {
            scheduler.dispatch(tick, &mut sessions).await;
        }
        assert_eq!(scheduler.pending().await, 0);

        assert!(scheduler.raise(Event::new("Ping"), 300 + DEFAULT_EVENT_HORIZON).await);
        assert!(!scheduler.raise(Event::new("Ping"), 301 + DEFAULT_EVENT_HORIZON).await);
        assert_eq!(scheduler.pending().await, 1);
    }

    #[tokio::test]
    async fn test_past_ticks_run_at_next_dispatch() {
        let mut scheduler = EventScheduler::new();
        let seen = recorder(&mut scheduler, "Ping");
        let mut sessions = SessionRegistry::new(Duration::from_secs(3));

        scheduler.dispatch(50, &mut sessions).await;
        assert!(scheduler.raise(Event::new("Ping"), 3).await);
        assert_eq!(scheduler.dispatch(51, &mut sessions).await, 1);
        assert_eq!(seen.lock().unwrap()[0].age, 48);
    }

    #[tokio::test]
    async fn test_full_queue_refuses_new_events() {
        let mut scheduler = EventScheduler::new().with_limits(10, 3);
        scheduler.subscribe("Echo", |_event, ctx| {
            ctx.defer(Event::new("Ping"));
        });
        let mut sessions = SessionRegistry::new(Duration::from_secs(3));

        for _ in 0..3 {
            assert!(scheduler.raise(Event::new("Echo"), 2).await);
        }
        assert!(!scheduler.raise(Event::new("Echo"), 2).await);
        assert_eq!(scheduler.pending().await, 3);

        // Follow-ups of a full queue still run
        assert_eq!(scheduler.dispatch(2, &mut sessions).await, 6);
        assert_eq!(scheduler.pending().await, 0);
        assert!(scheduler.raise(Event::new("Echo"), 2).await);
    }

    #[tokio::test]
    async fn test_chained_deferrals_wait_for_next_tick() {
        let mut scheduler = EventScheduler::new();
        scheduler.subscribe("Echo", |event, ctx| {
            let hops = event.int_param("hops").unwrap_or(0);
            if hops > 0 {
                ctx.defer(Event::new("Echo").with_param("hops", hops - 1));
            }
        });
        let mut sessions = SessionRegistry::new(Duration::from_secs(3));

        scheduler
            .raise(Event::new("Echo").with_param("hops", 3), 1)
            .await;

        assert_eq!(scheduler.dispatch(1, &mut sessions).await, 2);
        assert_eq!(scheduler.pending().await, 1);
        assert_eq!(scheduler.dispatch(1, &mut sessions).await, 0);
        assert_eq!(scheduler.dispatch(2, &mut sessions).await, 2);
        assert_eq!(scheduler.pending().await, 0);
    }
}
