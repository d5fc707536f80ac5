//! Event bus client: one logical connection, typed event dispatch,
//! room convergence and reconnection policy.
//!
//! ## Architecture
//!
//! ```text
//! UI components                     transport link (one at a time)
//!  │  on/off/emit/join/leave              ▲
//!  ▼                                      │
//! EventBusClient ── establish() ──────────┤
//!  │    │                                 │
//!  │    ├── rejoin declared rooms         │
//!  │    ├── flush buffered emits          │
//!  │    └── spawn run_link() ◄── inbound events
//!  │                 │
//!  │                 ▼ dispatch(event, payload)
//!  └── handler registry (registration order, identity removal)
//! ```
//!
//! Connection loss is never surfaced as an error: the client transitions
//! to `Reconnecting` and retries under exponential backoff until it either
//! succeeds or the caller disconnects. The only fatal failures are an
//! explicit `disconnect()` and a rejected credential.
//!
//! Reference: Kleppmann, Chapter 8 — The Trouble with Distributed Systems

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::protocol::{Envelope, ROOM_JOIN, ROOM_LEAVE};
use crate::rooms::{Room, RoomMembership};
use crate::transport::{Credential, Transport, TransportError, TransportEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Event bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// First reconnect delay; doubles per failed attempt.
    pub backoff_initial: Duration,
    /// Upper bound for the reconnect delay.
    pub backoff_cap: Duration,
    /// Maximum emits buffered while not connected; oldest dropped beyond.
    pub emit_queue_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            emit_queue_limit: 256,
        }
    }
}

/// Identity of one registered handler; `off` removes exactly this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Explicit listener table: event name → handlers in registration order.
///
/// Handlers are stored behind `Arc` so dispatch can run them without
/// holding the registry lock — a handler may re-enter `on`/`off`.
struct HandlerRegistry {
    next_id: u64,
    handlers: HashMap<String, Vec<(HandlerId, Handler)>>,
}

impl HandlerRegistry {
    fn new() -> Self {
        Self {
            next_id: 1,
            handlers: HashMap::new(),
        }
    }

    fn add(&mut self, event: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&mut self, event: &str, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() < before;
        if list.is_empty() {
            self.handlers.remove(event);
        }
        removed
    }

    fn matching(&self, event: &str) -> Vec<Handler> {
        self.handlers
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

/// Bus health counters.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub connects: u64,
    pub reconnects: u64,
    pub events_dispatched: u64,
    pub emits_buffered: u64,
    pub emits_dropped: u64,
}

struct AtomicBusStats {
    connects: AtomicU64,
    reconnects: AtomicU64,
    events_dispatched: AtomicU64,
    emits_buffered: AtomicU64,
    emits_dropped: AtomicU64,
}

impl AtomicBusStats {
    fn new() -> Self {
        Self {
            connects: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            emits_buffered: AtomicU64::new(0),
            emits_dropped: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            emits_buffered: self.emits_buffered.load(Ordering::Relaxed),
            emits_dropped: self.emits_dropped.load(Ordering::Relaxed),
        }
    }
}

struct BusShared {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    credential: Credential,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    registry: Mutex<HandlerRegistry>,
    rooms: RoomMembership,
    queue: Mutex<VecDeque<Envelope>>,
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
    /// Bumped on disconnect() and manual connect(); tasks holding a stale
    /// epoch stand down, so there is never more than one live attempt.
    epoch: AtomicU64,
    stats: AtomicBusStats,
}

/// Owns the one logical connection to the push-event service.
pub struct EventBusClient {
    shared: Arc<BusShared>,
}

impl EventBusClient {
    pub fn new(transport: Arc<dyn Transport>, credential: Credential, config: BusConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(BusShared {
                config,
                transport,
                credential,
                state_tx,
                state_rx,
                registry: Mutex::new(HandlerRegistry::new()),
                rooms: RoomMembership::new(),
                queue: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(None),
                epoch: AtomicU64::new(0),
                stats: AtomicBusStats::new(),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_rx.borrow()
    }

    /// Watch connection state transitions (e.g. for an offline indicator).
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_rx.clone()
    }

    /// Establish the transport if not already connected or connecting.
    ///
    /// Idempotent: a second call while `Connecting`/`Connected` is a no-op
    /// and never opens a second transport. While `Reconnecting` it cancels
    /// the pending backoff timer and retries immediately. Transient
    /// failures transition to `Reconnecting` and schedule a retry; they
    /// are never returned to the caller.
    pub async fn connect(&self) {
        let shared = &self.shared;
        let mut proceed = false;
        shared.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Connected | ConnectionState::Connecting => false,
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                *state = ConnectionState::Connecting;
                proceed = true;
                true
            }
        });
        if !proceed {
            log::debug!("connect() ignored; already {:?}", self.state());
            return;
        }

        // Fresh epoch: any retry loop from a previous episode stands down.
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        match BusShared::establish(shared.clone(), epoch).await {
            Ok(()) => {}
            Err(TransportError::Unauthorized) => {
                log::error!("Credential rejected; not retrying");
                shared.set_state(ConnectionState::Disconnected);
            }
            Err(e) => {
                log::info!("Connect failed ({e}); retrying under backoff");
                shared.set_state(ConnectionState::Reconnecting);
                let shared = shared.clone();
                tokio::spawn(async move {
                    BusShared::retry_loop(shared, epoch).await;
                });
            }
        }
    }

    /// Tear the transport down and stop all retrying.
    ///
    /// Declared room membership survives for the next session; the link's
    /// active flags and any buffered emits do not.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        shared.epoch.fetch_add(1, Ordering::SeqCst);
        *shared.outbound.lock().unwrap() = None;
        shared.rooms.clear_active();
        shared.queue.lock().unwrap().clear();
        shared.set_state(ConnectionState::Disconnected);
        log::info!("Event bus disconnected");
    }

    /// Register a handler for a named event; invoked in registration order.
    /// Accepted in every connection state.
    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        self.shared
            .registry
            .lock()
            .unwrap()
            .add(event, Arc::new(handler))
    }

    /// Remove exactly the handler registered under `id`; other handlers
    /// for the same event are untouched.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        self.shared.registry.lock().unwrap().remove(event, id)
    }

    /// Fire-and-forget send. Buffered (bounded, oldest dropped) while not
    /// connected; the buffer flushes once after room rejoin on reconnect.
    pub fn emit(&self, event: &str, payload: Value) {
        let envelope = Envelope::new(event, payload);
        if self.state() == ConnectionState::Connected {
            let sender = self.shared.outbound.lock().unwrap().clone();
            if let Some(tx) = sender {
                match tx.try_send(envelope) {
                    Ok(()) => return,
                    Err(e) => {
                        // Channel full or link just died; fall through to buffer.
                        self.shared.buffer(e.into_inner());
                        return;
                    }
                }
            }
        }
        self.shared.buffer(envelope);
    }

    /// Declare interest in a room; joins immediately when connected,
    /// otherwise at the next `Connected` transition.
    pub fn join(&self, room: Room) {
        let newly_declared = self.shared.rooms.declare(room);
        if newly_declared && self.state() == ConnectionState::Connected {
            if self.shared.send_room_frame(ROOM_JOIN, room) {
                self.shared.rooms.mark_active(room);
            }
        }
    }

    /// Release interest in a room; safe to call when never joined.
    pub fn leave(&self, room: Room) {
        let last_reference = self.shared.rooms.undeclare(room);
        if last_reference && self.state() == ConnectionState::Connected {
            self.shared.send_room_frame(ROOM_LEAVE, room);
        }
    }

    /// Declared/active room membership (read-only).
    pub fn membership(&self) -> &RoomMembership {
        &self.shared.rooms
    }

    /// Health counters snapshot.
    pub fn stats(&self) -> BusStats {
        self.shared.stats.snapshot()
    }
}

impl BusShared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Connection state {previous:?} → {state:?}");
        }
    }

    fn buffer(&self, envelope: Envelope) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(envelope);
        self.stats.emits_buffered.fetch_add(1, Ordering::Relaxed);
        while queue.len() > self.config.emit_queue_limit {
            queue.pop_front();
            self.stats.emits_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Emit buffer full; dropped oldest frame");
        }
    }

    fn send_room_frame(&self, frame: &str, room: Room) -> bool {
        let payload = serde_json::to_value(room).unwrap_or(Value::Null);
        let sender = self.outbound.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.try_send(Envelope::new(frame, payload)).is_ok(),
            None => false,
        }
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        let handlers = self.registry.lock().unwrap().matching(event);
        for handler in handlers {
            handler(payload);
        }
    }

    /// One connection attempt. On success: link installed, rooms rejoined,
    /// buffered emits flushed (in that order), inbound pump spawned.
    async fn establish(shared: Arc<BusShared>, epoch: u64) -> Result<(), TransportError> {
        let link = shared.transport.connect(&shared.credential).await?;
        if shared.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(()); // superseded while connecting; drop the link
        }

        let outbound = link.outbound;
        *shared.outbound.lock().unwrap() = Some(outbound.clone());
        shared.set_state(ConnectionState::Connected);
        shared.stats.connects.fetch_add(1, Ordering::Relaxed);

        // Converge the link to the declared room set first…
        for room in shared.rooms.declared() {
            let payload = serde_json::to_value(room).unwrap_or(Value::Null);
            if outbound.send(Envelope::new(ROOM_JOIN, payload)).await.is_ok() {
                shared.rooms.mark_active(room);
            }
        }

        // …then flush buffered emits, oldest first, exactly once.
        let queued: Vec<Envelope> = shared.queue.lock().unwrap().drain(..).collect();
        if !queued.is_empty() {
            log::info!("Flushing {} buffered emits", queued.len());
            for envelope in queued {
                let _ = outbound.send(envelope).await;
            }
        }

        tokio::spawn(BusShared::run_link(shared, epoch, link.inbound));
        Ok(())
    }

    /// Inbound pump for one link; on loss, rolls into the retry loop.
    async fn run_link(
        shared: Arc<BusShared>,
        epoch: u64,
        mut inbound: mpsc::Receiver<TransportEvent>,
    ) {
        loop {
            let Some(event) = inbound.recv().await else {
                break;
            };
            if shared.epoch.load(Ordering::SeqCst) != epoch {
                return; // stale link; a newer epoch owns the connection now
            }
            match event {
                TransportEvent::Open => {}
                TransportEvent::Message { event, payload } => {
                    shared.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
                    shared.dispatch(&event, &payload);
                }
                TransportEvent::Closed { reason } => {
                    log::info!("Connection lost: {reason}");
                    break;
                }
            }
        }

        if shared.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        *shared.outbound.lock().unwrap() = None;
        shared.rooms.clear_active();
        shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        shared.set_state(ConnectionState::Reconnecting);
        BusShared::retry_loop(shared, epoch).await;
    }

    /// Exponential backoff: initial delay, doubling, capped; reset by
    /// construction on every successful connect (each episode starts
    /// fresh). Runs until success, a stale epoch, or a rejected credential.
    async fn retry_loop(shared: Arc<BusShared>, epoch: u64) {
        let mut delay = shared.config.backoff_initial;
        let mut attempt: u32 = 1;
        loop {
            log::debug!("Reconnect attempt {attempt} in {delay:?}");
            tokio::time::sleep(delay).await;
            if shared.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            match BusShared::establish(shared.clone(), epoch).await {
                Ok(()) => return,
                Err(TransportError::Unauthorized) => {
                    log::error!("Credential rejected during reconnect; giving up");
                    shared.set_state(ConnectionState::Disconnected);
                    return;
                }
                Err(e) => {
                    log::debug!("Reconnect attempt {attempt} failed: {e}");
                    delay = (delay * 2).min(shared.config.backoff_cap);
                    attempt += 1;
                }
            }
        }
    }
}
