//! Session wiring: one owner for the whole sync core.
//!
//! `SyncSession` is created at login and dropped at logout. It owns the
//! event bus, both entity stores, the presence cache and the mutation
//! coordinator, and registers the internal routing handlers that connect
//! them:
//!
//! ```text
//! push event ──► bus dispatch ──┬── entity events ──► coordinator ──► stores
//!                               └── presence events ───────────► presence cache
//! user action ──► coordinator ──► store (optimistic) + CRUD call
//! ```
//!
//! Presence deliberately bypasses the coordinator and the stores: it is
//! never optimistic and never durable. View code reads the stores and the
//! presence cache through the accessors; nothing here is a global.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{BusConfig, EventBusClient, HandlerId};
use crate::coordinator::{CoordinatorConfig, CrudApi, MutationCoordinator};
use crate::presence::{PresenceCache, PresenceConfig, PresenceKind};
use crate::protocol::{
    ServerEvent, CursorPayload, TypingPayload, TASK_CREATED, TASK_DELETED, TASK_UPDATED,
    TYPING_START, TYPING_STOP, USER_CURSOR, WORKSPACE_UPDATED,
};
use crate::store::EntityStore;
use crate::transport::{Credential, Transport};

/// Composed configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bus: BusConfig,
    pub presence: PresenceConfig,
    pub coordinator: CoordinatorConfig,
    /// How often expired presence entries are reclaimed.
    pub presence_sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            presence: PresenceConfig::default(),
            coordinator: CoordinatorConfig::default(),
            presence_sweep_interval: Duration::from_secs(2),
        }
    }
}

/// Owns the sync core for one authenticated session.
pub struct SyncSession {
    bus: Arc<EventBusClient>,
    presence: Arc<PresenceCache>,
    coordinator: Arc<MutationCoordinator>,
    routing_handlers: Vec<(&'static str, HandlerId)>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    sweep_interval: Duration,
}

impl SyncSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        credential: Credential,
        api: Arc<dyn CrudApi>,
        config: SessionConfig,
    ) -> Self {
        let bus = Arc::new(EventBusClient::new(transport, credential, config.bus));
        let presence = Arc::new(PresenceCache::new(config.presence));
        let coordinator = Arc::new(MutationCoordinator::new(
            Arc::new(EntityStore::new()),
            Arc::new(EntityStore::new()),
            api,
            config.coordinator,
        ));

        let mut routing_handlers = Vec::new();

        for event in [TASK_CREATED, TASK_UPDATED, TASK_DELETED, WORKSPACE_UPDATED] {
            let coordinator = coordinator.clone();
            let id = bus.on(event, move |payload| {
                route_entity_event(&coordinator, event, payload)
            });
            routing_handlers.push((event, id));
        }

        for event in [USER_CURSOR, TYPING_START, TYPING_STOP] {
            let presence = presence.clone();
            let id = bus.on(event, move |payload| {
                route_presence_event(&presence, event, payload)
            });
            routing_handlers.push((event, id));
        }

        Self {
            bus,
            presence,
            coordinator,
            routing_handlers,
            sweeper: Mutex::new(None),
            sweep_interval: config.presence_sweep_interval,
        }
    }

    /// Connect and start housekeeping. Safe to call again after a
    /// `shutdown` (the same declared rooms re-join on the next connect).
    pub async fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.is_none() {
            let presence = self.presence.clone();
            let interval = self.sweep_interval;
            *sweeper = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    presence.sweep();
                }
            }));
        }
        drop(sweeper);

        self.bus.connect().await;
    }

    /// Tear down the connection and housekeeping (logout path).
    pub fn shutdown(&self) {
        self.bus.disconnect();
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Broadcast the local user's cursor position (fire-and-forget).
    pub fn publish_cursor(&self, user_id: Uuid, x: f32, y: f32) {
        let payload = CursorPayload { user_id, x, y };
        self.bus
            .emit(USER_CURSOR, serde_json::to_value(payload).unwrap_or(Value::Null));
    }

    /// Broadcast the local user's typing state for a task.
    pub fn publish_typing(&self, user_id: Uuid, task_id: i64, active: bool) {
        let event = if active { TYPING_START } else { TYPING_STOP };
        let payload = TypingPayload { user_id, task_id };
        self.bus
            .emit(event, serde_json::to_value(payload).unwrap_or(Value::Null));
    }

    pub fn bus(&self) -> &Arc<EventBusClient> {
        &self.bus
    }

    pub fn presence(&self) -> &Arc<PresenceCache> {
        &self.presence
    }

    pub fn coordinator(&self) -> &Arc<MutationCoordinator> {
        &self.coordinator
    }

    pub fn tasks(&self) -> &Arc<EntityStore> {
        self.coordinator.tasks()
    }

    pub fn workspaces(&self) -> &Arc<EntityStore> {
        self.coordinator.workspaces()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        for (event, id) in self.routing_handlers.drain(..) {
            self.bus.off(event, id);
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn route_entity_event(coordinator: &MutationCoordinator, event: &str, payload: &Value) {
    match ServerEvent::parse(event, payload) {
        Ok(Some(parsed)) => coordinator.handle_remote(&parsed),
        Ok(None) => {}
        Err(e) => log::debug!("Dropping malformed entity event: {e}"),
    }
}

fn route_presence_event(presence: &PresenceCache, event: &str, payload: &Value) {
    match ServerEvent::parse(event, payload) {
        Ok(Some(ServerEvent::Cursor { user_id, .. })) => {
            presence.record(user_id, PresenceKind::Cursor, payload.clone());
        }
        Ok(Some(ServerEvent::TypingStart { user_id, .. })) => {
            presence.record(user_id, PresenceKind::Typing, payload.clone());
        }
        Ok(Some(ServerEvent::TypingStop { user_id, .. })) => {
            presence.clear(user_id, PresenceKind::Typing);
        }
        Ok(_) => {}
        // Presence is best-effort; a bad payload never reaches the UI.
        Err(e) => log::debug!("Dropping malformed presence event: {e}"),
    }
}
