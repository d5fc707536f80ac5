//! # tasklane-sync — Real-time synchronization core for Tasklane
//!
//! Keeps a client-held task/workspace state consistent with the server of
//! record while users make optimistic local edits, watch live pushes from
//! collaborators, and survive connection loss without corrupting local
//! state or double-applying updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON)   ┌──────────────┐
//! │ EventBusClient│ ◄──────────────────► │ push service │
//! └──────┬───────┘                      └──────────────┘
//!        │ dispatch
//!        ├── entity events ──► MutationCoordinator ──► EntityStore
//!        │                            ▲                (tasks, workspaces)
//!        │                            │ optimistic edits + CRUD calls
//!        │                        view code
//!        └── presence events ──► PresenceCache  (TTL, never durable)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope, event names, entity models
//! - [`transport`] — transport boundary trait, WebSocket + in-memory impls
//! - [`bus`] — connection lifecycle, handler registry, backoff reconnect
//! - [`rooms`] — declared room membership, converged on every reconnect
//! - [`presence`] — self-expiring cursor/typing cache
//! - [`store`] — confirmed baselines + ordered optimistic overlays
//! - [`coordinator`] — optimistic mutation orchestration, CRUD boundary
//! - [`session`] — session-scoped ownership and event routing
//!
//! ## Consistency rules
//!
//! | Situation | Winner |
//! |-----------|--------|
//! | Pending local edit vs. concurrent remote push, same field | local, until it resolves |
//! | Confirm/rollback of one edit vs. later pending edits | later edits re-apply |
//! | Duplicate push delivery | idempotent (full-entity merge) |
//! | Reconnect vs. declared rooms | declared set re-joined, then buffered emits flush once |
//!
//! Reference: Kleppmann, Chapter 5 — Replication

pub mod bus;
pub mod coordinator;
pub mod presence;
pub mod protocol;
pub mod rooms;
pub mod session;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use bus::{BusConfig, BusStats, ConnectionState, EventBusClient, HandlerId};
pub use coordinator::{ApiError, CoordinatorConfig, CrudApi, MutationCoordinator};
pub use presence::{PresenceCache, PresenceConfig, PresenceEntry, PresenceKind};
pub use protocol::{
    Envelope, ProtocolError, ServerEvent, Task, TaskStatus, Workspace,
};
pub use rooms::{Room, RoomKind, RoomMembership};
pub use session::{SessionConfig, SyncSession};
pub use store::{EntityId, EntityStore, Fields, MutationToken};
pub use transport::{
    Credential, MemoryHub, MemoryTransport, Transport, TransportError, TransportEvent,
    TransportLink, WsTransport,
};
