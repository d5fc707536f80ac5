//! Mutation coordinator: optimistic edits reconciled against the server.
//!
//! Each logical user action runs `Idle → Submitting → {Confirmed |
//! RolledBack}`: the store is patched immediately, the CRUD request goes
//! out, and the response resolves the pending mutation — confirm installs
//! the server entity as the new baseline, failure (including timeout)
//! rolls the patch back and returns the error to the caller for toast-level
//! feedback. Either way the store self-heals; nothing is left half-applied.
//!
//! Rapid successive edits to one entity are not blocked — they stack as
//! concurrent pending mutations — but their resolutions are forced into
//! submission order by a per-entity FIFO, even when the server answers out
//! of order.
//!
//! Inbound push events route through [`MutationCoordinator::handle_remote`]
//! into the same stores; presence events never pass through here.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::protocol::{ServerEvent, Task, Workspace};
use crate::store::{to_fields, EntityId, EntityStore, Fields, MutationToken};

/// Uniform failure of a CRUD call. Every rejection means "mutation failed";
/// `Unauthorized` is distinguished only so the caller can additionally run
/// the session-invalidation path.
#[derive(Debug, Clone)]
pub enum ApiError {
    Rejected(String),
    Timeout,
    Unauthorized,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "Rejected: {e}"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Unauthorized => write!(f, "Unauthorized"),
        }
    }
}

impl std::error::Error for ApiError {}

/// The REST CRUD boundary. Implementations are plain request/response
/// wrappers; all consistency concerns live on this side of the trait.
#[async_trait]
pub trait CrudApi: Send + Sync {
    async fn create_task(&self, draft: &Task) -> Result<Task, ApiError>;
    async fn update_task(&self, id: EntityId, patch: &Fields) -> Result<Task, ApiError>;
    async fn delete_task(&self, id: EntityId) -> Result<(), ApiError>;
    async fn update_workspace(&self, id: EntityId, patch: &Fields) -> Result<Workspace, ApiError>;
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A CRUD call slower than this is treated as failed (rollback).
    pub request_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EntityKind {
    Task,
    Workspace,
}

/// Orchestrates optimistic mutations and remote-event merges over the
/// session's entity stores.
pub struct MutationCoordinator {
    tasks: Arc<EntityStore>,
    workspaces: Arc<EntityStore>,
    api: Arc<dyn CrudApi>,
    config: CoordinatorConfig,
    /// Per-entity submission order; resolutions pop strictly from the front.
    queues: Mutex<HashMap<(EntityKind, EntityId), VecDeque<MutationToken>>>,
    resolved: Notify,
}

impl MutationCoordinator {
    pub fn new(
        tasks: Arc<EntityStore>,
        workspaces: Arc<EntityStore>,
        api: Arc<dyn CrudApi>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            tasks,
            workspaces,
            api,
            config,
            queues: Mutex::new(HashMap::new()),
            resolved: Notify::new(),
        }
    }

    /// Task store handle (read-only use by views).
    pub fn tasks(&self) -> &Arc<EntityStore> {
        &self.tasks
    }

    /// Workspace store handle (read-only use by views).
    pub fn workspaces(&self) -> &Arc<EntityStore> {
        &self.workspaces
    }

    /// Optimistically patch a task and reconcile with the server response.
    pub async fn update_task(&self, id: EntityId, patch: Fields) -> Result<Task, ApiError> {
        let token = self.admit(EntityKind::Task, &self.tasks, id, patch.clone());

        let response = self.bounded(self.api.update_task(id, &patch)).await;

        self.wait_turn(EntityKind::Task, id, token).await;
        let result = match response {
            Ok(server_task) => {
                self.tasks.confirm(token, to_fields(&server_task));
                Ok(server_task)
            }
            Err(e) => {
                self.tasks.rollback(token);
                log::warn!("Task {id} mutation failed, rolled back: {e}");
                Err(e)
            }
        };
        self.dequeue(EntityKind::Task, id, token);
        result
    }

    /// Optimistically patch a workspace and reconcile with the server.
    pub async fn update_workspace(&self, id: EntityId, patch: Fields) -> Result<Workspace, ApiError> {
        let token = self.admit(EntityKind::Workspace, &self.workspaces, id, patch.clone());

        let response = self.bounded(self.api.update_workspace(id, &patch)).await;

        self.wait_turn(EntityKind::Workspace, id, token).await;
        let result = match response {
            Ok(server_ws) => {
                self.workspaces.confirm(token, to_fields(&server_ws));
                Ok(server_ws)
            }
            Err(e) => {
                self.workspaces.rollback(token);
                log::warn!("Workspace {id} mutation failed, rolled back: {e}");
                Err(e)
            }
        };
        self.dequeue(EntityKind::Workspace, id, token);
        result
    }

    /// Create a task. Creates round-trip first and merge on success — the
    /// server assigns the id, and the `task:created` push is idempotent
    /// with this merge.
    pub async fn create_task(&self, draft: &Task) -> Result<Task, ApiError> {
        let created = self.bounded(self.api.create_task(draft)).await?;
        self.tasks.merge_remote(created.id, to_fields(&created));
        log::debug!("Created task {}", created.id);
        Ok(created)
    }

    /// Delete a task optimistically; the compensating action on failure is
    /// restoring the pre-delete visible entity as a fresh baseline.
    pub async fn delete_task(&self, id: EntityId) -> Result<(), ApiError> {
        let snapshot = self.tasks.get(id);
        self.tasks.remove(id);

        match self.bounded(self.api.delete_task(id)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(entity) = snapshot {
                    self.tasks.merge_remote(id, entity);
                }
                log::warn!("Task {id} delete failed, restored: {e}");
                Err(e)
            }
        }
    }

    /// Apply a pushed entity event to the stores. Duplicate delivery is
    /// harmless: merges are full replacements.
    pub fn handle_remote(&self, event: &ServerEvent) {
        match event {
            ServerEvent::TaskCreated(task) | ServerEvent::TaskUpdated(task) => {
                self.tasks.merge_remote(task.id, to_fields(task));
            }
            ServerEvent::TaskDeleted { id } => {
                let retired = self.tasks.remove(*id);
                if !retired.is_empty() {
                    log::debug!(
                        "Remote delete of task {id} retired {} in-flight mutations",
                        retired.len()
                    );
                }
            }
            ServerEvent::WorkspaceUpdated(ws) => {
                self.workspaces.merge_remote(ws.id, to_fields(ws));
            }
            // Presence flows straight to the presence cache, not here.
            ServerEvent::Cursor { .. }
            | ServerEvent::TypingStart { .. }
            | ServerEvent::TypingStop { .. } => {}
        }
    }

    /// Run a CRUD future under the request timeout.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        }
    }

    /// Apply the optimistic patch and admit its token to the per-entity
    /// FIFO in one step, so queue order always matches store submission
    /// order even under a multithreaded runtime.
    fn admit(
        &self,
        kind: EntityKind,
        store: &EntityStore,
        id: EntityId,
        patch: Fields,
    ) -> MutationToken {
        let mut queues = self.queues.lock().unwrap();
        let token = store.apply_optimistic(id, patch);
        queues.entry((kind, id)).or_default().push_back(token);
        token
    }

    /// Park until `token` is the oldest unresolved mutation for its entity.
    async fn wait_turn(&self, kind: EntityKind, id: EntityId, token: MutationToken) {
        loop {
            let mut notified = pin!(self.resolved.notified());
            notified.as_mut().enable();
            {
                let queues = self.queues.lock().unwrap();
                let front = queues.get(&(kind, id)).and_then(|q| q.front()).copied();
                if front.is_none() || front == Some(token) {
                    return;
                }
            }
            notified.await;
        }
    }

    fn dequeue(&self, kind: EntityKind, id: EntityId, token: MutationToken) {
        {
            let mut queues = self.queues.lock().unwrap();
            if let Some(queue) = queues.get_mut(&(kind, id)) {
                debug_assert_eq!(queue.front().copied(), Some(token));
                queue.retain(|t| *t != token);
                if queue.is_empty() {
                    queues.remove(&(kind, id));
                }
            }
        }
        self.resolved.notify_waiters();
    }
}
