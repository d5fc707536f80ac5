//! Client-side entity store: confirmed baselines plus optimistic overlays.
//!
//! Entities are held as JSON field maps, because every server payload —
//! REST response or push event — is a full JSON entity. The store keeps,
//! per entity id:
//!
//! - the **confirmed baseline**: the last full entity the server vouched
//!   for (response or push), plus a generation counter bumped every time
//!   the baseline is replaced;
//! - the ordered list of **pending mutations**: field-level forward
//!   patches with inverse snapshots, one per optimistic edit still in
//!   flight.
//!
//! The visible state of an entity is always the baseline with the pending
//! patches folded over it in submission order. That single rule yields the
//! whole reconciliation contract: a confirm swaps the baseline and the
//! other in-flight edits re-apply by construction; a remote merge replaces
//! the baseline while local pending edits keep winning visually until they
//! resolve.
//!
//! Reference: Kleppmann, Chapter 5 — Replication (leader-based, read-your-writes)

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Durable entity id (tasks, workspaces).
pub type EntityId = i64;

/// A full entity or a field-level patch, as a JSON object.
pub type Fields = serde_json::Map<String, Value>;

/// Serialize any entity model into a field map.
pub fn to_fields<T: Serialize>(value: &T) -> Fields {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Fields::new(),
    }
}

/// Deserialize a field map back into an entity model.
pub fn from_fields<T: DeserializeOwned>(fields: &Fields) -> Option<T> {
    match serde_json::from_value(Value::Object(fields.clone())) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Entity field map failed to decode: {e}");
            None
        }
    }
}

fn overlay(target: &mut Fields, patch: &Fields) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// Handle for one in-flight optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationToken(u64);

/// One optimistic edit awaiting its server verdict: the forward patch plus
/// the inverse patch (prior baseline values of exactly the touched fields;
/// `None` marks a field the baseline did not have).
#[derive(Debug, Clone)]
struct PendingMutation {
    token: MutationToken,
    entity: EntityId,
    patch: Fields,
    snapshot: HashMap<String, Option<Value>>,
    baseline_generation: u64,
    #[allow(dead_code)]
    submitted_at: Instant,
}

struct StoreInner {
    confirmed: HashMap<EntityId, Fields>,
    generations: HashMap<EntityId, u64>,
    /// Global submission order; per-entity order is the filtered order.
    pending: Vec<PendingMutation>,
    /// Tokens orphaned by entity removal — resolving one is a quiet no-op.
    retired: HashSet<MutationToken>,
    next_token: u64,
}

/// Authoritative client-side cache for one entity kind.
///
/// All methods are synchronous; callers on the single event loop never
/// observe a half-applied operation. Mutate only through the coordinator
/// (local edits) or inbound event routing (remote edits).
pub struct EntityStore {
    inner: Mutex<StoreInner>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                confirmed: HashMap::new(),
                generations: HashMap::new(),
                pending: Vec::new(),
                retired: HashSet::new(),
                next_token: 1,
            }),
        }
    }

    /// Current visible state: confirmed baseline overlaid with this
    /// entity's pending patches in submission order.
    pub fn get(&self, id: EntityId) -> Option<Fields> {
        let inner = self.inner.lock().unwrap();
        let baseline = inner.confirmed.get(&id);
        let has_pending = inner.pending.iter().any(|p| p.entity == id);
        if baseline.is_none() && !has_pending {
            return None;
        }
        let mut visible = baseline.cloned().unwrap_or_default();
        for pending in inner.pending.iter().filter(|p| p.entity == id) {
            overlay(&mut visible, &pending.patch);
        }
        Some(visible)
    }

    /// Typed read of the visible state.
    pub fn get_as<T: DeserializeOwned>(&self, id: EntityId) -> Option<T> {
        self.get(id).as_ref().and_then(from_fields)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.confirmed.contains_key(&id) || inner.pending.iter().any(|p| p.entity == id)
    }

    /// Apply a local edit immediately and record it as pending.
    ///
    /// Synchronous and infallible; an id without a baseline is treated as
    /// an empty entity (create still in flight).
    pub fn apply_optimistic(&self, id: EntityId, patch: Fields) -> MutationToken {
        let mut inner = self.inner.lock().unwrap();
        let token = MutationToken(inner.next_token);
        inner.next_token += 1;

        let generation = inner.generations.get(&id).copied().unwrap_or(0);
        let baseline = inner.confirmed.get(&id);
        let snapshot = patch
            .keys()
            .map(|key| (key.clone(), baseline.and_then(|b| b.get(key)).cloned()))
            .collect();

        inner.pending.push(PendingMutation {
            token,
            entity: id,
            patch,
            snapshot,
            baseline_generation: generation,
            submitted_at: Instant::now(),
        });
        token
    }

    /// Resolve a pending mutation against the server's confirmed entity.
    ///
    /// The server entity becomes the new baseline; any *other* still-pending
    /// mutations for the id re-apply on top of it (never the confirmed patch
    /// itself). Returns `false` for retired or unknown tokens.
    pub fn confirm(&self, token: MutationToken, server_entity: Fields) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(pending) = take_pending(&mut inner, token) else {
            return false;
        };
        inner.confirmed.insert(pending.entity, server_entity);
        *inner.generations.entry(pending.entity).or_insert(0) += 1;
        true
    }

    /// Undo a failed mutation: exactly the touched fields return to their
    /// snapshot values; later pending edits stay applied.
    ///
    /// If a confirm or remote merge replaced the baseline after this
    /// mutation was submitted, the snapshot is stale — the newer server
    /// state wins and only the pending patch is discarded.
    pub fn rollback(&self, token: MutationToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(pending) = take_pending(&mut inner, token) else {
            return false;
        };

        let generation = inner.generations.get(&pending.entity).copied().unwrap_or(0);
        if generation == pending.baseline_generation {
            let baseline = inner.confirmed.entry(pending.entity).or_default();
            for (key, prior) in pending.snapshot {
                match prior {
                    Some(value) => {
                        baseline.insert(key, value);
                    }
                    None => {
                        baseline.remove(&key);
                    }
                }
            }
            let now_empty = baseline.is_empty();
            if now_empty {
                // The entity never had a confirmed baseline; don't leave a husk.
                inner.confirmed.remove(&pending.entity);
            }
        } else {
            log::debug!(
                "Rollback for entity {} superseded by newer baseline; dropping patch only",
                pending.entity
            );
        }
        true
    }

    /// Accept a remotely pushed full entity as the new confirmed baseline.
    ///
    /// Pending local edits keep winning visually for the fields they touch
    /// until they confirm or roll back. Idempotent under duplicate delivery.
    pub fn merge_remote(&self, id: EntityId, server_entity: Fields) {
        let mut inner = self.inner.lock().unwrap();
        inner.confirmed.insert(id, server_entity);
        *inner.generations.entry(id).or_insert(0) += 1;
    }

    /// Drop an entity entirely (remote delete). In-flight mutations for it
    /// are retired: their later resolution is a quiet no-op, not an error.
    pub fn remove(&self, id: EntityId) -> Vec<MutationToken> {
        let mut inner = self.inner.lock().unwrap();
        inner.confirmed.remove(&id);
        inner.generations.remove(&id);

        let dropped: Vec<MutationToken> = inner
            .pending
            .iter()
            .filter(|p| p.entity == id)
            .map(|p| p.token)
            .collect();
        inner.pending.retain(|p| p.entity != id);
        inner.retired.extend(dropped.iter().copied());
        dropped
    }

    /// Number of pending mutations for one entity.
    pub fn pending_count(&self, id: EntityId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .pending
            .iter()
            .filter(|p| p.entity == id)
            .count()
    }

    /// Total pending mutations across all entities.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Number of entities with a confirmed baseline.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().confirmed.is_empty()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Detach a pending mutation for resolution.
///
/// Retired tokens (entity deleted while the request was in flight) are a
/// logged no-op. A token the store never issued is a programming error:
/// loud in dev builds, quiet no-op in release so one bad caller cannot
/// cascade into UI breakage.
fn take_pending(inner: &mut StoreInner, token: MutationToken) -> Option<PendingMutation> {
    let Some(index) = inner.pending.iter().position(|p| p.token == token) else {
        if inner.retired.remove(&token) {
            log::debug!("Ignoring resolution of a retired mutation token");
        } else {
            debug_assert!(false, "resolution of unknown mutation token {token:?}");
            log::warn!("Ignoring resolution of unknown mutation token");
        }
        return None;
    };

    let entity = inner.pending[index].entity;
    let first_for_entity = inner
        .pending
        .iter()
        .position(|p| p.entity == entity)
        .unwrap_or(index);
    debug_assert_eq!(
        first_for_entity, index,
        "mutations for one entity must resolve in submission order"
    );

    Some(inner.pending.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("fields() needs a JSON object"),
        }
    }

    fn task7() -> Fields {
        fields(json!({
            "id": 7,
            "workspace_id": 42,
            "title": "Original title",
            "description": "Original description",
            "status": "todo"
        }))
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = EntityStore::new();
        assert!(store.get(7).is_none());
        assert!(!store.contains(7));
    }

    #[test]
    fn test_merge_then_get() {
        let store = EntityStore::new();
        store.merge_remote(7, task7());
        let visible = store.get(7).unwrap();
        assert_eq!(visible["title"], json!("Original title"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_optimistic_patch_visible_immediately() {
        let store = EntityStore::new();
        store.merge_remote(7, task7());
        store.apply_optimistic(7, fields(json!({"title": "Ship v2"})));

        let visible = store.get(7).unwrap();
        assert_eq!(visible["title"], json!("Ship v2"));
        assert_eq!(visible["description"], json!("Original description"));
        assert_eq!(store.pending_count(7), 1);
    }

    #[test]
    fn test_confirm_installs_server_entity_not_patch() {
        let store = EntityStore::new();
        store.merge_remote(7, task7());
        let token = store.apply_optimistic(7, fields(json!({"title": "Ship v2"})));

        // The server normalized the title; its word is final.
        let mut server = task7();
        server.insert("title".into(), json!("Ship v2!"));
        assert!(store.confirm(token, server));

        let visible = store.get(7).unwrap();
        assert_eq!(visible["title"], json!("Ship v2!"));
        assert_eq!(store.pending_count(7), 0);
    }

    #[test]
    fn test_confirm_reapplies_other_pending_mutations() {
        // Two rapid edits: "A" then "B", confirmed in submission order.
        let store = EntityStore::new();
        store.merge_remote(7, task7());
        let token_a = store.apply_optimistic(7, fields(json!({"title": "A"})));
        let _token_b = store.apply_optimistic(7, fields(json!({"title": "B"})));

        let mut server = task7();
        server.insert("title".into(), json!("A"));
        store.confirm(token_a, server);

        // The later pending edit still wins over the new baseline.
        assert_eq!(store.get(7).unwrap()["title"], json!("B"));
        assert_eq!(store.pending_count(7), 1);
    }

    #[test]
    fn test_rollback_restores_only_touched_fields() {
        let store = EntityStore::new();
        store.merge_remote(7, task7());
        let status = store.apply_optimistic(7, fields(json!({"status": "done"})));
        let _title = store.apply_optimistic(7, fields(json!({"title": "Keep me"})));

        assert!(store.rollback(status));

        let visible = store.get(7).unwrap();
        assert_eq!(visible["status"], json!("todo")); // snapshot restored
        assert_eq!(visible["title"], json!("Keep me")); // later edit untouched
        assert_eq!(store.pending_count(7), 1);
    }

    #[test]
    fn test_rollback_after_remote_merge_keeps_server_fields() {
        let store = EntityStore::new();
        store.merge_remote(7, task7());
        let token = store.apply_optimistic(7, fields(json!({"title": "Ship v2"})));

        // Remote edit lands while ours is in flight; local title still wins.
        let mut remote = task7();
        remote.insert("title".into(), json!("Remote title"));
        remote.insert("description".into(), json!("Remote description"));
        store.merge_remote(7, remote);
        assert_eq!(store.get(7).unwrap()["title"], json!("Ship v2"));

        // On rollback the tie-break ends: the merged server state shows.
        store.rollback(token);
        let visible = store.get(7).unwrap();
        assert_eq!(visible["title"], json!("Remote title"));
        assert_eq!(visible["description"], json!("Remote description"));
    }

    #[test]
    fn test_pending_title_wins_over_remote_description_update() {
        // Concrete scenario: local title edit vs concurrent remote push.
        let store = EntityStore::new();
        store.merge_remote(7, task7());
        store.apply_optimistic(7, fields(json!({"title": "Ship v2"})));

        let mut remote = task7();
        remote.insert("description".into(), json!("Updated remotely"));
        store.merge_remote(7, remote);

        let visible = store.get(7).unwrap();
        assert_eq!(visible["title"], json!("Ship v2"));
        assert_eq!(visible["description"], json!("Updated remotely"));
    }

    #[test]
    fn test_merge_remote_is_idempotent() {
        let store = EntityStore::new();
        let mut entity = task7();
        entity.insert("title".into(), json!("Pushed"));

        store.merge_remote(7, entity.clone());
        let once = store.get(7).unwrap();
        store.merge_remote(7, entity);
        let twice = store.get(7).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_rollback_on_entity_without_baseline() {
        // Optimistic patch on an id the store never saw, then rollback.
        let store = EntityStore::new();
        let token = store.apply_optimistic(99, fields(json!({"title": "Ghost"})));
        assert_eq!(store.get(99).unwrap()["title"], json!("Ghost"));

        store.rollback(token);
        assert!(store.get(99).is_none());
        assert!(!store.contains(99));
    }

    #[test]
    fn test_remove_retires_inflight_tokens() {
        let store = EntityStore::new();
        store.merge_remote(7, task7());
        let token = store.apply_optimistic(7, fields(json!({"title": "Doomed"})));

        let retired = store.remove(7);
        assert_eq!(retired, vec![token]);
        assert!(store.get(7).is_none());

        // Late server response for the removed entity: quiet no-op.
        assert!(!store.confirm(token, task7()));
        assert!(store.get(7).is_none());
    }

    #[test]
    fn test_snapshot_of_absent_field_restores_absence() {
        let store = EntityStore::new();
        let mut sparse = task7();
        sparse.remove("description");
        store.merge_remote(7, sparse);

        let token = store.apply_optimistic(7, fields(json!({"description": "Draft"})));
        assert_eq!(store.get(7).unwrap()["description"], json!("Draft"));

        store.rollback(token);
        assert!(!store.get(7).unwrap().contains_key("description"));
    }

    #[test]
    fn test_typed_roundtrip() {
        use crate::protocol::{Task, TaskStatus};

        let store = EntityStore::new();
        let task = Task {
            id: 7,
            workspace_id: 42,
            title: "Typed".into(),
            description: String::new(),
            status: TaskStatus::Todo,
            assignee: None,
            updated_at: String::new(),
        };
        store.merge_remote(7, to_fields(&task));

        let read: Task = store.get_as(7).unwrap();
        assert_eq!(read, task);
    }
}
