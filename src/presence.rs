//! Ephemeral presence cache — live cursors and typing indicators.
//!
//! Presence is transient, best-effort state about other users' activity.
//! It is deliberately kept apart from the entity store: never persisted,
//! never optimistic, never reconciled. Entries self-expire after a fixed
//! TTL with no renewal other than a fresh `record` — a user who stops
//! moving the pointer silently disappears, which also covers the case
//! where a leave or disconnect event was never delivered.
//!
//! ## Data flow
//!
//! ```text
//! user:cursor / user:typing:start
//!       │
//!       ▼
//! PresenceCache::record()        (last-write-wins per user+kind)
//!       │
//!       ▼
//! PresenceCache::get(kind)       (recomputed per call, expired filtered)
//!       │
//!       ▼
//! UI cursor / typing rendering
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

/// Kind of presence signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceKind {
    Cursor,
    Typing,
}

/// Presence cache tuning.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long a cursor position stays visible without renewal.
    pub cursor_ttl: Duration,
    /// How long a typing indicator stays visible without renewal.
    pub typing_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_ttl: Duration::from_secs(3),
            typing_ttl: Duration::from_secs(5),
        }
    }
}

/// One live presence signal.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub kind: PresenceKind,
    /// Raw payload of the presence event; opaque to the cache.
    pub value: Value,
    pub recorded_at: Instant,
}

/// Keyed ephemeral store for presence signals.
///
/// Upserts are last-write-wins per (user, kind); reads recompute the set of
/// live entries against the TTL on every call. `sweep` reclaims storage for
/// long-expired entries but visibility never depends on it.
pub struct PresenceCache {
    config: PresenceConfig,
    entries: Mutex<HashMap<(Uuid, PresenceKind), PresenceEntry>>,
}

impl PresenceCache {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PresenceConfig::default())
    }

    fn ttl(&self, kind: PresenceKind) -> Duration {
        match kind {
            PresenceKind::Cursor => self.config.cursor_ttl,
            PresenceKind::Typing => self.config.typing_ttl,
        }
    }

    /// Upsert an entry and restart its expiry clock.
    pub fn record(&self, user_id: Uuid, kind: PresenceKind, value: Value) {
        let entry = PresenceEntry {
            user_id,
            kind,
            value,
            recorded_at: Instant::now(),
        };
        self.entries.lock().unwrap().insert((user_id, kind), entry);
    }

    /// Drop one user's entry of a kind, e.g. on `user:typing:stop`.
    pub fn clear(&self, user_id: Uuid, kind: PresenceKind) -> bool {
        self.entries.lock().unwrap().remove(&(user_id, kind)).is_some()
    }

    /// All currently live entries of a kind, recomputed at call time.
    pub fn get(&self, kind: PresenceKind) -> Vec<PresenceEntry> {
        let ttl = self.ttl(kind);
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.kind == kind && now.duration_since(e.recorded_at) < ttl)
            .cloned()
            .collect()
    }

    /// One user's live entry of a kind, if any.
    pub fn get_user(&self, user_id: Uuid, kind: PresenceKind) -> Option<PresenceEntry> {
        let ttl = self.ttl(kind);
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .get(&(user_id, kind))
            .filter(|e| now.duration_since(e.recorded_at) < ttl)
            .cloned()
    }

    /// Remove expired entries; returns how many were reclaimed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        let cursor_ttl = self.config.cursor_ttl;
        let typing_ttl = self.config.typing_ttl;
        entries.retain(|(_, kind), e| {
            let ttl = match kind {
                PresenceKind::Cursor => cursor_ttl,
                PresenceKind::Typing => typing_ttl,
            };
            now.duration_since(e.recorded_at) < ttl
        });
        let reclaimed = before - entries.len();
        if reclaimed > 0 {
            log::debug!("Presence sweep reclaimed {reclaimed} entries");
        }
        reclaimed
    }

    /// Number of stored entries, live or not (storage, not visibility).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
