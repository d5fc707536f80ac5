//! Declared room membership — the desired-state set the bus converges to.
//!
//! A room is a logical subscription channel scoping which entity's events
//! the client receives (one workspace, one task). Views declare interest on
//! mount and release it on unmount; the declaration is reference-counted so
//! two views of the same task do not cancel each other's subscription.
//!
//! The declared set is the single source of truth. The *active* set only
//! mirrors what the current physical link has been asked to join; it is
//! wiped on every disconnect and rebuilt from the declared set on every
//! reconnect, so room interest survives network blips.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

/// Kind of a subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Workspace,
    Task,
}

impl std::fmt::Display for RoomKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workspace => write!(f, "workspace"),
            Self::Task => write!(f, "task"),
        }
    }
}

/// A (kind, id) subscription channel, e.g. `workspace:42` or `task:1007`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Room {
    pub kind: RoomKind,
    pub id: i64,
}

impl Room {
    pub fn workspace(id: i64) -> Self {
        Self {
            kind: RoomKind::Workspace,
            id,
        }
    }

    pub fn task(id: i64) -> Self {
        Self {
            kind: RoomKind::Task,
            id,
        }
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

struct MembershipInner {
    /// Declared interest with reference counts, in stable order.
    declared: BTreeMap<Room, usize>,
    /// Rooms the current link has been asked to join.
    active: HashSet<Room>,
}

/// Reference-counted declared-room set plus the per-link active set.
pub struct RoomMembership {
    inner: Mutex<MembershipInner>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MembershipInner {
                declared: BTreeMap::new(),
                active: HashSet::new(),
            }),
        }
    }

    /// Declare interest in a room. Returns `true` when this is the first
    /// declaration, i.e. the transport should be asked to join.
    pub fn declare(&self, room: Room) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.declared.entry(room).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Release one declaration. Returns `true` when the last reference was
    /// released and the transport should be asked to leave. Safe to call
    /// for rooms that were never declared.
    pub fn undeclare(&self, room: Room) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.declared.get_mut(&room) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                inner.declared.remove(&room);
                inner.active.remove(&room);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the declared set, in stable order.
    pub fn declared(&self) -> Vec<Room> {
        self.inner.lock().unwrap().declared.keys().copied().collect()
    }

    pub fn is_declared(&self, room: Room) -> bool {
        self.inner.lock().unwrap().declared.contains_key(&room)
    }

    /// Mark a room as joined on the current link.
    pub fn mark_active(&self, room: Room) {
        self.inner.lock().unwrap().active.insert(room);
    }

    /// Wipe the active set — the link is gone; declarations survive.
    pub fn clear_active(&self) {
        self.inner.lock().unwrap().active.clear();
    }

    /// Snapshot of the active set.
    pub fn active(&self) -> Vec<Room> {
        let inner = self.inner.lock().unwrap();
        let mut rooms: Vec<Room> = inner.active.iter().copied().collect();
        rooms.sort();
        rooms
    }
}

impl Default for RoomMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_first_and_refcount() {
        let membership = RoomMembership::new();
        assert!(membership.declare(Room::task(7)));
        assert!(!membership.declare(Room::task(7))); // second view, same room
        assert_eq!(membership.declared(), vec![Room::task(7)]);
    }

    #[test]
    fn test_undeclare_drops_on_last_reference() {
        let membership = RoomMembership::new();
        membership.declare(Room::task(7));
        membership.declare(Room::task(7));

        assert!(!membership.undeclare(Room::task(7))); // one view still mounted
        assert!(membership.is_declared(Room::task(7)));

        assert!(membership.undeclare(Room::task(7)));
        assert!(!membership.is_declared(Room::task(7)));
    }

    #[test]
    fn test_undeclare_never_joined_is_noop() {
        let membership = RoomMembership::new();
        assert!(!membership.undeclare(Room::workspace(42)));
        assert!(membership.declared().is_empty());
    }

    #[test]
    fn test_active_cleared_declared_survives() {
        let membership = RoomMembership::new();
        membership.declare(Room::workspace(42));
        membership.declare(Room::task(7));
        membership.mark_active(Room::workspace(42));
        membership.mark_active(Room::task(7));

        membership.clear_active();
        assert!(membership.active().is_empty());
        assert_eq!(
            membership.declared(),
            vec![Room::workspace(42), Room::task(7)]
        );
    }

    #[test]
    fn test_declared_order_is_stable() {
        let membership = RoomMembership::new();
        membership.declare(Room::task(1007));
        membership.declare(Room::workspace(42));
        membership.declare(Room::task(7));
        // Workspaces sort before tasks, ids ascending within a kind.
        assert_eq!(
            membership.declared(),
            vec![Room::workspace(42), Room::task(7), Room::task(1007)]
        );
    }

    #[test]
    fn test_room_display() {
        assert_eq!(Room::workspace(42).to_string(), "workspace:42");
        assert_eq!(Room::task(1007).to_string(), "task:1007");
    }
}
