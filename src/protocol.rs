//! Wire protocol for the task sync event bus.
//!
//! Every frame on the wire is one JSON text message:
//! ```text
//! { "event": "task:updated", "payload": { ...full entity... } }
//! ```
//!
//! Entity events always carry the complete updated entity, never a diff —
//! the store's merge contract assumes a full replacement baseline. Presence
//! payloads are best-effort and opaque past their ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Event names
// ───────────────────────────────────────────────────────────────────

pub const TASK_CREATED: &str = "task:created";
pub const TASK_UPDATED: &str = "task:updated";
pub const TASK_DELETED: &str = "task:deleted";
pub const WORKSPACE_UPDATED: &str = "workspace:updated";
pub const USER_CURSOR: &str = "user:cursor";
pub const TYPING_START: &str = "user:typing:start";
pub const TYPING_STOP: &str = "user:typing:stop";

/// Control frames the client sends to assert room interest.
pub const ROOM_JOIN: &str = "room:join";
pub const ROOM_LEAVE: &str = "room:leave";

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// One wire frame: a named event plus its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Serialize to the JSON text frame format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Entity models
// ───────────────────────────────────────────────────────────────────

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

/// A durable task record, as the server serializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub workspace_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<Uuid>,
    #[serde(default)]
    pub updated_at: String,
}

/// A durable workspace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub updated_at: String,
}

// ───────────────────────────────────────────────────────────────────
// Typed server events
// ───────────────────────────────────────────────────────────────────

/// Events pushed from server to client, in typed form.
///
/// `parse` returns `Ok(None)` for event names this core does not know —
/// they still reach user-registered handlers as raw payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted { id: i64 },
    WorkspaceUpdated(Workspace),
    /// Live cursor position of another user on the board.
    Cursor { user_id: Uuid, x: f32, y: f32 },
    /// Another user started typing in a task.
    TypingStart { user_id: Uuid, task_id: i64 },
    /// Another user stopped typing in a task.
    TypingStop { user_id: Uuid, task_id: i64 },
}

/// Payload of `user:cursor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub user_id: Uuid,
    pub x: f32,
    pub y: f32,
}

/// Payload of `user:typing:start` / `user:typing:stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: Uuid,
    pub task_id: i64,
}

/// Payload of `task:deleted` — the only entity event without a full entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DeletedPayload {
    id: i64,
}

impl ServerEvent {
    /// Parse a named event into typed form.
    pub fn parse(event: &str, payload: &Value) -> Result<Option<Self>, ProtocolError> {
        fn typed<T: serde::de::DeserializeOwned>(
            event: &str,
            payload: &Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(payload.clone()).map_err(|e| ProtocolError::MalformedPayload {
                event: event.to_string(),
                detail: e.to_string(),
            })
        }

        let parsed = match event {
            TASK_CREATED => Self::TaskCreated(typed(event, payload)?),
            TASK_UPDATED => Self::TaskUpdated(typed(event, payload)?),
            TASK_DELETED => {
                let p: DeletedPayload = typed(event, payload)?;
                Self::TaskDeleted { id: p.id }
            }
            WORKSPACE_UPDATED => Self::WorkspaceUpdated(typed(event, payload)?),
            USER_CURSOR => {
                let p: CursorPayload = typed(event, payload)?;
                Self::Cursor {
                    user_id: p.user_id,
                    x: p.x,
                    y: p.y,
                }
            }
            TYPING_START => {
                let p: TypingPayload = typed(event, payload)?;
                Self::TypingStart {
                    user_id: p.user_id,
                    task_id: p.task_id,
                }
            }
            TYPING_STOP => {
                let p: TypingPayload = typed(event, payload)?;
                Self::TypingStop {
                    user_id: p.user_id,
                    task_id: p.task_id,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    /// The wire name of this event.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::TaskCreated(_) => TASK_CREATED,
            Self::TaskUpdated(_) => TASK_UPDATED,
            Self::TaskDeleted { .. } => TASK_DELETED,
            Self::WorkspaceUpdated(_) => WORKSPACE_UPDATED,
            Self::Cursor { .. } => USER_CURSOR,
            Self::TypingStart { .. } => TYPING_START,
            Self::TypingStop { .. } => TYPING_STOP,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    MalformedPayload { event: String, detail: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::MalformedPayload { event, detail } => {
                write!(f, "Malformed payload for {event}: {detail}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task() -> Task {
        Task {
            id: 7,
            workspace_id: 42,
            title: "Ship v2".into(),
            description: "Cut the release".into(),
            status: TaskStatus::InProgress,
            assignee: None,
            updated_at: "2025-11-02T10:00:00Z".into(),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new(TASK_UPDATED, json!({"id": 7}));
        let text = env.encode().unwrap();
        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_envelope_decode_garbage() {
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn test_parse_task_updated() {
        let task = sample_task();
        let payload = serde_json::to_value(&task).unwrap();
        let event = ServerEvent::parse(TASK_UPDATED, &payload).unwrap().unwrap();
        assert_eq!(event, ServerEvent::TaskUpdated(task));
        assert_eq!(event.event_name(), TASK_UPDATED);
    }

    #[test]
    fn test_parse_task_deleted() {
        let event = ServerEvent::parse(TASK_DELETED, &json!({"id": 1007}))
            .unwrap()
            .unwrap();
        assert_eq!(event, ServerEvent::TaskDeleted { id: 1007 });
    }

    #[test]
    fn test_parse_cursor() {
        let user = Uuid::new_v4();
        let payload = json!({"user_id": user, "x": 120.5, "y": 44.0});
        let event = ServerEvent::parse(USER_CURSOR, &payload).unwrap().unwrap();
        assert_eq!(
            event,
            ServerEvent::Cursor {
                user_id: user,
                x: 120.5,
                y: 44.0
            }
        );
    }

    #[test]
    fn test_parse_unknown_event_is_none() {
        let parsed = ServerEvent::parse("board:reordered", &json!({})).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_malformed_payload_is_error() {
        let err = ServerEvent::parse(TASK_UPDATED, &json!({"id": "not-a-number"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_task_status_wire_names() {
        assert_eq!(
            serde_json::to_value(TaskStatus::InProgress).unwrap(),
            json!("in_progress")
        );
        assert_eq!(serde_json::to_value(TaskStatus::Todo).unwrap(), json!("todo"));
    }

    #[test]
    fn test_task_optional_fields_default() {
        // Servers may omit description/assignee for sparse records.
        let task: Task = serde_json::from_value(json!({
            "id": 1,
            "workspace_id": 2,
            "title": "Bare",
            "status": "todo"
        }))
        .unwrap();
        assert_eq!(task.description, "");
        assert!(task.assignee.is_none());
    }
}
