//! Store contracts for the durable collaborators the realtime core consumes.
//!
//! ARCHITECTURE
//! ============
//! Board/column/task CRUD, sessions and presence rows live behind three
//! traits so the realtime core never touches SQL directly:
//! - `TaskStore`: version-checked task reads and writes.
//! - `PresenceStore`: per-user, per-board ephemeral rows with a staleness sweep.
//! - `AccessStore`: session token → user, user × board → access.
//!
//! `postgres` implements all three over `sqlx`; `memory` implements them over
//! in-process maps for tests and database-less development runs.
//!
//! INVARIANTS
//! ==========
//! - `conditional_update` and `conditional_delete` check `expected_version`
//!   and apply the change in one step. A mismatch returns `Conflict` carrying
//!   the current task, never a partial write.
//! - Every accepted `conditional_update` increments `version` by exactly 1.
//! - `reassign_positions` is a server-internal correction: it rewrites
//!   positions only and leaves versions untouched.

pub mod memory;
pub mod postgres;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::ErrorCode;

// =============================================================================
// RECORDS
// =============================================================================

/// A task card. Mirrors the `tasks` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub board_id: Uuid,
    pub column_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Dense 0-based index within `column_id`.
    pub position: i32,
    /// Optimistic concurrency token.
    pub version: i64,
    pub completed: bool,
    pub assignee_ids: Vec<Uuid>,
    /// Nested board owned by this task, if any.
    pub sub_board_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: Uuid,
    pub board_id: Uuid,
    pub name: String,
    pub position: i32,
}

/// Insert payload for a new task. Version starts at 1.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub board_id: Uuid,
    pub column_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub position: i32,
    pub created_by: Option<Uuid>,
}

/// Field-level changes applied by `conditional_update`. `None` leaves the
/// field untouched; `description: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskChanges {
    pub column_id: Option<Uuid>,
    pub position: Option<i32>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub completed: Option<bool>,
    pub assignee_ids: Option<Vec<Uuid>>,
}

impl TaskChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the changes to an in-memory task. Does not touch `version`.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(column_id) = self.column_id {
            task.column_id = column_id;
        }
        if let Some(position) = self.position {
            task.position = position;
        }
        if let Some(title) = &self.title {
            task.title.clone_from(title);
        }
        if let Some(description) = &self.description {
            task.description.clone_from(description);
        }
        if let Some(completed) = self.completed {
            task.completed = completed;
        }
        if let Some(assignees) = &self.assignee_ids {
            task.assignee_ids.clone_from(assignees);
        }
    }
}

/// Cursor position on the board canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// Ephemeral per-user, per-board state. Mirrors the `presence` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub board_id: Uuid,
    pub display_name: String,
    /// Milliseconds since Unix epoch of the last presence-relevant event.
    pub last_seen_ms: i64,
    pub cursor: Option<Cursor>,
    pub focused_element: Option<String>,
    pub is_typing: bool,
}

impl PresenceRecord {
    #[must_use]
    pub fn key(&self) -> PresenceKey {
        PresenceKey { board_id: self.board_id, user_id: self.user_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PresenceKey {
    pub board_id: Uuid,
    pub user_id: Uuid,
}

/// User resolved from a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub name: String,
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("column not found: {0}")]
    ColumnNotFound(Uuid),
    #[error("board not found: {0}")]
    BoardNotFound(Uuid),
    #[error("version conflict: expected {expected}, current {}", .current.version)]
    Conflict { expected: i64, current: Box<Task> },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) | Self::ColumnNotFound(_) | Self::BoardNotFound(_) => "E_NOT_FOUND",
            Self::Conflict { .. } => "E_CONFLICT",
            Self::Unavailable(_) | Self::Database(_) => "E_UPSTREAM",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_))
    }

    fn current_state(&self) -> Option<serde_json::Value> {
        match self {
            Self::Conflict { current, .. } => serde_json::to_value(current.as_ref()).ok(),
            _ => None,
        }
    }
}

// =============================================================================
// CONTRACTS
// =============================================================================

#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError>;

    /// All tasks of a board, read at a single point in time.
    async fn list_board_tasks(&self, board_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Tasks of one column ordered by position.
    async fn list_column_tasks(&self, column_id: Uuid) -> Result<Vec<Task>, StoreError>;

    async fn get_column(&self, column_id: Uuid) -> Result<Column, StoreError>;

    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Apply `changes` and bump `version` if `expected_version` matches (or
    /// is `None`).
    async fn conditional_update(
        &self,
        task_id: Uuid,
        changes: &TaskChanges,
        expected_version: Option<i64>,
    ) -> Result<Task, StoreError>;

    /// Set `position = index` for each task of `ordered` that still lives in
    /// `column_id`.
    async fn reassign_positions(&self, column_id: Uuid, ordered: &[Uuid]) -> Result<(), StoreError>;

    /// Delete the task if `expected_version` matches (or is `None`). Returns
    /// the deleted row.
    async fn conditional_delete(&self, task_id: Uuid, expected_version: Option<i64>) -> Result<Task, StoreError>;

    /// Delete a board with its columns and tasks.
    async fn delete_board(&self, board_id: Uuid) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or refresh a record. An older `last_seen_ms` never overwrites a
    /// newer one.
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), StoreError>;

    /// Returns whether a record existed.
    async fn delete(&self, user_id: Uuid, board_id: Uuid) -> Result<bool, StoreError>;

    /// Purge records last seen before `cutoff_ms`, returning their keys.
    async fn delete_older_than(&self, cutoff_ms: i64) -> Result<Vec<PresenceKey>, StoreError>;

    async fn list_by_board(&self, board_id: Uuid) -> Result<Vec<PresenceRecord>, StoreError>;
}

#[async_trait::async_trait]
pub trait AccessStore: Send + Sync {
    async fn session_user(&self, token: &str) -> Result<Option<SessionUser>, StoreError>;

    async fn has_board_access(&self, user_id: Uuid, board_id: Uuid) -> Result<bool, StoreError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
