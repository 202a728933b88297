//! Task service — version-checked task mutations.
//!
//! DESIGN
//! ======
//! Every mutation reads the task, compares the caller's expected version,
//! and hands the change to `TaskStore::conditional_update` /
//! `conditional_delete`, which re-check the version and bump it in one step.
//! The early comparison only spares a doomed write; the store's check is the
//! one that decides between concurrent writers.
//!
//! `expected_version: None` is weak mode: applied unconditionally, version
//! still bumped. The dispatcher never passes `None` for client requests.
//!
//! POSITIONS
//! =========
//! Positions are kept dense and 0-based per column. After a move, create or
//! delete, the affected columns are renumbered with `reassign_positions`,
//! which leaves sibling versions untouched. Callers are expected to
//! serialize mutations per board (the dispatcher's sequencer does).
//!
//! ERROR HANDLING
//! ==============
//! Store errors are classified, never flattened: a version mismatch is
//! always `Conflict` with the current task attached.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::envelope::ErrorCode;
use crate::store::{NewTask, StoreError, Task, TaskChanges, TaskStore};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("column not found: {0}")]
    ColumnNotFound(Uuid),
    #[error("task was changed by someone else: expected version {expected}, current {}", .current.version)]
    Conflict { expected: i64, current: Box<Task> },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(id) => Self::TaskNotFound(id),
            StoreError::ColumnNotFound(id) => Self::ColumnNotFound(id),
            StoreError::Conflict { expected, current } => Self::Conflict { expected, current },
            other => Self::Store(other),
        }
    }
}

impl ErrorCode for TaskError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E_VALIDATION",
            Self::TaskNotFound(_) | Self::ColumnNotFound(_) => "E_NOT_FOUND",
            Self::Conflict { .. } => "E_CONFLICT",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            _ => false,
        }
    }

    fn current_state(&self) -> Option<serde_json::Value> {
        match self {
            Self::Conflict { current, .. } => serde_json::to_value(current.as_ref()).ok(),
            _ => None,
        }
    }
}

/// Operation tag carried by task broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOp {
    Moved,
    Created,
    Updated,
    Assigned,
    Unassigned,
    Deleted,
    Completed,
    Reopened,
}

impl TaskOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Moved => "moved",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Assigned => "assigned",
            Self::Unassigned => "unassigned",
            Self::Deleted => "deleted",
            Self::Completed => "completed",
            Self::Reopened => "reopened",
        }
    }
}

/// Resulting order of one column after renumbering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnPositions {
    pub column_id: Uuid,
    pub task_ids: Vec<Uuid>,
}

/// An accepted mutation, ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub op: TaskOp,
    /// Post-mutation state; for deletions, the last state before removal.
    pub task: Task,
    pub positions: Vec<ColumnPositions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved(Mutation),
    /// Target equals the current column and index; nothing written.
    Unchanged(Task),
}

/// Field-level `task_update` actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    Edit { title: Option<String>, description: Option<Option<String>> },
    Assign(Uuid),
    Unassign(Uuid),
    Complete,
    Reopen,
}

// =============================================================================
// CONTROLLER
// =============================================================================

#[derive(Clone)]
pub struct TaskController {
    store: Arc<dyn TaskStore>,
}

impl TaskController {
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Move a task to `target_index` of `target_column`. An index past the
    /// end appends.
    ///
    /// # Errors
    ///
    /// `Conflict` on a stale `expected_version`, `TaskNotFound` /
    /// `ColumnNotFound` when either is missing or on another board,
    /// `Validation` for a negative index.
    pub async fn move_task(
        &self,
        board_id: Uuid,
        task_id: Uuid,
        expected_version: Option<i64>,
        target_column: Uuid,
        target_index: i64,
    ) -> Result<MoveOutcome, TaskError> {
        if target_index < 0 {
            return Err(TaskError::Validation(format!("position must be >= 0, got {target_index}")));
        }
        let task = self.load(board_id, task_id).await?;
        check_version(&task, expected_version)?;
        self.column_on_board(board_id, target_column).await?;

        let target_order = self.column_order(target_column).await?;
        let current_index = target_order.iter().position(|id| *id == task_id);
        let mut siblings: Vec<Uuid> = target_order.into_iter().filter(|id| *id != task_id).collect();
        let index = clamp_index(target_index, siblings.len());

        if task.column_id == target_column && current_index == Some(index) {
            return Ok(MoveOutcome::Unchanged(task));
        }

        let changes = TaskChanges {
            column_id: Some(target_column),
            position: Some(to_position(index)),
            ..TaskChanges::default()
        };
        let moved = self.store.conditional_update(task_id, &changes, expected_version).await?;

        siblings.insert(index, task_id);
        let mut positions = Vec::with_capacity(2);
        if let Some(p) = self.renumber(target_column, siblings).await {
            positions.push(p);
        }
        if task.column_id != target_column {
            match self.column_order(task.column_id).await {
                Ok(order) => {
                    if let Some(p) = self.renumber(task.column_id, order).await {
                        positions.push(p);
                    }
                }
                Err(e) => warn!(column_id = %task.column_id, error = %e, "task: source column reload failed"),
            }
        }

        info!(%board_id, %task_id, version = moved.version, column_id = %target_column, position = index, "task: moved");
        Ok(MoveOutcome::Moved(Mutation { op: TaskOp::Moved, task: moved, positions }))
    }

    /// Create a task at `position` of `column_id`, or at the end.
    ///
    /// # Errors
    ///
    /// `Validation` for a blank title or negative position, `ColumnNotFound`
    /// when the column is missing or on another board.
    pub async fn create_task(
        &self,
        board_id: Uuid,
        column_id: Uuid,
        title: &str,
        description: Option<String>,
        position: Option<i64>,
        created_by: Option<Uuid>,
    ) -> Result<Mutation, TaskError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(TaskError::Validation("title must not be empty".into()));
        }
        if position.is_some_and(|p| p < 0) {
            return Err(TaskError::Validation("position must be >= 0".into()));
        }
        self.column_on_board(board_id, column_id).await?;

        let mut order = self.column_order(column_id).await?;
        let index = position.map_or(order.len(), |p| clamp_index(p, order.len()));
        let task = self
            .store
            .create_task(NewTask {
                board_id,
                column_id,
                title: title.to_owned(),
                description,
                position: to_position(index),
                created_by,
            })
            .await?;

        let mut positions = Vec::new();
        if index < order.len() {
            order.insert(index, task.id);
            if let Some(p) = self.renumber(column_id, order).await {
                positions.push(p);
            }
        }

        info!(%board_id, task_id = %task.id, %column_id, position = index, "task: created");
        Ok(Mutation { op: TaskOp::Created, task, positions })
    }

    /// Apply a field-level update.
    ///
    /// # Errors
    ///
    /// `Conflict` on a stale `expected_version`, `TaskNotFound`, or
    /// `Validation` for an empty edit or blank title.
    pub async fn update_task(
        &self,
        board_id: Uuid,
        task_id: Uuid,
        expected_version: Option<i64>,
        update: TaskUpdate,
    ) -> Result<Mutation, TaskError> {
        let task = self.load(board_id, task_id).await?;
        check_version(&task, expected_version)?;

        let (op, changes) = match update {
            TaskUpdate::Edit { title, description } => {
                let title = match title {
                    Some(t) if t.trim().is_empty() => {
                        return Err(TaskError::Validation("title must not be empty".into()));
                    }
                    Some(t) => Some(t.trim().to_owned()),
                    None => None,
                };
                let changes = TaskChanges { title, description, ..TaskChanges::default() };
                if changes.is_empty() {
                    return Err(TaskError::Validation("edit requires title or description".into()));
                }
                (TaskOp::Updated, changes)
            }
            TaskUpdate::Assign(user_id) => {
                let mut assignees = task.assignee_ids.clone();
                if !assignees.contains(&user_id) {
                    assignees.push(user_id);
                }
                (TaskOp::Assigned, TaskChanges { assignee_ids: Some(assignees), ..TaskChanges::default() })
            }
            TaskUpdate::Unassign(user_id) => {
                let assignees = task.assignee_ids.iter().copied().filter(|id| *id != user_id).collect();
                (TaskOp::Unassigned, TaskChanges { assignee_ids: Some(assignees), ..TaskChanges::default() })
            }
            TaskUpdate::Complete => (TaskOp::Completed, TaskChanges { completed: Some(true), ..TaskChanges::default() }),
            TaskUpdate::Reopen => (TaskOp::Reopened, TaskChanges { completed: Some(false), ..TaskChanges::default() }),
        };

        let updated = self.store.conditional_update(task_id, &changes, expected_version).await?;
        info!(%board_id, %task_id, version = updated.version, op = op.as_str(), "task: updated");
        Ok(Mutation { op, task: updated, positions: Vec::new() })
    }

    /// Delete a task, then its nested board if it owns one. The second step
    /// is best-effort: a failure leaves an orphan board and is logged.
    ///
    /// # Errors
    ///
    /// `Conflict` on a stale `expected_version`, `TaskNotFound`.
    pub async fn delete_task(
        &self,
        board_id: Uuid,
        task_id: Uuid,
        expected_version: Option<i64>,
    ) -> Result<Mutation, TaskError> {
        let task = self.load(board_id, task_id).await?;
        check_version(&task, expected_version)?;

        let deleted = self.store.conditional_delete(task_id, expected_version).await?;

        let mut positions = Vec::new();
        match self.column_order(deleted.column_id).await {
            Ok(order) => {
                if let Some(p) = self.renumber(deleted.column_id, order).await {
                    positions.push(p);
                }
            }
            Err(e) => warn!(column_id = %deleted.column_id, error = %e, "task: column reload after delete failed"),
        }

        if let Some(sub_board_id) = deleted.sub_board_id {
            match self.store.delete_board(sub_board_id).await {
                Ok(()) => info!(%task_id, %sub_board_id, "task: nested board deleted"),
                Err(e) => warn!(%task_id, %sub_board_id, error = %e, "task: nested board left orphaned"),
            }
        }

        info!(%board_id, %task_id, version = deleted.version, "task: deleted");
        Ok(Mutation { op: TaskOp::Deleted, task: deleted, positions })
    }

    /// All tasks of a board at a single point in time.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the read fails.
    pub async fn board_tasks(&self, board_id: Uuid) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.list_board_tasks(board_id).await?)
    }

    // -------------------------------------------------------------------------

    async fn load(&self, board_id: Uuid, task_id: Uuid) -> Result<Task, TaskError> {
        let task = self.store.get_task(task_id).await?;
        if task.board_id != board_id {
            return Err(TaskError::TaskNotFound(task_id));
        }
        Ok(task)
    }

    async fn column_on_board(&self, board_id: Uuid, column_id: Uuid) -> Result<(), TaskError> {
        let column = self.store.get_column(column_id).await?;
        if column.board_id != board_id {
            return Err(TaskError::ColumnNotFound(column_id));
        }
        Ok(())
    }

    async fn column_order(&self, column_id: Uuid) -> Result<Vec<Uuid>, TaskError> {
        let tasks = self.store.list_column_tasks(column_id).await?;
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// Rewrite `column_id` to match `order`. A failure leaves positions
    /// sparse, which readers tolerate; it is logged and omitted.
    async fn renumber(&self, column_id: Uuid, order: Vec<Uuid>) -> Option<ColumnPositions> {
        match self.store.reassign_positions(column_id, &order).await {
            Ok(()) => Some(ColumnPositions { column_id, task_ids: order }),
            Err(e) => {
                warn!(%column_id, error = %e, "task: renumbering failed");
                None
            }
        }
    }
}

fn check_version(task: &Task, expected_version: Option<i64>) -> Result<(), TaskError> {
    match expected_version {
        Some(expected) if expected != task.version => {
            Err(TaskError::Conflict { expected, current: Box::new(task.clone()) })
        }
        _ => Ok(()),
    }
}

fn clamp_index(requested: i64, len: usize) -> usize {
    usize::try_from(requested).map_or(len, |i| i.min(len))
}

fn to_position(index: usize) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}

#[cfg(test)]
#[path = "task_test.rs"]
mod tests;
