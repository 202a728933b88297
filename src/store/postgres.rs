//! Postgres-backed stores.
//!
//! DESIGN
//! ======
//! `PgStore` implements all three store contracts over one `PgPool`. Version
//! checks are pushed into the `UPDATE`/`DELETE` predicate so the compare and
//! the write are one statement; a zero-row result is then disambiguated into
//! `TaskNotFound` or `Conflict` by re-reading the row.
//!
//! Presence upserts only overwrite rows with an older-or-equal `last_seen_ms`,
//! which makes a sweep racing an update last-writer-wins on timestamp.

use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{
    AccessStore, Column, Cursor, NewTask, PresenceKey, PresenceRecord, PresenceStore, SessionUser, StoreError, Task,
    TaskChanges, TaskStore,
};

const TASK_COLUMNS: &str =
    "id, board_id, column_id, title, description, position, version, completed, assignee_ids, sub_board_id, created_by";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    board_id: Uuid,
    column_id: Uuid,
    title: String,
    description: Option<String>,
    position: i32,
    version: i64,
    completed: bool,
    assignee_ids: Vec<Uuid>,
    sub_board_id: Option<Uuid>,
    created_by: Option<Uuid>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Self {
            id: row.id,
            board_id: row.board_id,
            column_id: row.column_id,
            title: row.title,
            description: row.description,
            position: row.position,
            version: row.version,
            completed: row.completed,
            assignee_ids: row.assignee_ids,
            sub_board_id: row.sub_board_id,
            created_by: row.created_by,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PresenceRow {
    user_id: Uuid,
    board_id: Uuid,
    display_name: String,
    last_seen_ms: i64,
    cursor_x: Option<f64>,
    cursor_y: Option<f64>,
    focused_element: Option<String>,
    is_typing: bool,
}

impl From<PresenceRow> for PresenceRecord {
    fn from(row: PresenceRow) -> Self {
        let cursor = match (row.cursor_x, row.cursor_y) {
            (Some(x), Some(y)) => Some(Cursor { x, y }),
            _ => None,
        };
        Self {
            user_id: row.user_id,
            board_id: row.board_id,
            display_name: row.display_name,
            last_seen_ms: row.last_seen_ms,
            cursor,
            focused_element: row.focused_element,
            is_typing: row.is_typing,
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// After a zero-row conditional write: was the row missing or stale?
    async fn explain_miss(&self, task_id: Uuid, expected_version: Option<i64>) -> StoreError {
        match self.get_task(task_id).await {
            Ok(current) => match expected_version {
                Some(expected) => StoreError::Conflict { expected, current: Box::new(current) },
                None => StoreError::TaskNotFound(task_id),
            },
            Err(e) => e,
        }
    }
}

// =============================================================================
// TASKS
// =============================================================================

#[async_trait::async_trait]
impl TaskStore for PgStore {
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::from).ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn list_board_tasks(&self, board_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM boards WHERE id = $1)")
            .bind(board_id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(StoreError::BoardNotFound(board_id));
        }

        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE board_id = $1 ORDER BY column_id, position, id"
        ))
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn list_column_tasks(&self, column_id: Uuid) -> Result<Vec<Task>, StoreError> {
        self.get_column(column_id).await?;
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE column_id = $1 ORDER BY position, id"
        ))
        .bind(column_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn get_column(&self, column_id: Uuid) -> Result<Column, StoreError> {
        let row = sqlx::query("SELECT id, board_id, name, position FROM columns WHERE id = $1")
            .bind(column_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Column { id: r.get("id"), board_id: r.get("board_id"), name: r.get("name"), position: r.get("position") })
            .ok_or(StoreError::ColumnNotFound(column_id))
    }

    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError> {
        let column = self.get_column(task.column_id).await?;
        if column.board_id != task.board_id {
            return Err(StoreError::ColumnNotFound(task.column_id));
        }

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "INSERT INTO tasks (id, board_id, column_id, title, description, position, version, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, 1, $7) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(task.board_id)
        .bind(task.column_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.position)
        .bind(task.created_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn conditional_update(
        &self,
        task_id: Uuid,
        changes: &TaskChanges,
        expected_version: Option<i64>,
    ) -> Result<Task, StoreError> {
        if let Some(column_id) = changes.column_id {
            let column = self.get_column(column_id).await?;
            let current = self.get_task(task_id).await?;
            if column.board_id != current.board_id {
                return Err(StoreError::ColumnNotFound(column_id));
            }
        }

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks SET \
                 column_id = COALESCE($2, column_id), \
                 position = COALESCE($3, position), \
                 title = COALESCE($4, title), \
                 description = CASE WHEN $5 THEN $6 ELSE description END, \
                 completed = COALESCE($7, completed), \
                 assignee_ids = COALESCE($8, assignee_ids), \
                 version = version + 1, \
                 updated_at = now() \
             WHERE id = $1 AND ($9::BIGINT IS NULL OR version = $9) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id)
        .bind(changes.column_id)
        .bind(changes.position)
        .bind(&changes.title)
        .bind(changes.description.is_some())
        .bind(changes.description.clone().flatten())
        .bind(changes.completed)
        .bind(&changes.assignee_ids)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.explain_miss(task_id, expected_version).await),
        }
    }

    async fn reassign_positions(&self, column_id: Uuid, ordered: &[Uuid]) -> Result<(), StoreError> {
        if ordered.is_empty() {
            return Ok(());
        }
        let positions: Vec<i32> = (0..ordered.len())
            .map(|i| i32::try_from(i).unwrap_or(i32::MAX))
            .collect();
        sqlx::query(
            "UPDATE tasks SET position = data.position \
             FROM UNNEST($2::UUID[], $3::INT4[]) AS data(id, position) \
             WHERE tasks.id = data.id AND tasks.column_id = $1",
        )
        .bind(column_id)
        .bind(ordered)
        .bind(&positions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn conditional_delete(&self, task_id: Uuid, expected_version: Option<i64>) -> Result<Task, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "DELETE FROM tasks WHERE id = $1 AND ($2::BIGINT IS NULL OR version = $2) RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => Err(self.explain_miss(task_id, expected_version).await),
        }
    }

    async fn delete_board(&self, board_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM boards WHERE id = $1")
            .bind(board_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::BoardNotFound(board_id));
        }
        Ok(())
    }
}

// =============================================================================
// PRESENCE
// =============================================================================

#[async_trait::async_trait]
impl PresenceStore for PgStore {
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO presence (user_id, board_id, display_name, last_seen_ms, cursor_x, cursor_y, focused_element, is_typing) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (user_id, board_id) DO UPDATE SET \
                 display_name = EXCLUDED.display_name, \
                 last_seen_ms = EXCLUDED.last_seen_ms, \
                 cursor_x = EXCLUDED.cursor_x, \
                 cursor_y = EXCLUDED.cursor_y, \
                 focused_element = EXCLUDED.focused_element, \
                 is_typing = EXCLUDED.is_typing \
             WHERE presence.last_seen_ms <= EXCLUDED.last_seen_ms",
        )
        .bind(record.user_id)
        .bind(record.board_id)
        .bind(&record.display_name)
        .bind(record.last_seen_ms)
        .bind(record.cursor.map(|c| c.x))
        .bind(record.cursor.map(|c| c.y))
        .bind(&record.focused_element)
        .bind(record.is_typing)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, user_id: Uuid, board_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM presence WHERE user_id = $1 AND board_id = $2")
            .bind(user_id)
            .bind(board_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_older_than(&self, cutoff_ms: i64) -> Result<Vec<PresenceKey>, StoreError> {
        let rows = sqlx::query("DELETE FROM presence WHERE last_seen_ms < $1 RETURNING board_id, user_id")
            .bind(cutoff_ms)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| PresenceKey { board_id: r.get("board_id"), user_id: r.get("user_id") })
            .collect())
    }

    async fn list_by_board(&self, board_id: Uuid) -> Result<Vec<PresenceRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PresenceRow>(
            "SELECT user_id, board_id, display_name, last_seen_ms, cursor_x, cursor_y, focused_element, is_typing \
             FROM presence WHERE board_id = $1 ORDER BY user_id",
        )
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PresenceRecord::from).collect())
    }
}

// =============================================================================
// ACCESS
// =============================================================================

#[async_trait::async_trait]
impl AccessStore for PgStore {
    async fn session_user(&self, token: &str) -> Result<Option<SessionUser>, StoreError> {
        let row = sqlx::query(
            "SELECT u.id, u.name \
             FROM sessions s JOIN users u ON u.id = s.user_id \
             WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| SessionUser { id: r.get("id"), name: r.get("name") }))
    }

    async fn has_board_access(&self, user_id: Uuid, board_id: Uuid) -> Result<bool, StoreError> {
        let allowed: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM boards b
                WHERE b.id = $1
                  AND (b.owner_id = $2
                       OR EXISTS(SELECT 1 FROM board_members m WHERE m.board_id = b.id AND m.user_id = $2))
            )",
        )
        .bind(board_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(allowed)
    }
}

#[cfg(all(test, feature = "live-db-tests"))]
#[path = "postgres_test.rs"]
mod tests;
