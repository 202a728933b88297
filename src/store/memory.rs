//! In-memory store implementations.
//!
//! DESIGN
//! ======
//! Each store keeps its rows behind one `tokio::sync::RwLock`, so every
//! version check + write happens under a single write guard and no reader can
//! observe a half-applied mutation. Used by tests and by the server when no
//! `DATABASE_URL` is configured.
//!
//! Every store carries an `unavailable` switch that makes all calls fail with
//! `StoreError::Unavailable`, standing in for a database outage.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AccessStore, Column, NewTask, PresenceKey, PresenceRecord, PresenceStore, SessionUser, StoreError, Task,
    TaskChanges, TaskStore,
};

fn check_available(flag: &AtomicBool, store: &str) -> Result<(), StoreError> {
    if flag.load(Ordering::SeqCst) {
        return Err(StoreError::Unavailable(format!("{store} store offline")));
    }
    Ok(())
}

// =============================================================================
// TASKS
// =============================================================================

#[derive(Default)]
struct TaskTables {
    boards: HashSet<Uuid>,
    columns: HashMap<Uuid, Column>,
    tasks: HashMap<Uuid, Task>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tables: RwLock<TaskTables>,
    unavailable: AtomicBool,
}

impl MemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn insert_board(&self, board_id: Uuid) {
        self.tables.write().await.boards.insert(board_id);
    }

    /// Create a column at the end of the board's column list.
    pub async fn insert_column(&self, board_id: Uuid, name: &str) -> Column {
        let mut tables = self.tables.write().await;
        tables.boards.insert(board_id);
        let position = tables.columns.values().filter(|c| c.board_id == board_id).count();
        let column = Column {
            id: Uuid::new_v4(),
            board_id,
            name: name.to_owned(),
            position: i32::try_from(position).unwrap_or(i32::MAX),
        };
        tables.columns.insert(column.id, column.clone());
        column
    }

    /// Insert a fully-formed task row as-is.
    pub async fn insert_task(&self, task: Task) {
        self.tables.write().await.tasks.insert(task.id, task);
    }

    pub async fn board_exists(&self, board_id: Uuid) -> bool {
        self.tables.read().await.boards.contains(&board_id)
    }
}

fn sorted_by_position(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| a.position.cmp(&b.position).then(a.id.cmp(&b.id)));
    tasks
}

#[async_trait::async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        check_available(&self.unavailable, "task")?;
        let tables = self.tables.read().await;
        tables
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn list_board_tasks(&self, board_id: Uuid) -> Result<Vec<Task>, StoreError> {
        check_available(&self.unavailable, "task")?;
        let tables = self.tables.read().await;
        if !tables.boards.contains(&board_id) {
            return Err(StoreError::BoardNotFound(board_id));
        }
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.board_id == board_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.column_id
                .cmp(&b.column_id)
                .then(a.position.cmp(&b.position))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    async fn list_column_tasks(&self, column_id: Uuid) -> Result<Vec<Task>, StoreError> {
        check_available(&self.unavailable, "task")?;
        let tables = self.tables.read().await;
        if !tables.columns.contains_key(&column_id) {
            return Err(StoreError::ColumnNotFound(column_id));
        }
        let tasks = tables
            .tasks
            .values()
            .filter(|t| t.column_id == column_id)
            .cloned()
            .collect();
        Ok(sorted_by_position(tasks))
    }

    async fn get_column(&self, column_id: Uuid) -> Result<Column, StoreError> {
        check_available(&self.unavailable, "task")?;
        let tables = self.tables.read().await;
        tables
            .columns
            .get(&column_id)
            .cloned()
            .ok_or(StoreError::ColumnNotFound(column_id))
    }

    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError> {
        check_available(&self.unavailable, "task")?;
        let mut tables = self.tables.write().await;
        match tables.columns.get(&task.column_id) {
            Some(column) if column.board_id == task.board_id => {}
            _ => return Err(StoreError::ColumnNotFound(task.column_id)),
        }
        let row = Task {
            id: Uuid::new_v4(),
            board_id: task.board_id,
            column_id: task.column_id,
            title: task.title,
            description: task.description,
            position: task.position,
            version: 1,
            completed: false,
            assignee_ids: Vec::new(),
            sub_board_id: None,
            created_by: task.created_by,
        };
        tables.tasks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn conditional_update(
        &self,
        task_id: Uuid,
        changes: &TaskChanges,
        expected_version: Option<i64>,
    ) -> Result<Task, StoreError> {
        check_available(&self.unavailable, "task")?;
        let mut tables = self.tables.write().await;
        let board_id = tables
            .tasks
            .get(&task_id)
            .map(|t| t.board_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if let Some(column_id) = changes.column_id {
            match tables.columns.get(&column_id) {
                Some(column) if column.board_id == board_id => {}
                _ => return Err(StoreError::ColumnNotFound(column_id)),
            }
        }

        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if let Some(expected) = expected_version {
            if expected != task.version {
                return Err(StoreError::Conflict { expected, current: Box::new(task.clone()) });
            }
        }

        changes.apply_to(task);
        task.version += 1;
        Ok(task.clone())
    }

    async fn reassign_positions(&self, column_id: Uuid, ordered: &[Uuid]) -> Result<(), StoreError> {
        check_available(&self.unavailable, "task")?;
        let mut tables = self.tables.write().await;
        for (index, task_id) in ordered.iter().enumerate() {
            if let Some(task) = tables.tasks.get_mut(task_id) {
                if task.column_id == column_id {
                    task.position = i32::try_from(index).unwrap_or(i32::MAX);
                }
            }
        }
        Ok(())
    }

    async fn conditional_delete(&self, task_id: Uuid, expected_version: Option<i64>) -> Result<Task, StoreError> {
        check_available(&self.unavailable, "task")?;
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if let Some(expected) = expected_version {
            if expected != task.version {
                return Err(StoreError::Conflict { expected, current: Box::new(task.clone()) });
            }
        }
        tables
            .tasks
            .remove(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn delete_board(&self, board_id: Uuid) -> Result<(), StoreError> {
        check_available(&self.unavailable, "task")?;
        let mut tables = self.tables.write().await;
        if !tables.boards.remove(&board_id) {
            return Err(StoreError::BoardNotFound(board_id));
        }
        tables.columns.retain(|_, c| c.board_id != board_id);
        tables.tasks.retain(|_, t| t.board_id != board_id);
        Ok(())
    }
}

// =============================================================================
// PRESENCE
// =============================================================================

#[derive(Default)]
pub struct MemoryPresenceStore {
    rows: RwLock<HashMap<PresenceKey, PresenceRecord>>,
    unavailable: AtomicBool,
}

impl MemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        check_available(&self.unavailable, "presence")?;
        let mut rows = self.rows.write().await;
        match rows.get(&record.key()) {
            Some(existing) if existing.last_seen_ms > record.last_seen_ms => {}
            _ => {
                rows.insert(record.key(), record.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, user_id: Uuid, board_id: Uuid) -> Result<bool, StoreError> {
        check_available(&self.unavailable, "presence")?;
        let mut rows = self.rows.write().await;
        Ok(rows.remove(&PresenceKey { board_id, user_id }).is_some())
    }

    async fn delete_older_than(&self, cutoff_ms: i64) -> Result<Vec<PresenceKey>, StoreError> {
        check_available(&self.unavailable, "presence")?;
        let mut rows = self.rows.write().await;
        let stale: Vec<PresenceKey> = rows
            .values()
            .filter(|r| r.last_seen_ms < cutoff_ms)
            .map(PresenceRecord::key)
            .collect();
        for key in &stale {
            rows.remove(key);
        }
        Ok(stale)
    }

    async fn list_by_board(&self, board_id: Uuid) -> Result<Vec<PresenceRecord>, StoreError> {
        check_available(&self.unavailable, "presence")?;
        let rows = self.rows.read().await;
        let mut records: Vec<PresenceRecord> = rows
            .values()
            .filter(|r| r.board_id == board_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.user_id);
        Ok(records)
    }
}

// =============================================================================
// ACCESS
// =============================================================================

#[derive(Default)]
struct AccessTables {
    sessions: HashMap<String, SessionUser>,
    members: HashSet<(Uuid, Uuid)>,
}

#[derive(Default)]
pub struct MemoryAccessStore {
    tables: RwLock<AccessTables>,
}

impl MemoryAccessStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, token: &str, user: SessionUser) {
        self.tables.write().await.sessions.insert(token.to_owned(), user);
    }

    pub async fn grant(&self, user_id: Uuid, board_id: Uuid) {
        self.tables.write().await.members.insert((user_id, board_id));
    }
}

#[async_trait::async_trait]
impl AccessStore for MemoryAccessStore {
    async fn session_user(&self, token: &str) -> Result<Option<SessionUser>, StoreError> {
        Ok(self.tables.read().await.sessions.get(token).cloned())
    }

    async fn has_board_access(&self, user_id: Uuid, board_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.tables.read().await.members.contains(&(user_id, board_id)))
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
