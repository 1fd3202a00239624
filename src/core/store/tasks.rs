use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use super::types::{
    NewTask, Priority, RepeatMode, Role, TaskFilter, TaskRecord, TaskStatus, TaskUpdate,
    TriggerType,
};
use super::{Store, enum_column, now_ms};

const TASK_COLUMNS: &str = "id, title, description, status, priority, assigned_role, assigned_agent_id, \
     trigger_type, scheduled_at, repeat, repeat_mode, repeat_interval, started_at, completed_at, \
     next_run_at, created_by, created_at, updated_at";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: enum_column(row, 3, TaskStatus::from_status)?,
        priority: enum_column(row, 4, Priority::from_name)?,
        assigned_role: enum_column(row, 5, Role::from_name)?,
        assigned_agent_id: row.get(6)?,
        trigger_type: enum_column(row, 7, TriggerType::from_name)?,
        scheduled_at: row.get(8)?,
        repeat: row.get::<_, i64>(9)? != 0,
        repeat_mode: enum_column(row, 10, RepeatMode::from_name)?,
        repeat_interval: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
        next_run_at: row.get(14)?,
        created_by: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn load_task(db: &Connection, id: &str) -> Result<Option<TaskRecord>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    Ok(db.query_row(&sql, params![id], task_from_row).optional()?)
}

fn save_task(db: &Connection, task: &TaskRecord) -> Result<()> {
    db.execute(
        "INSERT INTO tasks (id, title, description, status, priority, assigned_role, assigned_agent_id,
            trigger_type, scheduled_at, repeat, repeat_mode, repeat_interval, started_at, completed_at,
            next_run_at, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            status = excluded.status,
            priority = excluded.priority,
            assigned_role = excluded.assigned_role,
            assigned_agent_id = excluded.assigned_agent_id,
            trigger_type = excluded.trigger_type,
            scheduled_at = excluded.scheduled_at,
            repeat = excluded.repeat,
            repeat_mode = excluded.repeat_mode,
            repeat_interval = excluded.repeat_interval,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            next_run_at = excluded.next_run_at,
            updated_at = excluded.updated_at",
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            task.priority.as_str(),
            task.assigned_role.as_str(),
            task.assigned_agent_id,
            task.trigger_type.as_str(),
            task.scheduled_at,
            task.repeat as i64,
            task.repeat_mode.as_str(),
            task.repeat_interval,
            task.started_at,
            task.completed_at,
            task.next_run_at,
            task.created_by,
            task.created_at,
            task.updated_at,
        ],
    )?;
    Ok(())
}

fn apply_update(task: &mut TaskRecord, update: TaskUpdate) {
    if let Some(title) = update.title {
        task.title = title;
    }
    if let Some(description) = update.description {
        task.description = description;
    }
    if let Some(status) = update.status {
        task.status = status;
    }
    if let Some(priority) = update.priority {
        task.priority = priority;
    }
    if let Some(role) = update.assigned_role {
        task.assigned_role = role;
    }
    if let Some(agent) = update.assigned_agent_id {
        task.assigned_agent_id = agent;
    }
    if let Some(at) = update.started_at {
        task.started_at = at;
    }
    if let Some(at) = update.completed_at {
        task.completed_at = at;
    }
    if let Some(at) = update.next_run_at {
        task.next_run_at = at;
    }
    task.updated_at = now_ms();
}

impl Store {
    pub async fn create_task(&self, input: NewTask) -> Result<TaskRecord> {
        let now = now_ms();
        let task = TaskRecord {
            id: uuid::Uuid::new_v4().to_string(),
            title: input
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "Untitled Task".to_string()),
            description: input.description,
            status: input.status,
            priority: input.priority,
            assigned_role: input.assigned_role,
            assigned_agent_id: input.assigned_agent_id.filter(|id| !id.is_empty()),
            trigger_type: input.trigger_type,
            scheduled_at: input.scheduled_at,
            repeat: input.repeat,
            repeat_mode: input.repeat_mode,
            repeat_interval: input.repeat_interval,
            started_at: None,
            completed_at: None,
            next_run_at: None,
            created_by: input.created_by,
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock().await;
        save_task(&db, &task)?;
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let db = self.db.lock().await;
        load_task(&db, id)
    }

    /// Filtered listing, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        let mut tasks = self.tasks_oldest_first().await?;
        tasks.retain(|t| {
            filter.status.is_none_or(|s| t.status == s)
                && filter.assigned_role.is_none_or(|r| t.assigned_role == r)
        });
        tasks.reverse();
        Ok(tasks)
    }

    /// Tasks in one status, oldest first (insertion order breaks ties).
    pub async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
            TASK_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], task_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    async fn tasks_oldest_first(&self) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM tasks ORDER BY created_at ASC, rowid ASC",
            TASK_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], task_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<Option<TaskRecord>> {
        let db = self.db.lock().await;
        let Some(mut task) = load_task(&db, id)? else {
            return Ok(None);
        };
        apply_update(&mut task, update);
        save_task(&db, &task)?;
        Ok(Some(task))
    }

    /// Apply `update` only while the row is still in `expected`. The read and
    /// the write happen under one connection lock, so a status written by
    /// another caller in between is never overwritten. `None` when the task
    /// is gone or has moved on.
    pub async fn update_task_if(
        &self,
        id: &str,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<Option<TaskRecord>> {
        let db = self.db.lock().await;
        let Some(mut task) = load_task(&db, id)? else {
            return Ok(None);
        };
        if task.status != expected {
            return Ok(None);
        }
        apply_update(&mut task, update);
        save_task(&db, &task)?;
        Ok(Some(task))
    }

    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}
