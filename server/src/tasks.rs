//! Task store — the durable record of every task.
//!
//! Single writer for status: every transition is a compare-and-swap UPDATE
//! guarded by the current status, so an illegal transition is detected at the
//! database and reported as a distinct invalid-state error rather than
//! silently overwriting. Rows are never deleted; terminal state is forever.

use std::net::Ipv4Addr;

use schema::{ListTasksQuery, TaskConfig, TaskSource, TaskStatus};
use uuid::Uuid;

use crate::database::{Database, DatabaseError, Result, TaskRow};

const TASK_COLUMNS: &str = "t.id, t.user_id, t.status, t.source, t.repositories, t.vm_id, \
     t.ip_address, t.context_id, t.config, t.ssh_public_key, t.created_at, t.started_at, \
     t.completed_at, t.exit_code, t.error_message, g.group_id";

// ============================================================================
// Domain model
// ============================================================================

#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub user_id: String,
    pub guild_id: Option<String>,
    pub status: TaskStatus,
    pub source: TaskSource,
    pub repositories: Vec<String>,
    pub vm_id: Option<String>,
    pub ip_address: Option<String>,
    pub context_id: Option<u32>,
    pub config: TaskConfig,
    pub ssh_public_key: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DatabaseError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| DatabaseError::InvalidData(format!("bad task id {}: {e}", row.id)))?;
        let status = TaskStatus::try_from(row.status).map_err(DatabaseError::InvalidData)?;
        let source = TaskSource::try_from(row.source).map_err(DatabaseError::InvalidData)?;
        let repositories: Vec<String> = serde_json::from_str(&row.repositories)
            .map_err(|e| DatabaseError::InvalidData(format!("bad repositories column: {e}")))?;
        let config = match row.config {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| DatabaseError::InvalidData(format!("bad config column: {e}")))?,
            None => TaskConfig::default(),
        };
        Ok(Task {
            id,
            user_id: row.user_id,
            guild_id: row.group_id,
            status,
            source,
            repositories,
            vm_id: row.vm_id,
            ip_address: row.ip_address,
            context_id: row.context_id.map(|c| c as u32),
            config,
            ssh_public_key: row.ssh_public_key,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            exit_code: row.exit_code,
            error_message: row.error_message,
        })
    }
}

/// Everything needed to insert a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: Option<String>,
    pub source: TaskSource,
    pub repositories: Vec<String>,
    pub config: TaskConfig,
    pub group_id: Option<String>,
    pub ssh_public_key: Option<String>,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a pending row, plus the group association in the same
    /// transaction when a group id was given.
    pub async fn create(&self, new: NewTask) -> Result<Task> {
        let id = Uuid::new_v4();
        let user_id = new.user_id.unwrap_or_else(|| "anonymous".to_string());
        let repositories = serde_json::to_string(&new.repositories)
            .map_err(|e| DatabaseError::InvalidData(e.to_string()))?;
        let config = serde_json::to_string(&new.config)
            .map_err(|e| DatabaseError::InvalidData(e.to_string()))?;

        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, user_id, status, source, repositories, config, ssh_public_key, created_at)
            VALUES (?, ?, 'pending', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&user_id)
        .bind(new.source.as_str())
        .bind(&repositories)
        .bind(&config)
        .bind(&new.ssh_public_key)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;

        if let Some(group_id) = &new.group_id {
            sqlx::query("INSERT INTO task_groups (task_id, group_id) VALUES (?, ?)")
                .bind(id.to_string())
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.fetch(id).await
    }

    pub async fn mark_starting(&self, id: Uuid, vm_id: &str, context_id: u32) -> Result<Task> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'starting', vm_id = ?, context_id = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(vm_id)
        .bind(context_id as i64)
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Starting).await);
        }
        self.fetch(id).await
    }

    pub async fn mark_running(&self, id: Uuid, ip: Ipv4Addr) -> Result<Task> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'running', ip_address = ?, \
             started_at = COALESCE(started_at, ?) \
             WHERE id = ? AND status = 'starting'",
        )
        .bind(ip.to_string())
        .bind(now_rfc3339())
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Running).await);
        }
        self.fetch(id).await
    }

    pub async fn mark_suspended(&self, id: Uuid) -> Result<Task> {
        let updated =
            sqlx::query("UPDATE tasks SET status = 'suspended' WHERE id = ? AND status = 'running'")
                .bind(id.to_string())
                .execute(self.db.pool())
                .await?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Suspended).await);
        }
        self.fetch(id).await
    }

    pub async fn mark_resumed(&self, id: Uuid) -> Result<Task> {
        let updated =
            sqlx::query("UPDATE tasks SET status = 'running' WHERE id = ? AND status = 'suspended'")
                .bind(id.to_string())
                .execute(self.db.pool())
                .await?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Running).await);
        }
        self.fetch(id).await
    }

    /// Accepts any non-terminal prior status; stamps `completed_at`.
    pub async fn mark_terminated(
        &self,
        id: Uuid,
        exit_code: Option<i64>,
        error_message: Option<&str>,
    ) -> Result<Task> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'terminated', completed_at = ?, exit_code = ?, \
             error_message = ? WHERE id = ? AND status != 'terminated'",
        )
        .bind(now_rfc3339())
        .bind(exit_code)
        .bind(error_message)
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Terminated).await);
        }
        self.fetch(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             LEFT JOIN task_groups g ON g.task_id = t.id WHERE t.id = ?"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(Task::try_from).transpose()
    }

    /// Newest first, with the total count for the same filters.
    pub async fn list(&self, query: &ListTasksQuery) -> Result<(Vec<Task>, i64)> {
        let mut conditions = Vec::new();
        if query.user_id.is_some() {
            conditions.push("t.user_id = ?");
        }
        if query.status.is_some() {
            conditions.push("t.status = ?");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let per_page = query.per_page();
        let offset = (query.page() - 1) as i64 * per_page as i64;

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             LEFT JOIN task_groups g ON g.task_id = t.id{where_clause} \
             ORDER BY t.created_at DESC LIMIT ? OFFSET ?"
        );
        let mut rows = sqlx::query_as::<_, TaskRow>(&sql);
        if let Some(user_id) = &query.user_id {
            rows = rows.bind(user_id);
        }
        if let Some(status) = query.status {
            rows = rows.bind(status.as_str());
        }
        let rows = rows
            .bind(per_page as i64)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;

        let count_sql = format!("SELECT COUNT(*) FROM tasks t{where_clause}");
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(user_id) = &query.user_id {
            count = count.bind(user_id);
        }
        if let Some(status) = query.status {
            count = count.bind(status.as_str());
        }
        let total = count.fetch_one(self.db.pool()).await?;

        let tasks = rows
            .into_iter()
            .map(Task::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((tasks, total))
    }

    /// Startup reconciliation: no VM handle survives a restart, so any row
    /// still marked live is an orphan and gets terminated.
    pub async fn reconcile_startup(&self) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'terminated', completed_at = ?, exit_code = 1, \
             error_message = 'orphaned by server restart' \
             WHERE status IN ('starting', 'running', 'suspended')",
        )
        .bind(now_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(updated.rows_affected())
    }

    async fn fetch(&self, id: Uuid) -> Result<Task> {
        self.get(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("task {id}")))
    }

    async fn transition_error(&self, id: Uuid, to: TaskStatus) -> DatabaseError {
        match self.get(id).await {
            Ok(Some(task)) => DatabaseError::InvalidState(format!(
                "task {id} is {}, cannot transition to {to}",
                task.status
            )),
            Ok(None) => DatabaseError::NotFound(format!("task {id}")),
            Err(e) => e,
        }
    }
}
