//! Task stores with optimistic (CAS) state transitions.
//!
//! Every mutation is conditional on the stored state and reports whether it
//! applied. A lost race is a `false` result, never an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{PollTaskDbModel, RakeTaskDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{PollTask, RakeTask, StreamId, Task, TaskState};
use crate::Result;

/// Storage for one task kind.
#[async_trait]
pub trait TaskStore<T: Task>: Send + Sync {
    /// Atomically move the earliest due `Queued` task to `Claimed` and return it.
    async fn claim_queued(&self) -> Result<Option<T>>;

    async fn get(&self, id: StreamId) -> Result<Option<T>>;

    /// Insert or replace a task unconditionally.
    async fn save(&self, task: &T) -> Result<()>;

    /// Set the state of task `id` if its current state is one of `expected`.
    async fn update_state(
        &self,
        id: StreamId,
        new_state: TaskState,
        expected: &[TaskState],
    ) -> Result<bool>;

    /// Write every field of `task` if the stored state is `expected`.
    async fn update(&self, task: &T, expected: TaskState) -> Result<bool>;

    /// Return `Claimed`/`Executing` tasks claimed before `older_than` to `Queued`.
    ///
    /// Age is measured from the claim, not from `execute_at`, so an overdue
    /// task that was just picked up is left alone.
    async fn reset_abandoned(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

fn state_list(expected: &[TaskState]) -> String {
    expected
        .iter()
        .map(|s| format!("'{}'", s.as_key()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Claim stamp written alongside `state`: now for in-flight states, else NULL.
fn claim_stamp(state: TaskState) -> Option<i64> {
    matches!(state, TaskState::Claimed | TaskState::Executing)
        .then(|| datetime_to_ms(Utc::now()))
}

async fn claim_row<M>(pool: &SqlitePool, table: &'static str) -> Result<Option<M>>
where
    M: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
{
    let sql = format!(
        r#"
        UPDATE {table} SET status = 'c', claimed_at = ?
        WHERE rowid = (
            SELECT rowid FROM {table}
            WHERE status = 'q' AND exec_at <= ?
            ORDER BY exec_at
            LIMIT 1
        ) AND status = 'q'
        RETURNING *
        "#
    );
    let now = datetime_to_ms(Utc::now());
    let row = sqlx::query_as::<_, M>(&sql)
        .bind(now)
        .bind(now)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

async fn update_state_row(
    pool: &SqlitePool,
    table: &'static str,
    id: StreamId,
    new_state: TaskState,
    expected: &[TaskState],
) -> Result<bool> {
    let sql = if expected.is_empty() {
        format!(
            "UPDATE {table} SET status = ?, claimed_at = ? WHERE user_id = ? AND config_id = ?"
        )
    } else {
        format!(
            "UPDATE {table} SET status = ?, claimed_at = ? WHERE user_id = ? AND config_id = ? AND status IN ({})",
            state_list(expected)
        )
    };
    let result = sqlx::query(&sql)
        .bind(new_state.as_key())
        .bind(claim_stamp(new_state))
        .bind(id.user_id)
        .bind(id.config_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

async fn reset_abandoned_rows(
    pool: &SqlitePool,
    table: &'static str,
    older_than: DateTime<Utc>,
) -> Result<u64> {
    let sql = format!(
        r#"
        UPDATE {table} SET status = 'q', claimed_at = NULL
        WHERE status IN ('c', 'e') AND COALESCE(claimed_at, exec_at) < ?
        "#
    );
    let result = sqlx::query(&sql)
        .bind(datetime_to_ms(older_than))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// SQLx implementation of `TaskStore<PollTask>`.
pub struct SqlxPollTaskStore {
    pool: SqlitePool,
}

impl SqlxPollTaskStore {
    const TABLE: &'static str = "poll_task";

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore<PollTask> for SqlxPollTaskStore {
    async fn claim_queued(&self) -> Result<Option<PollTask>> {
        let row = retry_on_sqlite_busy("claim_poll_task", || async {
            claim_row::<PollTaskDbModel>(&self.pool, Self::TABLE).await
        })
        .await?;
        row.map(PollTaskDbModel::into_domain).transpose()
    }

    async fn get(&self, id: StreamId) -> Result<Option<PollTask>> {
        sqlx::query_as::<_, PollTaskDbModel>(
            "SELECT * FROM poll_task WHERE user_id = ? AND config_id = ?",
        )
        .bind(id.user_id)
        .bind(id.config_id)
        .fetch_optional(&self.pool)
        .await?
        .map(PollTaskDbModel::into_domain)
        .transpose()
    }

    async fn save(&self, task: &PollTask) -> Result<()> {
        let row = PollTaskDbModel::from_domain(task)?;
        retry_on_sqlite_busy("save_poll_task", || async {
            sqlx::query(
                r#"
                INSERT INTO poll_task (user_id, config_id, status, exec_at, start_at, message, service_props, claimed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (user_id, config_id) DO UPDATE SET
                    status = excluded.status,
                    exec_at = excluded.exec_at,
                    start_at = excluded.start_at,
                    message = excluded.message,
                    service_props = excluded.service_props,
                    claimed_at = excluded.claimed_at
                "#,
            )
            .bind(row.user_id)
            .bind(row.config_id)
            .bind(&row.status)
            .bind(row.exec_at)
            .bind(row.start_at)
            .bind(&row.message)
            .bind(&row.service_props)
            .bind(claim_stamp(task.state))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_state(
        &self,
        id: StreamId,
        new_state: TaskState,
        expected: &[TaskState],
    ) -> Result<bool> {
        retry_on_sqlite_busy("update_poll_task_state", || async {
            update_state_row(&self.pool, Self::TABLE, id, new_state, expected).await
        })
        .await
    }

    async fn update(&self, task: &PollTask, expected: TaskState) -> Result<bool> {
        let row = PollTaskDbModel::from_domain(task)?;
        retry_on_sqlite_busy("update_poll_task", || async {
            let result = sqlx::query(
                r#"
                UPDATE poll_task SET
                    status = ?,
                    exec_at = ?,
                    start_at = ?,
                    message = ?,
                    service_props = ?,
                    claimed_at = ?
                WHERE user_id = ? AND config_id = ? AND status = ?
                "#,
            )
            .bind(&row.status)
            .bind(row.exec_at)
            .bind(row.start_at)
            .bind(&row.message)
            .bind(&row.service_props)
            .bind(claim_stamp(task.state))
            .bind(row.user_id)
            .bind(row.config_id)
            .bind(expected.as_key())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn reset_abandoned(&self, older_than: DateTime<Utc>) -> Result<u64> {
        retry_on_sqlite_busy("reset_abandoned_poll_tasks", || async {
            reset_abandoned_rows(&self.pool, Self::TABLE, older_than).await
        })
        .await
    }
}

/// SQLx implementation of `TaskStore<RakeTask>`.
pub struct SqlxRakeTaskStore {
    pool: SqlitePool,
}

impl SqlxRakeTaskStore {
    const TABLE: &'static str = "rake_task";

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore<RakeTask> for SqlxRakeTaskStore {
    async fn claim_queued(&self) -> Result<Option<RakeTask>> {
        let row = retry_on_sqlite_busy("claim_rake_task", || async {
            claim_row::<RakeTaskDbModel>(&self.pool, Self::TABLE).await
        })
        .await?;
        row.map(RakeTaskDbModel::into_domain).transpose()
    }

    async fn get(&self, id: StreamId) -> Result<Option<RakeTask>> {
        sqlx::query_as::<_, RakeTaskDbModel>(
            "SELECT * FROM rake_task WHERE user_id = ? AND config_id = ?",
        )
        .bind(id.user_id)
        .bind(id.config_id)
        .fetch_optional(&self.pool)
        .await?
        .map(RakeTaskDbModel::into_domain)
        .transpose()
    }

    async fn save(&self, task: &RakeTask) -> Result<()> {
        let row = RakeTaskDbModel::from_domain(task)?;
        retry_on_sqlite_busy("save_rake_task", || async {
            sqlx::query(
                r#"
                INSERT INTO rake_task (user_id, config_id, status, exec_at, offset_ms, message, service_props, claimed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (user_id, config_id) DO UPDATE SET
                    status = excluded.status,
                    exec_at = excluded.exec_at,
                    offset_ms = excluded.offset_ms,
                    message = excluded.message,
                    service_props = excluded.service_props,
                    claimed_at = excluded.claimed_at
                "#,
            )
            .bind(row.user_id)
            .bind(row.config_id)
            .bind(&row.status)
            .bind(row.exec_at)
            .bind(row.offset_ms)
            .bind(&row.message)
            .bind(&row.service_props)
            .bind(claim_stamp(task.state))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_state(
        &self,
        id: StreamId,
        new_state: TaskState,
        expected: &[TaskState],
    ) -> Result<bool> {
        retry_on_sqlite_busy("update_rake_task_state", || async {
            update_state_row(&self.pool, Self::TABLE, id, new_state, expected).await
        })
        .await
    }

    async fn update(&self, task: &RakeTask, expected: TaskState) -> Result<bool> {
        let row = RakeTaskDbModel::from_domain(task)?;
        retry_on_sqlite_busy("update_rake_task", || async {
            let result = sqlx::query(
                r#"
                UPDATE rake_task SET
                    status = ?,
                    exec_at = ?,
                    offset_ms = ?,
                    message = ?,
                    service_props = ?,
                    claimed_at = ?
                WHERE user_id = ? AND config_id = ? AND status = ?
                "#,
            )
            .bind(&row.status)
            .bind(row.exec_at)
            .bind(row.offset_ms)
            .bind(&row.message)
            .bind(&row.service_props)
            .bind(claim_stamp(task.state))
            .bind(row.user_id)
            .bind(row.config_id)
            .bind(expected.as_key())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn reset_abandoned(&self, older_than: DateTime<Utc>) -> Result<u64> {
        retry_on_sqlite_busy("reset_abandoned_rake_tasks", || async {
            reset_abandoned_rows(&self.pool, Self::TABLE, older_than).await
        })
        .await
    }
}
