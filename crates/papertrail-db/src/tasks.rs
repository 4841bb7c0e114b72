//! Import task repository.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use papertrail_core::{
    defaults, validate_interval, Error, ImportFilter, ImportTask, ImportTaskRepository, Result,
    TaskLogEntry, TaskStatus,
};

const TASK_COLUMNS: &str = "id, name, filter, interval_secs, status, last_run_at, \
     imported_total, attempted_total, log_tail, created_at";

pub struct PgImportTaskRepository {
    pool: Pool<Postgres>,
}

impl PgImportTaskRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn row_to_task(row: &PgRow) -> Result<ImportTask> {
    let filter: ImportFilter = serde_json::from_value(row.try_get::<JsonValue, _>("filter")?)?;
    let log_tail: VecDeque<TaskLogEntry> =
        serde_json::from_value(row.try_get::<JsonValue, _>("log_tail")?)?;
    let status: String = row.try_get("status")?;
    Ok(ImportTask {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        filter,
        interval_secs: row.try_get::<i64, _>("interval_secs")?.max(0) as u64,
        status: status.parse::<TaskStatus>()?,
        last_run_at: row.try_get("last_run_at")?,
        imported_total: row.try_get::<i64, _>("imported_total")?.max(0) as u64,
        attempted_total: row.try_get::<i64, _>("attempted_total")?.max(0) as u64,
        log_tail,
        created_at: row.try_get("created_at")?,
    })
}

fn ensure_found(rows_affected: u64, id: Uuid) -> Result<()> {
    if rows_affected == 0 {
        return Err(Error::TaskNotFound(id));
    }
    Ok(())
}

#[async_trait]
impl ImportTaskRepository for PgImportTaskRepository {
    async fn create(&self, task: &ImportTask) -> Result<()> {
        validate_interval(task.interval_secs)?;
        sqlx::query(
            "INSERT INTO import_task (id, name, filter, interval_secs, status, last_run_at,
                 imported_total, attempted_total, log_tail, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(serde_json::to_value(&task.filter)?)
        .bind(task.interval_secs as i64)
        .bind(task.status.as_str())
        .bind(task.last_run_at)
        .bind(task.imported_total as i64)
        .bind(task.attempted_total as i64)
        .bind(serde_json::to_value(&task.log_tail)?)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImportTask>> {
        let row = sqlx::query(&format!("SELECT {} FROM import_task WHERE id = $1", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<ImportTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM import_task
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at",
            TASK_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(row_to_task).collect()
    }

    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        let result = sqlx::query("UPDATE import_task SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        ensure_found(result.rows_affected(), id)
    }

    async fn record_item(&self, id: Uuid, imported: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE import_task
             SET attempted_total = attempted_total + 1,
                 imported_total = imported_total + CASE WHEN $2 THEN 1 ELSE 0 END
             WHERE id = $1",
        )
        .bind(id)
        .bind(imported)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        ensure_found(result.rows_affected(), id)
    }

    async fn finish_cycle(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE import_task SET last_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        ensure_found(result.rows_affected(), id)
    }

    async fn append_log(&self, id: Uuid, entry: TaskLogEntry) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let tail: Option<JsonValue> =
            sqlx::query_scalar("SELECT log_tail FROM import_task WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Error::Database)?;
        let Some(tail) = tail else {
            return Err(Error::TaskNotFound(id));
        };

        let mut tail: VecDeque<TaskLogEntry> = serde_json::from_value(tail)?;
        while tail.len() >= defaults::TASK_LOG_TAIL {
            tail.pop_front();
        }
        tail.push_back(entry);

        sqlx::query("UPDATE import_task SET log_tail = $2 WHERE id = $1")
            .bind(id)
            .bind(serde_json::to_value(&tail)?)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }
}
