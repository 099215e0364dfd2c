//! SQLite task registry and checkpoint store.
//!
//! Implements `TaskRegistry` and `CheckpointStore` from `stepwise-core`.
//! Every state transition is a single conditional UPDATE on the writer
//! connection, so a claim either moves the row to `recovering` or affects
//! nothing.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::Row;
use stepwise_core::repository::registry::{eligibility_of, CheckpointStore, TaskRegistry};
use stepwise_types::error::RepositoryError;
use stepwise_types::job::{
    Checkpoint, EligibilityVerdict, RecoverableTask, RecoverableTaskStub, TaskRegistration,
    TaskState,
};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, from_json_text, parse_datetime, query_error, to_json_text};

/// SQLite-backed task registry. Also stores checkpoints.
#[derive(Clone)]
pub struct SqliteTaskRegistry {
    pool: DatabasePool,
}

impl SqliteTaskRegistry {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Flag `running` entries whose heartbeat is older than `stale_after` as
    /// `stale`. Returns the number of entries flagged.
    pub async fn mark_stale(&self, stale_after: Duration) -> Result<u64, RepositoryError> {
        let cutoff = cutoff(stale_after)?;
        let result = sqlx::query(
            "UPDATE recoverable_tasks SET state = 'stale', updated_at = ? WHERE state = 'running' AND last_heartbeat <= ?",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(&cutoff)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected())
    }
}

fn cutoff(stale_after: Duration) -> Result<String, RepositoryError> {
    let age = chrono::Duration::from_std(stale_after)
        .map_err(|e| RepositoryError::Query(format!("invalid staleness threshold: {e}")))?;
    Ok(format_datetime(&(Utc::now() - age)))
}

fn parse_state(s: &str) -> Result<TaskState, RepositoryError> {
    TaskState::parse(s).ok_or_else(|| RepositoryError::Query(format!("invalid task state: {s}")))
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const STUB_COLUMNS: &str = "id, task_id, task_name, job_key, owner_id, state, last_heartbeat, \
                            recovery_priority, progress_percent, current_step";

struct TaskRow {
    id: String,
    task_id: String,
    task_name: String,
    job_key: Option<String>,
    owner_id: Option<String>,
    state: String,
    last_heartbeat: String,
    recovery_priority: i64,
    progress_percent: i64,
    current_step: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            task_name: row.try_get("task_name")?,
            job_key: row.try_get("job_key")?,
            owner_id: row.try_get("owner_id")?,
            state: row.try_get("state")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            recovery_priority: row.try_get("recovery_priority")?,
            progress_percent: row.try_get("progress_percent")?,
            current_step: row.try_get("current_step")?,
        })
    }

    fn into_stub(self) -> Result<RecoverableTaskStub, RepositoryError> {
        Ok(RecoverableTaskStub {
            registry_id: self
                .id
                .parse::<Uuid>()
                .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?,
            task_id: self.task_id,
            task_name: self.task_name,
            job_key: self.job_key,
            owner_id: self.owner_id,
            current_state: parse_state(&self.state)?,
            last_heartbeat: parse_datetime(&self.last_heartbeat)?,
            recovery_priority: i32::try_from(self.recovery_priority).unwrap_or(i32::MAX),
            progress_percent: u8::try_from(self.progress_percent.clamp(0, 100)).unwrap_or(100),
            current_step: self.current_step,
        })
    }
}

struct CheckpointRow {
    job_id: String,
    name: String,
    progress_percent: i64,
    recoverable_data: String,
    db_state: String,
    file_state: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            name: row.try_get("name")?,
            progress_percent: row.try_get("progress_percent")?,
            recoverable_data: row.try_get("recoverable_data")?,
            db_state: row.try_get("db_state")?,
            file_state: row.try_get("file_state")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        Ok(Checkpoint {
            job_id: self.job_id,
            name: self.name,
            // Out-of-range values are kept so `is_valid` can reject them.
            progress_percent: u8::try_from(self.progress_percent).unwrap_or(u8::MAX),
            recoverable_data: from_json_text(&self.recoverable_data, "recoverable_data")?,
            db_state: from_json_text(&self.db_state, "db_state")?,
            file_state: from_json_text(&self.file_state, "file_state")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// TaskRegistry impl
// ---------------------------------------------------------------------------

impl TaskRegistry for SqliteTaskRegistry {
    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool.reader)
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "task registry ping failed");
                RepositoryError::Connection
            })?;
        Ok(())
    }

    async fn register(&self, registration: &TaskRegistration) -> Result<Uuid, RepositoryError> {
        let id = Uuid::now_v7();
        let now = format_datetime(&Utc::now());
        let args = to_json_text(&registration.args, "args")?;
        let kwargs = to_json_text(&registration.kwargs, "kwargs")?;

        sqlx::query(
            r#"INSERT INTO recoverable_tasks
               (id, task_id, task_name, job_key, owner_id, state, last_heartbeat,
                recovery_priority, progress_percent, args, kwargs, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, 'running', ?, ?, 0, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(&registration.task_id)
        .bind(&registration.task_name)
        .bind(&registration.job_key)
        .bind(&registration.owner_id)
        .bind(&now)
        .bind(i64::from(registration.recovery_priority))
        .bind(&args)
        .bind(&kwargs)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(
                format!("task '{}' is already registered", registration.task_id),
            ),
            other => query_error(other),
        })?;

        tracing::debug!(registry_id = %id, task_id = registration.task_id.as_str(), "task registered");
        Ok(id)
    }

    async fn discover_recoverable(
        &self,
        stale_after: Duration,
    ) -> Result<Vec<RecoverableTaskStub>, RepositoryError> {
        let cutoff = cutoff(stale_after)?;
        let sql = format!(
            "SELECT {STUB_COLUMNS} FROM recoverable_tasks \
             WHERE state IN ('running', 'stale') AND last_heartbeat <= ? \
             ORDER BY last_heartbeat ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(&cutoff)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut stubs = Vec::with_capacity(rows.len());
        for row in &rows {
            stubs.push(TaskRow::from_row(row).map_err(query_error)?.into_stub()?);
        }
        Ok(stubs)
    }

    async fn get_full_task(
        &self,
        registry_id: Uuid,
    ) -> Result<Option<RecoverableTask>, RepositoryError> {
        let sql = format!("SELECT {STUB_COLUMNS}, args, kwargs FROM recoverable_tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(registry_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let args: String = row.try_get("args").map_err(query_error)?;
        let kwargs: String = row.try_get("kwargs").map_err(query_error)?;
        let stub = TaskRow::from_row(&row).map_err(query_error)?.into_stub()?;
        Ok(Some(RecoverableTask {
            stub,
            args: from_json_text::<Vec<Value>>(&args, "args")?,
            kwargs: from_json_text::<Map<String, Value>>(&kwargs, "kwargs")?,
        }))
    }

    async fn update_state(
        &self,
        registry_id: Uuid,
        state: TaskState,
        resolution: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE recoverable_tasks SET state = ?, resolution = COALESCE(?, resolution), updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(resolution)
        .bind(format_datetime(&Utc::now()))
        .bind(registry_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        task_id: &str,
        progress_percent: u8,
        current_step: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            r#"UPDATE recoverable_tasks
               SET last_heartbeat = ?, progress_percent = ?,
                   current_step = COALESCE(?, current_step), updated_at = ?
               WHERE task_id = ?"#,
        )
        .bind(&now)
        .bind(i64::from(progress_percent.min(100)))
        .bind(current_step)
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn finish(&self, task_id: &str, state: TaskState) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            r#"UPDATE recoverable_tasks
               SET state = ?, last_heartbeat = ?, updated_at = ?
               WHERE task_id = ? AND state NOT IN ('completed', 'failed')"#,
        )
        .bind(state.as_str())
        .bind(&now)
        .bind(&now)
        .bind(task_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM recoverable_tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(query_error)?;
            if exists.is_none() {
                return Err(RepositoryError::NotFound);
            }
        }
        Ok(())
    }

    async fn claim_for_recovery(
        &self,
        registry_id: Uuid,
        claimant: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE recoverable_tasks
               SET state = 'recovering', claimed_by = ?,
                   recovery_attempts = recovery_attempts + 1, updated_at = ?
               WHERE id = ? AND state IN ('running', 'stale')"#,
        )
        .bind(claimant)
        .bind(format_datetime(&Utc::now()))
        .bind(registry_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn resolve_claim(
        &self,
        registry_id: Uuid,
        claimant: &str,
        state: TaskState,
        resolution: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE recoverable_tasks
               SET state = ?, resolution = ?, updated_at = ?
               WHERE id = ? AND state = 'recovering' AND claimed_by = ?"#,
        )
        .bind(state.as_str())
        .bind(resolution)
        .bind(format_datetime(&Utc::now()))
        .bind(registry_id.to_string())
        .bind(claimant)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn validate_recovery_eligibility(
        &self,
        registry_id: Uuid,
    ) -> Result<EligibilityVerdict, RepositoryError> {
        let row = sqlx::query(
            "SELECT state, task_name, recovery_attempts, claimed_by FROM recoverable_tasks WHERE id = ?",
        )
        .bind(registry_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(EligibilityVerdict::ineligible("task not found"));
        };
        let state: String = row.try_get("state").map_err(query_error)?;
        let task_name: String = row.try_get("task_name").map_err(query_error)?;
        let attempts: i64 = row.try_get("recovery_attempts").map_err(query_error)?;
        let claimed_by: Option<String> = row.try_get("claimed_by").map_err(query_error)?;

        Ok(eligibility_of(
            parse_state(&state)?,
            &task_name,
            u32::try_from(attempts).unwrap_or(u32::MAX),
            claimed_by.as_deref(),
        ))
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteTaskRegistry {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO checkpoints
               (job_id, name, progress_percent, recoverable_data, db_state, file_state, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&checkpoint.job_id)
        .bind(&checkpoint.name)
        .bind(i64::from(checkpoint.progress_percent))
        .bind(to_json_text(&checkpoint.recoverable_data, "recoverable_data")?)
        .bind(to_json_text(&checkpoint.db_state, "db_state")?)
        .bind(to_json_text(&checkpoint.file_state, "file_state")?)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_latest_checkpoint(
        &self,
        job_id: &str,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT job_id, name, progress_percent, recoverable_data, db_state, file_state, created_at
               FROM checkpoints
               WHERE job_id = ?
                 AND name <> ''
                 AND progress_percent BETWEEN 0 AND 100
                 AND recoverable_data <> 'null'
               ORDER BY created_at DESC, id DESC LIMIT 1"#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|row| {
            CheckpointRow::from_row(&row)
                .map_err(query_error)?
                .into_checkpoint()
        })
        .transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
