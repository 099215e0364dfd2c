//! SQLite artifact repository: terminal job results and persisted stages.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use stepwise_core::repository::artifact::ArtifactRepository;
use stepwise_types::error::RepositoryError;

use super::pool::DatabasePool;
use super::{format_datetime, from_json_text, query_error, to_json_text};

#[derive(Clone)]
pub struct SqliteArtifactRepository {
    pool: DatabasePool,
}

impl SqliteArtifactRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl ArtifactRepository for SqliteArtifactRepository {
    async fn find_terminal_result(&self, job_key: &str) -> Result<Option<Value>, RepositoryError> {
        let row = sqlx::query("SELECT result FROM job_results WHERE job_key = ?")
            .bind(job_key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let text: String = row.try_get("result").map_err(query_error)?;
                Ok(Some(from_json_text(&text, "job result")?))
            }
            None => Ok(None),
        }
    }

    async fn completed_stages(&self, job_key: &str) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT stage FROM completed_stages WHERE job_key = ? ORDER BY completed_at ASC, rowid ASC",
        )
        .bind(job_key)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        Ok(rows.into_iter().map(|(stage,)| stage).collect())
    }

    async fn record_terminal_result(
        &self,
        job_key: &str,
        result: &Value,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO job_results (job_key, result, created_at, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(job_key) DO UPDATE SET
                 result = excluded.result,
                 updated_at = excluded.updated_at"#,
        )
        .bind(job_key)
        .bind(to_json_text(result, "job result")?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn record_stage(&self, job_key: &str, stage: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT OR IGNORE INTO completed_stages (job_key, stage, completed_at) VALUES (?, ?, ?)",
        )
        .bind(job_key)
        .bind(stage)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }
}
