//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod artifacts;
pub mod pool;
pub mod registry;

use chrono::{DateTime, SecondsFormat, Utc};
use stepwise_types::error::RepositoryError;

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps, so text comparison in SQL orders correctly.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json_text<T: serde::Serialize + ?Sized>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn from_json_text<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(text).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::pool::DatabasePool;

    pub(crate) async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        use chrono::{TimeZone, Utc};
        let earlier = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let later = earlier + chrono::Duration::milliseconds(1500);
        let (a, b) = (super::format_datetime(&earlier), super::format_datetime(&later));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(super::parse_datetime(&b).unwrap(), later);
    }
}
