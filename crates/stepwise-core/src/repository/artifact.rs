//! Artifact repository trait: durable outputs keyed by job key.
//!
//! Steps record terminal results and completed sub-stages here. The
//! short-circuit step and the recovery strategies read them back to avoid
//! redoing work whose output already exists.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::error::RepositoryError;

pub trait ArtifactRepository: Send + Sync {
    /// The stored terminal result for `job_key`, if the job ever completed.
    fn find_terminal_result(
        &self,
        job_key: &str,
    ) -> impl Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Names of sub-stages whose output is durably persisted for `job_key`.
    fn completed_stages(
        &self,
        job_key: &str,
    ) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Store (or replace) the terminal result of `job_key`.
    fn record_terminal_result(
        &self,
        job_key: &str,
        result: &Value,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark a sub-stage as durably persisted. Idempotent.
    fn record_stage(
        &self,
        job_key: &str,
        stage: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

impl<T: ArtifactRepository> ArtifactRepository for Arc<T> {
    fn find_terminal_result(
        &self,
        job_key: &str,
    ) -> impl Future<Output = Result<Option<Value>, RepositoryError>> + Send {
        (**self).find_terminal_result(job_key)
    }

    fn completed_stages(
        &self,
        job_key: &str,
    ) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send {
        (**self).completed_stages(job_key)
    }

    fn record_terminal_result(
        &self,
        job_key: &str,
        result: &Value,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).record_terminal_result(job_key, result)
    }

    fn record_stage(
        &self,
        job_key: &str,
        stage: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).record_stage(job_key, stage)
    }
}
