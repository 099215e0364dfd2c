//! Job submission port.
//!
//! The recovery orchestrator re-enters the engine only through
//! [`JobSubmitter`], the same path new jobs take. Follows the blanket-impl
//! pattern used for steps and notifiers:
//! 1. `JobSubmitter` uses RPITIT (not object safe)
//! 2. `JobSubmitterDyn` is the object-safe version, blanket-implemented
//! 3. `BoxJobSubmitter` wraps `Arc<dyn JobSubmitterDyn>` and delegates

pub mod in_process;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use stepwise_types::error::RepositoryError;

pub use in_process::InProcessSubmitter;

/// Errors raised when a job cannot be submitted.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("no workflow registered under '{0}'")]
    UnknownWorkflow(String),

    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error("task registry error: {0}")]
    Registry(#[from] RepositoryError),

    #[error("submitter unavailable: {0}")]
    Unavailable(String),
}

pub trait JobSubmitter: Send + Sync {
    /// Start a new execution of `step_fn_name`. Returns the execution ID.
    fn submit(
        &self,
        step_fn_name: &str,
        job_key: Option<&str>,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> impl Future<Output = Result<String, SubmitError>> + Send;

    /// Whether the submitter can currently accept jobs.
    fn ping(&self) -> impl Future<Output = Result<(), SubmitError>> + Send;
}

/// Object-safe version of [`JobSubmitter`] with boxed futures.
pub trait JobSubmitterDyn: Send + Sync {
    fn submit_boxed<'a>(
        &'a self,
        step_fn_name: &'a str,
        job_key: Option<&'a str>,
        args: &'a [Value],
        kwargs: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<String, SubmitError>> + Send + 'a>>;

    fn ping_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), SubmitError>> + Send + '_>>;
}

impl<T: JobSubmitter> JobSubmitterDyn for T {
    fn submit_boxed<'a>(
        &'a self,
        step_fn_name: &'a str,
        job_key: Option<&'a str>,
        args: &'a [Value],
        kwargs: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<String, SubmitError>> + Send + 'a>> {
        Box::pin(self.submit(step_fn_name, job_key, args, kwargs))
    }

    fn ping_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), SubmitError>> + Send + '_>> {
        Box::pin(self.ping())
    }
}

/// Type-erased submitter shared by the recovery strategies.
#[derive(Clone)]
pub struct BoxJobSubmitter {
    inner: Arc<dyn JobSubmitterDyn>,
}

impl BoxJobSubmitter {
    pub fn new<T: JobSubmitter + 'static>(submitter: T) -> Self {
        Self {
            inner: Arc::new(submitter),
        }
    }

    pub async fn submit(
        &self,
        step_fn_name: &str,
        job_key: Option<&str>,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<String, SubmitError> {
        self.inner
            .submit_boxed(step_fn_name, job_key, args, kwargs)
            .await
    }

    pub async fn ping(&self) -> Result<(), SubmitError> {
        self.inner.ping_boxed().await
    }
}

impl std::fmt::Debug for BoxJobSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxJobSubmitter").finish_non_exhaustive()
    }
}

impl<T: JobSubmitter> JobSubmitter for Arc<T> {
    fn submit(
        &self,
        step_fn_name: &str,
        job_key: Option<&str>,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> impl Future<Output = Result<String, SubmitError>> + Send {
        (**self).submit(step_fn_name, job_key, args, kwargs)
    }

    fn ping(&self) -> impl Future<Output = Result<(), SubmitError>> + Send {
        (**self).ping()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// A submission captured by [`RecordingSubmitter`].
    #[derive(Debug, Clone)]
    pub(crate) struct Submission {
        pub(crate) step_fn_name: String,
        pub(crate) job_key: Option<String>,
        pub(crate) kwargs: Map<String, Value>,
    }

    /// Submitter double that records calls and tracks concurrency.
    #[derive(Default)]
    pub(crate) struct RecordingSubmitter {
        pub(crate) submissions: Mutex<Vec<Submission>>,
        pub(crate) delay: Option<Duration>,
        pub(crate) in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        pub(crate) offline: AtomicBool,
        pub(crate) reject: AtomicBool,
    }

    impl RecordingSubmitter {
        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub(crate) fn submissions(&self) -> Vec<Submission> {
            self.submissions.lock().unwrap().clone()
        }
    }

    impl JobSubmitter for RecordingSubmitter {
        async fn submit(
            &self,
            step_fn_name: &str,
            job_key: Option<&str>,
            _args: &[Value],
            kwargs: &Map<String, Value>,
        ) -> Result<String, SubmitError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(SubmitError::Unavailable("queue full".to_string()));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let index = {
                let mut submissions = self.submissions.lock().unwrap();
                submissions.push(Submission {
                    step_fn_name: step_fn_name.to_string(),
                    job_key: job_key.map(str::to_string),
                    kwargs: kwargs.clone(),
                });
                submissions.len()
            };
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("resubmitted-{index}"))
        }

        async fn ping(&self) -> Result<(), SubmitError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(SubmitError::Unavailable("broker down".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_box_submitter_delegates() {
        let recorder = Arc::new(RecordingSubmitter::default());
        let submitter = BoxJobSubmitter::new(Arc::clone(&recorder));
        let id = submitter
            .submit("analyze_document", Some("k"), &[], &Map::new())
            .await
            .unwrap();
        assert_eq!(id, "resubmitted-1");
        assert!(submitter.ping().await.is_ok());

        recorder.offline.store(true, Ordering::SeqCst);
        assert!(submitter.ping().await.is_err());
        assert_eq!(recorder.submissions()[0].job_key.as_deref(), Some("k"));
    }
}
