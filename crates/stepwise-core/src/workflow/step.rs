//! Step contract and its object-safe wrapper.
//!
//! Follows the same blanket-impl pattern as the repository ports:
//! 1. `Step` uses RPITIT for the async method (not object safe)
//! 2. `StepDyn` is the object-safe version with boxed futures, blanket-implemented
//! 3. `BoxStep` wraps `Arc<dyn StepDyn>` so the executor can store
//!    heterogeneous steps in one table and move them into spawned tasks

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use stepwise_types::job::ErrorDetails;

use super::progress::StepProgress;
use super::state::{StateBag, StateDelta};

// ---------------------------------------------------------------------------
// StepFailure
// ---------------------------------------------------------------------------

/// Unexpected fault raised by a step.
///
/// Business failures are signalled by returning a delta with `error` set;
/// a `StepFailure` is for everything else (I/O faults, upstream 5xx,
/// timeouts). The executor converts it into [`ErrorDetails`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepFailure {
    pub kind: String,
    pub message: String,
    pub context: Option<Value>,
    pub root_cause_kind: Option<String>,
    pub root_cause_message: Option<String>,
}

impl StepFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            context: None,
            root_cause_kind: None,
            root_cause_message: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("timeout", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation", message)
    }

    /// Wrap an error, keeping its innermost source as the root cause.
    pub fn from_error(kind: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut failure = Self::new(kind, err.to_string());
        let mut root = err;
        while let Some(source) = root.source() {
            root = source;
        }
        if !std::ptr::addr_eq(root, err) {
            failure.root_cause_kind = Some(error_type_name(root));
            failure.root_cause_message = Some(root.to_string());
        }
        failure
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_root_cause(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.root_cause_kind = Some(kind.into());
        self.root_cause_message = Some(message.into());
        self
    }

    pub fn into_details(self, step_name: &str) -> ErrorDetails {
        let mut details = ErrorDetails::new(step_name, self.kind, self.message);
        details.context = self.context;
        details.root_cause_kind = self.root_cause_kind;
        details.root_cause_message = self.root_cause_message;
        details
    }
}

fn error_type_name(err: &dyn std::error::Error) -> String {
    // Debug output starts with the type or variant name for derived impls.
    let debug = format!("{err:?}");
    debug
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("error")
        .to_string()
}

// ---------------------------------------------------------------------------
// Step trait
// ---------------------------------------------------------------------------

/// A named unit of work inside a workflow.
///
/// Implementations receive a read-only view of the job state and return the
/// fields they produce. They may report sub-progress through `progress`.
pub trait Step: Send + Sync {
    fn execute(
        &self,
        state: &StateBag,
        progress: &StepProgress,
    ) -> impl Future<Output = Result<StateDelta, StepFailure>> + Send;
}

/// Object-safe version of [`Step`] with boxed futures.
pub trait StepDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        state: &'a StateBag,
        progress: &'a StepProgress,
    ) -> Pin<Box<dyn Future<Output = Result<StateDelta, StepFailure>> + Send + 'a>>;
}

impl<T: Step> StepDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        state: &'a StateBag,
        progress: &'a StepProgress,
    ) -> Pin<Box<dyn Future<Output = Result<StateDelta, StepFailure>> + Send + 'a>> {
        Box::pin(self.execute(state, progress))
    }
}

/// Type-erased, cheaply cloneable step.
#[derive(Clone)]
pub struct BoxStep {
    inner: Arc<dyn StepDyn>,
}

impl BoxStep {
    pub fn new<T: Step + 'static>(step: T) -> Self {
        Self {
            inner: Arc::new(step),
        }
    }

    pub async fn execute(
        &self,
        state: &StateBag,
        progress: &StepProgress,
    ) -> Result<StateDelta, StepFailure> {
        self.inner.execute_boxed(state, progress).await
    }
}

impl std::fmt::Debug for BoxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStep").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Closure steps
// ---------------------------------------------------------------------------

/// Step backed by an async closure.
pub struct FnStep<F> {
    f: F,
}

/// Build a step from an async closure taking an owned state snapshot.
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(StateBag, StepProgress) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateDelta, StepFailure>> + Send,
{
    FnStep { f }
}

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StateBag, StepProgress) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateDelta, StepFailure>> + Send,
{
    fn execute(
        &self,
        state: &StateBag,
        progress: &StepProgress,
    ) -> impl Future<Output = Result<StateDelta, StepFailure>> + Send {
        (self.f)(state.clone(), progress.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct ConnectionReset;

    #[derive(Debug, thiserror::Error)]
    #[error("upstream call failed")]
    struct UpstreamFailed(#[source] ConnectionReset);

    #[test]
    fn test_failure_into_details() {
        let details = StepFailure::timeout("ocr took too long")
            .with_context(json!({ "page": 3 }))
            .into_details("ocr");
        assert_eq!(details.step_name, "ocr");
        assert_eq!(details.error_kind, "timeout");
        assert_eq!(details.context, Some(json!({ "page": 3 })));
    }

    #[test]
    fn test_from_error_captures_root_cause() {
        let err = UpstreamFailed(ConnectionReset);
        let failure = StepFailure::from_error("upstream", &err);
        assert_eq!(failure.message, "upstream call failed");
        assert_eq!(failure.root_cause_kind.as_deref(), Some("ConnectionReset"));
        assert_eq!(failure.root_cause_message.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_from_error_without_source() {
        let failure = StepFailure::from_error("io", &ConnectionReset);
        assert!(failure.root_cause_kind.is_none());
    }

    #[tokio::test]
    async fn test_box_step_runs_closure() {
        let step = BoxStep::new(step_fn(|state: StateBag, _progress| async move {
            let id = state.get_str("document_id").unwrap_or_default().to_string();
            Ok(StateDelta::new().set("echo", id))
        }));
        let state = StateBag::new().with("document_id", "doc-1");
        let delta = step.execute(&state, &StepProgress::detached()).await.unwrap();
        assert_eq!(delta.get("echo"), Some(&json!("doc-1")));
    }
}
