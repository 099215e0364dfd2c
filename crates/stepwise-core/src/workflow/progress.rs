//! Progress emission: step ranges -> job-level percentages -> notifier.
//!
//! Each step owns a [`ProgressRange`]. When a step finishes the executor
//! reports the range ceiling; steps that process pages or chunks report
//! interpolated values through [`StepProgress`]. Delivery is best effort: a
//! failing or panicking notifier is logged and never reaches the job.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use stepwise_types::event::EngineEvent;
use stepwise_types::progress::ProgressRange;

use crate::event::bus::EventBus;

// ---------------------------------------------------------------------------
// Notifier port
// ---------------------------------------------------------------------------

/// Error returned by a notifier; swallowed by the emitter.
#[derive(Debug, thiserror::Error)]
#[error("progress notification failed: {0}")]
pub struct NotifyError(pub String);

/// Receiver of job progress updates (websocket fan-out, status table, ...).
pub trait ProgressNotifier: Send + Sync {
    fn notify(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        description: &str,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Object-safe version of [`ProgressNotifier`].
pub trait ProgressNotifierDyn: Send + Sync {
    fn notify_boxed<'a>(
        &'a self,
        job_id: &'a str,
        step_name: &'a str,
        percent: u8,
        description: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;
}

impl<T: ProgressNotifier> ProgressNotifierDyn for T {
    fn notify_boxed<'a>(
        &'a self,
        job_id: &'a str,
        step_name: &'a str,
        percent: u8,
        description: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>> {
        Box::pin(self.notify(job_id, step_name, percent, description))
    }
}

/// Type-erased notifier shared by every job of an executor.
#[derive(Clone)]
pub struct BoxProgressNotifier {
    inner: Arc<dyn ProgressNotifierDyn>,
}

impl BoxProgressNotifier {
    pub fn new<T: ProgressNotifier + 'static>(notifier: T) -> Self {
        Self {
            inner: Arc::new(notifier),
        }
    }

    pub async fn notify(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        description: &str,
    ) -> Result<(), NotifyError> {
        self.inner
            .notify_boxed(job_id, step_name, percent, description)
            .await
    }
}

/// Discards all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl ProgressNotifier for NoopNotifier {
    async fn notify(&self, _: &str, _: &str, _: u8, _: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Publishes updates as [`EngineEvent::Progress`] on the event bus.
#[derive(Debug, Clone)]
pub struct EventBusNotifier {
    bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl ProgressNotifier for EventBusNotifier {
    async fn notify(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        description: &str,
    ) -> Result<(), NotifyError> {
        self.bus.publish(EngineEvent::Progress {
            job_id: job_id.to_string(),
            step_name: step_name.to_string(),
            percent,
            description: description.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProgressEmitter
// ---------------------------------------------------------------------------

/// Per-job emitter tracking the highest percentage delivered so far.
///
/// Values below the high-water mark are raised to it, so a notifier never
/// observes progress going backwards even when phase members finish out of
/// order.
pub struct ProgressEmitter {
    job_id: String,
    notifier: BoxProgressNotifier,
    high_water: AtomicU8,
}

impl ProgressEmitter {
    pub fn new(job_id: impl Into<String>, notifier: BoxProgressNotifier) -> Self {
        Self {
            job_id: job_id.into(),
            notifier,
            high_water: AtomicU8::new(0),
        }
    }

    /// Highest percentage delivered so far.
    pub fn current(&self) -> u8 {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Deliver a progress update, best effort.
    ///
    /// Returns the value actually delivered.
    pub async fn emit(&self, step_name: &str, percent: u8, description: &str) -> u8 {
        let percent = percent.min(100);
        let previous = self.high_water.fetch_max(percent, Ordering::SeqCst);
        let delivered = previous.max(percent);

        let delivery = self
            .notifier
            .notify(&self.job_id, step_name, delivered, description);
        match AssertUnwindSafe(delivery).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(job_id = self.job_id.as_str(), step = step_name, error = %e, "progress notifier failed");
            }
            Err(_) => {
                tracing::warn!(job_id = self.job_id.as_str(), step = step_name, "progress notifier panicked");
            }
        }
        delivered
    }
}

// ---------------------------------------------------------------------------
// StepProgress
// ---------------------------------------------------------------------------

/// Handle given to a running step for sub-progress reports.
#[derive(Clone)]
pub struct StepProgress {
    emitter: Option<Arc<ProgressEmitter>>,
    step_name: String,
    range: Option<ProgressRange>,
}

impl StepProgress {
    pub(crate) fn new(emitter: Arc<ProgressEmitter>, step_name: &str, range: ProgressRange) -> Self {
        Self {
            emitter: Some(emitter),
            step_name: step_name.to_string(),
            range: Some(range),
        }
    }

    /// A handle that reports nowhere (for calling steps outside an executor).
    pub fn detached() -> Self {
        Self {
            emitter: None,
            step_name: String::new(),
            range: None,
        }
    }

    pub fn range(&self) -> Option<ProgressRange> {
        self.range
    }

    /// Report that `done` of `total` units are finished.
    pub async fn report(&self, done: u64, total: u64, description: &str) {
        if let (Some(emitter), Some(range)) = (&self.emitter, self.range) {
            let percent = range.interpolate(done, total);
            emitter.emit(&self.step_name, percent, description).await;
        }
    }
}

impl std::fmt::Debug for StepProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepProgress")
            .field("step_name", &self.step_name)
            .field("range", &self.range)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
