use crate::error::{CommonError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Background task pool backed by a tokio runtime handle.
///
/// One-off work goes through [`TaskExecutor::spawn`], timers through
/// [`TaskExecutor::spawn_periodic`]. A "submit and wait" is `spawn` followed by
/// [`TaskExecutor::join`].
#[derive(Clone)]
pub struct TaskExecutor {
    handle: Handle,
    cancel: CancellationToken,
}

/// Handle to a periodic job. Dropping it leaves the job running; call
/// [`PeriodicTask::cancel`] or [`PeriodicTask::stop`] to end it.
///
/// A run already in progress always completes; cancellation is only
/// observed between ticks.
pub struct PeriodicTask {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskExecutor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            cancel: CancellationToken::new(),
        }
    }

    /// Executor on the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| CommonError::Runtime(e.to_string()))?;
        Ok(Self::new(handle))
    }

    pub fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        debug!(task = name, "spawning task");
        self.handle.spawn(future)
    }

    /// Runs `job` every `period`, first after one full period has elapsed.
    /// A run that overlaps the next tick delays the schedule instead of bursting.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, mut job: F) -> PeriodicTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let task_name = name.to_string();
        let handle = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        debug!(task = %task_name, "periodic task cancelled");
                        return;
                    }
                    _ = ticker.tick() => job().await,
                }
            }
        });
        debug!(task = name, period_secs = period.as_secs(), "periodic task started");
        PeriodicTask {
            name: name.to_string(),
            cancel,
            handle,
        }
    }

    pub async fn join<T>(name: &str, handle: JoinHandle<T>) -> Result<T> {
        handle.await.map_err(|e| {
            error!(task = name, "task did not complete: {}", e);
            CommonError::Join {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Stops every periodic task started from this executor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl PeriodicTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the job to stop after its current run, without waiting.
    pub fn cancel(self) {
        self.cancel.cancel();
    }

    /// Signals the job to stop and waits for its current run to finish.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        TaskExecutor::join(&self.name, self.handle).await
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
