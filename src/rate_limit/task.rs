use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// A periodic background job owned by the component that started it.
///
/// The job runs every `period` until [`BackgroundTask::shutdown`] is called or the
/// task is dropped.
pub struct BackgroundTask {
    name: &'static str,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `job` on the current runtime, first run one `period` from now
    pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            debug!(task = name, period_secs = period.as_secs_f64(), "Background task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => job().await,
                    _ = &mut stop_rx => break,
                }
            }

            debug!(task = name, "Background task stopped");
        });

        Self {
            name,
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Signal the task to stop and wait for it to finish
    pub async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "Background task ended abnormally");
            }
        }
    }

    /// Whether the task is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
