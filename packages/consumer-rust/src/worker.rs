//! Background worker processing tasks from a bounded queue.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Task handler driven by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    /// Called on every tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the last task, when the worker stops.
    async fn shutdown(&mut self) {}
}

/// Returned by [`BackgroundWorker::submit`] once the worker has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("background worker stopped")]
pub struct WorkerStopped;

/// Spawned task that feeds queued tasks to a [`BackgroundRunnable`] one at a
/// time.
///
/// Stopping closes the queue; tasks submitted before the stop still run.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Mutex<Option<mpsc::Sender<R::Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: BackgroundRunnable> fmt::Debug for BackgroundWorker<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("running", &self.tx.lock().is_some())
            .finish()
    }
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker with room for `capacity` queued tasks.
    #[must_use]
    pub fn start(mut runnable: R, capacity: usize, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(tick_interval.max(Duration::from_millis(1)));
            // The first tick completes immediately.
            ticks.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queues a task, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerStopped`] if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> Result<(), WorkerStopped> {
        let tx = self.tx.lock().clone().ok_or(WorkerStopped)?;
        tx.send(task).await.map_err(|_| WorkerStopped)
    }

    /// Closes the queue and waits for queued tasks and `shutdown` to finish.
    pub async fn stop(&self) {
        self.tx.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, "background worker panicked");
            }
        }
    }
}
