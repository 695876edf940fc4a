//! Generic interval-driven background task runner (§4.I), backing the
//! revision-cleanup idle timer and the remote-synchronization worker.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Trait for tasks executed by [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;
    async fn run(&mut self, task: Self::Task);
    async fn on_tick(&mut self) {}
    async fn shutdown(&mut self) {}
}

/// Runs one `BackgroundRunnable` on its own task, draining a FIFO work queue
/// and calling `on_tick` on an interval while idle.
///
/// Queued tasks (`submit`) and ticks race fairly via `tokio::select!`; a
/// burst of submissions does not starve ticks, nor does a slow tick delay
/// already-queued work indefinitely.
pub struct BackgroundWorker<T> {
    sender: Option<mpsc::Sender<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> BackgroundWorker<T> {
    /// Spawns `runnable` onto the current Tokio runtime.
    pub fn spawn<R>(mut runnable: R, tick_interval: Duration, queue_capacity: usize) -> Self
    where
        R: BackgroundRunnable<Task = T>,
    {
        let (sender, mut receiver) = mpsc::channel::<T>(queue_capacity);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    maybe_task = receiver.recv() => {
                        match maybe_task {
                            Some(task) => runnable.run(task).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                }
            }
            runnable.shutdown().await;
        });
        Self { sender: Some(sender), handle: Some(handle) }
    }

    /// Queues a task for the worker to process, FIFO.
    ///
    /// # Errors
    ///
    /// Returns the task back if the worker's queue is full or it has
    /// already been shut down.
    pub async fn submit(&self, task: T) -> Result<(), mpsc::error::SendError<T>> {
        match &self.sender {
            Some(sender) => sender.send(task).await,
            None => Err(mpsc::error::SendError(task)),
        }
    }

    /// Closes the work queue (ending the loop once it drains), runs
    /// `R::shutdown`, and waits for the task to exit.
    pub async fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
