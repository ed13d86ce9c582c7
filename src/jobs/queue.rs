//! A bounded in-process job queue.
//!
//! Up to `capacity` jobs may wait in the queue, and up to `workers` jobs run at
//! once. When the queue is full, [`JobQueue::try_submit`] refuses new work
//! instead of blocking, so an HTTP handler can turn it into a 503 straight
//! away.
//!
//! Dropping every [`JobQueue`] closes the channel. The background worker then
//! finishes whatever is queued and exits, which is how we drain on shutdown.

use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    async_utils::{BoxedFuture, JoinWorker},
    error::JobError,
    prelude::*,
};

/// An async job function.
pub type JobFn<T> = Arc<dyn Fn(T) -> BoxedFuture<()> + Send + Sync + 'static>;

/// The submitting side of the queue. Cheap to clone.
pub struct JobQueue<T> {
    tx: mpsc::Sender<T>,
}

// Override `Clone` so that `T` is not required to be `Clone`.
impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> JobQueue<T>
where
    T: Send + 'static,
{
    /// Start a background worker running `job_fn` on up to `workers` jobs at
    /// a time.
    ///
    /// Each job runs in its own task, so a panicking job is logged and does
    /// not take the worker down with it.
    pub fn start(workers: usize, capacity: usize, job_fn: JobFn<T>) -> (Self, JoinWorker) {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<T>(capacity.max(1));
        let jobs = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|job| (job, rx))
        });
        let worker = tokio::spawn(async move {
            jobs.for_each_concurrent(workers, |job| {
                let job_fn = job_fn.clone();
                async move {
                    if let Err(err) = tokio::spawn(job_fn(job)).await {
                        error!("job task failed: {}", err);
                    }
                }
            })
            .await;
            debug!("Job queue closed and drained");
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// Queue `job` without waiting. On failure the job is handed back, so the
    /// caller can clean up after it.
    pub fn try_submit(&self, job: T) -> Result<(), (JobError, T)> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err((JobError::QueueFull, job)),
            Err(TrySendError::Closed(job)) => Err((
                JobError::workspace(anyhow!("job queue has shut down")),
                job,
            )),
        }
    }
}
