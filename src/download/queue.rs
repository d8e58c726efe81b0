//! Bounded worker pool.
//!
//! [`TaskQueue`] runs submitted futures as Tokio tasks, at most
//! `max_concurrency` at a time. A semaphore permit is acquired *before* the
//! job is spawned, so a saturated pool blocks the submitter (backpressure)
//! instead of buffering jobs. The permit moves into the job and is released
//! when the job returns (RAII).

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, instrument, warn};

/// Bounded pool of concurrently running jobs.
///
/// Jobs report their own outcomes; the queue only sees whether they returned
/// or panicked. A panicking job never affects its siblings.
///
/// # Example
///
/// ```
/// use folio_core::download::TaskQueue;
///
/// # async fn example() {
/// let mut queue = TaskQueue::new(4);
/// for page in 1..=10 {
///     queue.submit(async move {
///         println!("page {page}");
///     }).await;
/// }
/// queue.wait().await;
/// # }
/// ```
#[derive(Debug)]
pub struct TaskQueue {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    jobs: JoinSet<()>,
    panicked: usize,
}

impl TaskQueue {
    /// Creates a pool running at most `max_concurrency` jobs (minimum 1).
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            jobs: JoinSet::new(),
            panicked: 0,
        }
    }

    /// Returns the concurrency limit.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Returns how many jobs currently hold a slot.
    #[must_use]
    pub fn running(&self) -> usize {
        self.max_concurrency - self.semaphore.available_permits()
    }

    /// Starts `job` once a slot is free, waiting for one if the pool is full.
    pub async fn submit<F>(&mut self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // the semaphore is owned here and never closed
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        self.reap_finished();

        self.jobs.spawn(async move {
            let _permit = permit;
            job.await;
        });
    }

    /// Waits until every submitted job has returned.
    ///
    /// Returns the number of jobs that panicked since the queue was created.
    #[instrument(skip(self), fields(pending = self.jobs.len()))]
    pub async fn wait(&mut self) -> usize {
        debug!("waiting for jobs to complete");
        while let Some(joined) = self.jobs.join_next().await {
            self.record(joined);
        }
        self.panicked
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.jobs.try_join_next() {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            // panics are logged but don't fail the batch
            warn!(error = %e, "job panicked");
            self.panicked += 1;
        }
    }
}
