//! Bounded worker pool fronting the store: width 20, queue depth 100 by
//! default, a 10s deadline per submitted unit of work. Queue saturation and
//! deadline expiry both surface as `Busy`, matching the concurrency model's
//! cancellation/timeout section.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    queue_depth: Arc<AtomicUsize>,
    max_queue_depth: usize,
    deadline: Duration,
}

impl WorkerPool {
    pub fn new(width: usize, max_queue_depth: usize, deadline: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(width)),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            max_queue_depth,
            deadline,
        }
    }

    pub fn default_pool() -> Self {
        Self::new(20, 100, Duration::from_secs(10))
    }

    /// Runs `task` on the pool, returning `Busy` if the queue is already at
    /// capacity or the task doesn't complete within the deadline.
    pub async fn submit<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let in_flight = self.queue_depth.fetch_add(1, Ordering::SeqCst);
        if in_flight >= self.max_queue_depth {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::busy("worker pool queue is saturated"));
        }

        let result = {
            let _permit = self.semaphore.acquire().await.expect("semaphore is never closed");
            tokio::time::timeout(self.deadline, task).await
        };
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(inner) => inner,
            Err(_elapsed) => Err(Error::busy("store write timed out")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submits_run_to_completion_under_capacity() {
        let pool = WorkerPool::new(2, 10, Duration::from_secs(1));
        let result = pool.submit(async { Ok::<_, Error>(42) }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn queue_saturation_yields_busy() {
        let pool = WorkerPool::new(1, 0, Duration::from_secs(1));
        let err = pool.submit(async { Ok::<_, Error>(()) }).await.unwrap_err();
        assert_eq!(err.http_status(), 503);
    }

    #[tokio::test]
    async fn deadline_expiry_yields_busy() {
        let pool = WorkerPool::new(1, 10, Duration::from_millis(10));
        let err = pool
            .submit(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 503);
    }
}
