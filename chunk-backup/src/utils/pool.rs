//! Bounded pool for CPU-bound work (hashing, compression, checksums).
//!
//! Work runs on tokio's blocking threads; a semaphore caps how many jobs a
//! single engine has in flight so a long backup cannot starve the timer task.

use crate::utils::errors::{BackupError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct CpuPool {
    permits: Arc<Semaphore>,
}

impl CpuPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `job` on a blocking thread and wait for its result.
    pub async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| BackupError::Worker(format!("pool closed: {}", e)))?;

        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| BackupError::Worker(e.to_string()))
    }
}

impl Default for CpuPool {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_returns_job_result() {
        let pool = CpuPool::new(2);
        let sum = pool.run(|| (1..=10u64).sum::<u64>()).await.unwrap();
        assert_eq!(sum, 55);
        assert_eq!(pool.permits.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported() {
        let pool = CpuPool::new(1);
        let result = pool.run(|| -> u32 { panic!("boom") }).await;
        assert!(matches!(result, Err(BackupError::Worker(_))));
        // The permit is released even when the job panics.
        assert_eq!(pool.permits.available_permits(), 1);
    }

    #[test]
    fn test_zero_workers_is_clamped() {
        let pool = CpuPool::new(0);
        assert_eq!(pool.permits.available_permits(), 1);
    }
}
