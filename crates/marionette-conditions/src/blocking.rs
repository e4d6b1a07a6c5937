use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

/// Fixed-size pool for work that must not stall an entity's executor
#[derive(Debug, Clone)]
pub struct BlockingPool {
    name: &'static str,
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(name: &'static str, workers: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `work` on a blocking thread once a worker slot is free.
    ///
    /// Returns `None` if the work panicked.
    pub async fn run<F, R>(&self, work: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await;

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(target: "scheduler", "{} pool task failed: {}", self.name, e);
                None
            }
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
