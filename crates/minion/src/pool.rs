//! Bounded pool for blocking calls
//!
//! Calls run on tokio's blocking threads; a semaphore caps how many run at
//! once. Closing the pool makes every later call fail with `ShuttingDown`.

use crate::{MinionError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Default number of concurrent blocking calls
pub const DEFAULT_POOL_SIZE: usize = 128;

/// Bounded offload pool for blocking work
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl BlockingPool {
    /// Pool running at most `size` calls at a time
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `call` off the event loop and return its result
    pub async fn run<F, T>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MinionError::ShuttingDown)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call()
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                MinionError::Internal("blocking call panicked".to_string())
            } else {
                MinionError::ShuttingDown
            }
        })
    }

    /// Refuse new calls; running calls finish normally
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Maximum concurrent calls
    pub fn size(&self) -> usize {
        self.size
    }
}
