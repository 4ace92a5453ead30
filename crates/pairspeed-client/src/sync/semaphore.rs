use std::time::Duration;

use crate::error::{Error, Result};

/// Counting semaphore with FIFO waiters and an optional timeout on `down`.
///
/// Backed by tokio's fair semaphore: a released unit goes to the earliest
/// blocked caller, and a caller whose wait is abandoned (timeout or drop)
/// leaves the queue without consuming anything.
pub struct Semaphore {
    inner: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self { inner: tokio::sync::Semaphore::new(count) }
    }

    /// Take one unit, waiting at most `timeout` if none is available.
    pub async fn down(&self, timeout: Option<Duration>) -> Result<()> {
        let acquired = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.acquire())
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => self.inner.acquire().await,
        };
        let permit = acquired.map_err(|_| Error::transport("semaphore closed"))?;
        permit.forget();
        Ok(())
    }

    /// Release one unit: hands it to the head waiter, or banks it.
    pub fn up(&self) {
        self.inner.add_permits(1);
    }

    pub fn count(&self) -> usize {
        self.inner.available_permits()
    }
}
