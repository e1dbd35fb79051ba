//! A counting semaphore with capacity `n`. `Acquire` races the permit
//! against cancellation, the same shape as racing a future against
//! `shutdown_rx.changed()` and a sleep timer.

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::error::prelude::*;

#[derive(Clone)]
pub struct TokenLimiter {
    semaphore: Arc<Semaphore>,
}

impl TokenLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Blocks until a token is free or `cancel` fires, in which case this
    /// returns an error rather than a permit — callers must not proceed.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                bail!("token limiter acquire cancelled");
            }
            permit = self.semaphore.acquire() => {
                permit.map_err(acquire_error)
            }
        }
    }

    /// Same as `acquire`, but the permit owns a clone of the semaphore's
    /// `Arc` so it can be carried into a spawned task.
    pub async fn acquire_owned(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                bail!("token limiter acquire cancelled");
            }
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(acquire_error)
            }
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

fn acquire_error(e: AcquireError) -> anyhow::Error {
    anyhow!("token limiter semaphore closed: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_blocks_past_capacity_until_release() {
        let limiter = TokenLimiter::new(1);
        let cancel = CancellationToken::new();
        let permit = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.available_permits(), 0);
        drop(permit);
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn acquire_is_cancellable() {
        let limiter = TokenLimiter::new(1);
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();
        assert!(limiter.acquire(&cancel).await.is_err());
    }
}
