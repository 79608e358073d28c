use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::OrchestratorError;

/// Default in-flight limit for a provider that doesn't declare one.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Bounds in-flight calls to one provider. Waiters are granted slots in FIFO
/// order (tokio's semaphore is fair).
pub struct ConcurrencyLimiter {
    provider: String,
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// A held slot. Released on `release()` or drop, whichever comes first.
#[derive(Debug)]
pub struct LimiterPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl LimiterPermit {
    /// Give the slot back. Safe to call more than once.
    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl ConcurrencyLimiter {
    pub fn new(provider: impl Into<String>, max: usize) -> Self {
        Self {
            provider: provider.into(),
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.max.saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a slot with no deadline.
    pub async fn acquire(&self) -> Result<LimiterPermit, OrchestratorError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map(|permit| LimiterPermit {
                permit: Some(permit),
            })
            .map_err(|_| OrchestratorError::LimiterClosed {
                provider: self.provider.clone(),
            })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| LimiterPermit {
                permit: Some(permit),
            })
    }

    /// Wait for a slot, giving up with `Saturated` once `deadline` passes.
    pub async fn acquire_until(
        &self,
        deadline: Instant,
    ) -> Result<LimiterPermit, OrchestratorError> {
        tokio::time::timeout_at(deadline, self.acquire())
            .await
            .map_err(|_| OrchestratorError::Saturated {
                provider: self.provider.clone(),
            })?
    }

    /// Wake all waiters with `LimiterClosed`. Used on deregistration.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("provider", &self.provider)
            .field("max", &self.max)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
