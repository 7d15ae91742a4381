//! Layered parallelism limiters: global, per-group, and per-target, composed via
//! [`CompositeLimiter`].
//!
//! Acquisition is modeled with `tokio::sync::Semaphore`, racing the acquire against a
//! `CancellationToken` with `tokio::select!` so that cancelling the session always
//! unblocks a waiter rather than leaving it stuck — the async analogue of the
//! fleet-migration tool in the corpus threading a `CancellationToken` alongside every
//! `Semaphore::acquire_owned()`.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

/// Failure modes for limiter acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    #[error("acquire was cancelled")]
    Cancelled,
    #[error("limiter has been closed")]
    Closed,
}

/// A scope held for the lifetime of one in-flight action. Dropping it releases the
/// permit(s) it holds; a scope can never outlive the semaphore it was acquired from
/// because it borrows it.
pub enum LimiterScope<'a> {
    Semaphore(SemaphorePermit<'a>),
    Composite(Box<LimiterScope<'a>>, Box<LimiterScope<'a>>),
    Null,
}

/// Common contract for all limiter layers.
#[async_trait::async_trait]
pub trait Limiter: Send + Sync {
    /// The limit as configured by the caller, before clamping against anything else.
    fn requested_limit(&self) -> usize;

    /// The limit actually enforced, after composing with any other limiters.
    fn effective_limit(&self) -> usize;

    /// Permits currently available to acquire.
    fn available_count(&self) -> usize;

    async fn acquire(&self, cancel: &CancellationToken) -> Result<LimiterScope<'_>, LimiterError>;
}

/// A limiter backed by a single `tokio::sync::Semaphore`.
pub struct SemaphoreLimiter {
    semaphore: Semaphore,
    requested: usize,
    effective: usize,
}

impl SemaphoreLimiter {
    pub fn new(requested: usize, effective: usize) -> Self {
        SemaphoreLimiter {
            semaphore: Semaphore::new(effective),
            requested,
            effective,
        }
    }

    /// Build the effective per-target limiter: `min(globalPerTarget, groupPerTarget,
    /// effectiveMaxActions)`, per §4.2.
    pub fn for_target(global_per_target: usize, group_per_target: usize, max_actions: usize) -> Self {
        let effective = global_per_target.min(group_per_target).min(max_actions);
        SemaphoreLimiter::new(global_per_target, effective.max(1))
    }
}

#[async_trait::async_trait]
impl Limiter for SemaphoreLimiter {
    fn requested_limit(&self) -> usize {
        self.requested
    }

    fn effective_limit(&self) -> usize {
        self.effective
    }

    fn available_count(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<LimiterScope<'_>, LimiterError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LimiterError::Cancelled),
            permit = self.semaphore.acquire() => {
                let permit = permit.map_err(|_| LimiterError::Closed)?;
                Ok(LimiterScope::Semaphore(permit))
            }
        }
    }
}

/// A no-op limiter used to compose with a real limiter when one side of a pair should
/// impose no additional restriction (e.g. a group with no group-level cap).
pub struct NullLimiter;

#[async_trait::async_trait]
impl Limiter for NullLimiter {
    fn requested_limit(&self) -> usize {
        1
    }

    fn effective_limit(&self) -> usize {
        usize::MAX
    }

    fn available_count(&self) -> usize {
        usize::MAX
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<LimiterScope<'_>, LimiterError> {
        if cancel.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }
        Ok(LimiterScope::Null)
    }
}

/// Composes two limiters so an acquire obtains both, in order. `effective_limit` and
/// `available_count` are the minimum of the two parts; `requested_limit` is the
/// maximum, since it reports the more generous of the two caller intents.
pub struct CompositeLimiter {
    first: Arc<dyn Limiter>,
    second: Arc<dyn Limiter>,
}

impl CompositeLimiter {
    pub fn new(first: Arc<dyn Limiter>, second: Arc<dyn Limiter>) -> Self {
        CompositeLimiter { first, second }
    }
}

#[async_trait::async_trait]
impl Limiter for CompositeLimiter {
    fn requested_limit(&self) -> usize {
        self.first.requested_limit().max(self.second.requested_limit())
    }

    fn effective_limit(&self) -> usize {
        self.first.effective_limit().min(self.second.effective_limit())
    }

    fn available_count(&self) -> usize {
        self.first.available_count().min(self.second.available_count())
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<LimiterScope<'_>, LimiterError> {
        let first_scope = self.first.acquire(cancel).await?;
        match self.second.acquire(cancel).await {
            Ok(second_scope) => Ok(LimiterScope::Composite(Box::new(first_scope), Box::new(second_scope))),
            Err(err) => {
                // best-effort release: dropping `first_scope` here releases its permit.
                drop(first_scope);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn semaphore_limiter_conserves_permits() {
        let limiter = SemaphoreLimiter::new(3, 3);
        assert_eq!(limiter.available_count(), 3);
        let scope = limiter.acquire(&token()).await.unwrap();
        assert_eq!(limiter.available_count(), 2);
        drop(scope);
        assert_eq!(limiter.available_count(), 3);
    }

    #[tokio::test]
    async fn cancelled_token_fails_pending_acquire() {
        let limiter = SemaphoreLimiter::new(1, 1);
        let _scope = limiter.acquire(&token()).await.unwrap();
        let cancel = token();
        cancel.cancel();
        let result = limiter.acquire(&cancel).await;
        assert!(matches!(result, Err(LimiterError::Cancelled)));
    }

    #[tokio::test]
    async fn composite_limiter_is_monotone() {
        let a = Arc::new(SemaphoreLimiter::new(5, 5));
        let b = Arc::new(SemaphoreLimiter::new(2, 2));
        let composite = CompositeLimiter::new(a, b);
        assert_eq!(composite.effective_limit(), 2);
        assert_eq!(composite.requested_limit(), 5);
        assert_eq!(composite.available_count(), 2);
    }

    #[tokio::test]
    async fn composite_limiter_releases_first_if_second_fails() {
        let a = Arc::new(SemaphoreLimiter::new(5, 5));
        let b = Arc::new(SemaphoreLimiter::new(1, 1));
        // exhaust `b` up front so the composite's second acquire will fail once cancelled.
        let _hold = b.acquire(&token()).await.unwrap();
        let composite = CompositeLimiter::new(a.clone(), b.clone());
        let cancel = token();
        let acquire = composite.acquire(&cancel);
        tokio::pin!(acquire);
        // cancel shortly after to unblock the stuck second acquire
        cancel.cancel();
        let result = acquire.await;
        assert!(result.is_err());
        assert_eq!(a.available_count(), 5);
    }

    #[tokio::test]
    async fn null_limiter_never_blocks() {
        let limiter = NullLimiter;
        assert_eq!(limiter.effective_limit(), usize::MAX);
        let _scope = limiter.acquire(&token()).await.unwrap();
    }
}
