//! Resilience utilities: retry backoff and bounded-parallelism fan-out.
//!
//! This module provides the patterns that keep the remote KV store from being
//! overwhelmed or hammered while unhealthy:
//!
//! - [`RetryConfig`]: Exponential backoff with jitter for transient failures
//! - [`Bulkhead`]: Semaphore to limit concurrent operations
//! - [`run_with_concurrency`]: Fan a worker over many items, at most N in flight
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use mirror_engine::resilience::run_with_concurrency;
//!
//! let keys = vec!["idx:a".to_string(), "idx:b".to_string(), "idx:c".to_string()];
//! run_with_concurrency(keys, 20, |key| async move {
//!     // delete_key(&key).await;
//!     let _ = key;
//! })
//! .await;
//! # }
//! ```

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for the KV client's local retry behavior.
///
/// Transient remote failures (429/408/5xx/network) are retried up to
/// `max_retries` times with exponential backoff. A `Retry-After` header from
/// the remote store overrides the computed delay when it is larger.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,

    /// Base delay for the exponential schedule (attempt 0 waits this long).
    pub base_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Upper bound for the random jitter added to every computed delay.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(200),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: Duration::from_millis(1),
        }
    }

    /// Calculate the backoff delay for a given attempt number (0-indexed),
    /// without jitter.
    ///
    /// `delay = min(max_delay, base_delay * 2^attempt)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt);
        let delay = self
            .base_delay
            .checked_mul(exp.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }

    /// Backoff delay for an attempt with random jitter applied.
    ///
    /// If the remote store supplied a `Retry-After` duration, the larger of
    /// the two wins - the store knows its own recovery time better than we do.
    pub fn delay_with_jitter(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        let computed = self.delay_for_attempt(attempt) + jitter;
        match retry_after {
            Some(hinted) => std::cmp::max(hinted, computed),
            None => computed,
        }
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Bulkhead pattern: limits concurrent operations to prevent resource exhaustion.
///
/// Uses a semaphore to limit how many operations can run simultaneously.
/// Used to fan out index key writes/deletes without overwhelming the remote
/// store or exhausting local connections.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit (clamped to >= 1).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped. The internal
    /// semaphore is never closed, so acquisition only fails if the bulkhead
    /// is dropped mid-acquire.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// Try to acquire a permit without waiting.
    ///
    /// Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the maximum concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Check if the bulkhead is full (no permits available).
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

/// Run `worker(item)` for every item with at most `limit` in flight.
///
/// `limit` is clamped to >= 1. Completion order is unspecified; the call
/// resolves only once every item has been processed. Workers are expected to
/// handle their own failures (safe operations never propagate), so the worker
/// output is `()`.
pub async fn run_with_concurrency<T, F, Fut>(items: Vec<T>, limit: usize, worker: F)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
{
    if items.is_empty() {
        return;
    }
    let bulkhead = Bulkhead::new(limit);
    let tasks = items.into_iter().map(|item| {
        let bulkhead = &bulkhead;
        let worker = &worker;
        async move {
            let _permit = bulkhead.acquire().await;
            worker(item).await;
        }
    });
    futures::future::join_all(tasks).await;
}
