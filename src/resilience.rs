//! Restart backoff and fetch concurrency limits.
//!
//! - [`RetryConfig`]: delay curve between attempts of a failed replication
//! - [`Bulkhead`]: caps concurrent `get_revs` calls against the source
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), doc_replicator::resilience::BulkheadFull> {
//! use doc_replicator::resilience::{Bulkhead, RetryConfig};
//!
//! let retry = RetryConfig::daemon();
//! assert!(retry.allows(1_000));
//!
//! let bulkhead = Bulkhead::for_doc_fetch();
//! let _permit = bulkhead.acquire().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Exponential delay curve for restarting a replication.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Consecutive restarts before the task gives up. `usize::MAX` = never.
    pub max_attempts: usize,
    /// Delay before the first restart.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Long-running replications restart forever.
    ///
    /// ```text
    /// restart  delay
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9        256s
    /// 10+      5m
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Millisecond delays and a bounded number of restarts.
    pub fn testing() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Delay before restart number `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    /// Whether restart number `attempt` may happen.
    pub fn allows(&self, attempt: usize) -> bool {
        attempt <= self.max_attempts
    }
}

/// The bulkhead's semaphore was closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed (limit {limit})")]
pub struct BulkheadFull {
    pub limit: usize,
}

/// Shared concurrency cap. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Bulkhead {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Eight revision fetches at a time.
    pub fn for_doc_fetch() -> Self {
        Self::new(8)
    }

    /// Wait for a slot. The slot frees when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull { limit: self.limit })
    }

    pub fn max_concurrent(&self) -> usize {
        self.limit
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
