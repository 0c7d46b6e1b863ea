//! Building blocks for the process-wide limits
//!
//! Both limits are inert until configured with a non-zero value, so callers can consult
//! them unconditionally.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Caps how many holders may be inside a section at once
pub struct ConcurrencyLimit {
    max: AtomicUsize,
    slots: tokio::sync::Semaphore,
}

impl ConcurrencyLimit {
    pub const fn new() -> Self {
        Self {
            max: AtomicUsize::new(0),
            slots: tokio::sync::Semaphore::const_new(0),
        }
    }

    /// Sets the maximum number of holders, 0 lifts the limit. Lowering the limit only retires
    /// slots that are currently free.
    pub fn configure(&self, max: usize) {
        let previous = self.max.swap(max, Ordering::AcqRel);
        if max > previous {
            self.slots.add_permits(max - previous);
        } else {
            self.slots.forget_permits(previous - max);
        }
    }

    pub fn is_limited(&self) -> bool {
        self.max.load(Ordering::Acquire) > 0
    }

    /// Waits for a free slot; the slot is held until the returned permit is dropped.
    pub async fn enter(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_limited() {
            return None;
        }
        // the semaphore is never closed
        self.slots.acquire().await.ok()
    }
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limit: callers take tokens, a refill task tops the bucket up to capacity every
/// interval.
pub struct TokenBucket {
    capacity: AtomicUsize,
    tokens: tokio::sync::Semaphore,
}

impl TokenBucket {
    pub const fn new() -> Self {
        Self {
            capacity: AtomicUsize::new(0),
            tokens: tokio::sync::Semaphore::const_new(0),
        }
    }

    /// Sets the bucket capacity and fills it, 0 disables the bucket.
    pub fn configure(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
        self.tokens.forget_permits(self.tokens.available_permits());
        self.tokens.add_permits(capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity() > 0
    }

    /// Takes `count` tokens, waiting for refills as needed. Requests larger than the bucket
    /// take a full bucket instead of waiting forever.
    pub async fn take(&self, count: u32) {
        let capacity = self.capacity();
        if capacity == 0 || count == 0 {
            return;
        }
        let bound = u32::try_from(capacity).unwrap_or(u32::MAX);
        if count > bound {
            tracing::debug!("{count} tokens exceed bucket capacity {capacity}, taking a full bucket");
        }
        if let Ok(tokens) = self.tokens.acquire_many(count.min(bound)).await {
            tokens.forget();
        }
    }

    /// Tops the bucket back up to capacity.
    pub fn refill(&self) {
        let capacity = self.capacity();
        let available = self.tokens.available_permits();
        if available < capacity {
            self.tokens.add_permits(capacity - available);
        }
    }

    /// Refills the bucket every `interval`; returns immediately if the bucket is disabled.
    pub async fn run_refill(&self, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.refill();
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unconfigured_limits_never_block() {
        let limit = ConcurrencyLimit::new();
        assert!(!limit.is_limited());
        assert!(limit.enter().await.is_none());
        let bucket = TokenBucket::new();
        for _ in 0..1000 {
            bucket.take(1).await;
        }
        bucket.take(u32::MAX).await;
    }

    #[tokio::test]
    async fn slots_are_released_on_drop() {
        let limit = ConcurrencyLimit::new();
        limit.configure(1);
        let first = limit.enter().await;
        assert!(first.is_some());
        let blocked = tokio::time::timeout(Duration::from_millis(20), limit.enter()).await;
        assert!(blocked.is_err());
        drop(first);
        assert!(limit.enter().await.is_some());
    }

    #[tokio::test]
    async fn raising_the_limit_adds_slots() {
        let limit = ConcurrencyLimit::new();
        limit.configure(1);
        let _first = limit.enter().await;
        limit.configure(2);
        let second = tokio::time::timeout(Duration::from_millis(20), limit.enter()).await;
        assert!(matches!(second, Ok(Some(_))));
        limit.configure(0);
        assert!(limit.enter().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_restores_taken_tokens() {
        let bucket = std::sync::Arc::new(TokenBucket::new());
        bucket.configure(2);
        bucket.take(2).await;
        let refill = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.run_refill(Duration::from_millis(100)).await })
        };
        let start = tokio::time::Instant::now();
        bucket.take(2).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        refill.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_take_waits_for_a_full_bucket() {
        let bucket = std::sync::Arc::new(TokenBucket::new());
        bucket.configure(4);
        bucket.take(1).await;
        let refill = {
            let bucket = bucket.clone();
            tokio::spawn(async move { bucket.run_refill(Duration::from_millis(100)).await })
        };
        let taken = tokio::time::timeout(Duration::from_secs(1), bucket.take(100)).await;
        assert!(taken.is_ok());
        refill.abort();
    }

    #[tokio::test]
    async fn configure_zero_disables_bucket() {
        let bucket = TokenBucket::new();
        bucket.configure(1);
        assert!(bucket.is_enabled());
        bucket.configure(0);
        assert!(!bucket.is_enabled());
        bucket.take(5).await;
        bucket.run_refill(Duration::from_secs(3600)).await;
    }
}
