//! Resource limit enforcement for the store connection pool and the audit
//! queue.
//!
//! Uses cooperative checking — callers acquire a [`PoolGuard`] before
//! issuing a store query and the guard releases its slot on drop.

use crate::error::PolicyError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Connection pool admission control. `pool_size` connections are always
/// available; up to `overflow_limit` additional in-flight acquisitions are
/// tolerated before `acquire` fails with `ResourceExhausted`.
#[derive(Clone)]
pub struct PoolLimiter {
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
}

impl PoolLimiter {
    pub fn new(pool_size: u32, overflow_limit: u32) -> Self {
        PoolLimiter {
            in_flight: Arc::new(AtomicUsize::new(0)),
            capacity: (pool_size + overflow_limit) as usize,
        }
    }

    /// Reserves a slot, returning a guard that releases it on drop.
    /// Returns `ResourceExhausted` if the pool (plus overflow) is full.
    pub fn acquire(&self) -> Result<PoolGuard, PolicyError> {
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            if current >= self.capacity {
                return Err(PolicyError::ResourceExhausted {
                    resource: "store connection pool".to_string(),
                });
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(PoolGuard {
                    in_flight: Arc::clone(&self.in_flight),
                });
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

pub struct PoolGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded audit-queue admission: tracks a saturating drop counter rather
/// than refusing work. Audit records are dropped with a counter increment,
/// never blocking a decision.
#[derive(Clone, Default)]
pub struct DropCounter {
    dropped: Arc<AtomicUsize>,
}

impl DropCounter {
    pub fn new() -> Self {
        DropCounter::default()
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_succeeds_within_capacity() {
        let limiter = PoolLimiter::new(2, 0);
        let _a = limiter.acquire().unwrap();
        let _b = limiter.acquire().unwrap();
        assert_eq!(limiter.in_flight(), 2);
    }

    #[test]
    fn acquire_fails_past_capacity() {
        let limiter = PoolLimiter::new(1, 0);
        let _a = limiter.acquire().unwrap();
        assert!(matches!(
            limiter.acquire(),
            Err(PolicyError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn guard_release_frees_a_slot() {
        let limiter = PoolLimiter::new(1, 0);
        {
            let _a = limiter.acquire().unwrap();
            assert_eq!(limiter.in_flight(), 1);
        }
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.acquire().is_ok());
    }

    #[test]
    fn overflow_allows_extra_slots() {
        let limiter = PoolLimiter::new(1, 2);
        let _a = limiter.acquire().unwrap();
        let _b = limiter.acquire().unwrap();
        let _c = limiter.acquire().unwrap();
        assert!(limiter.acquire().is_err());
    }

    #[test]
    fn drop_counter_accumulates() {
        let counter = DropCounter::new();
        counter.record_drop();
        counter.record_drop();
        assert_eq!(counter.dropped(), 2);
    }
}
