//! Request deadline enforcement and cooperative cancellation.
//!
//! Cooperative cancellation via an atomic flag plus a `tokio::time::timeout`
//! wrapper for the actual suspension points (cache miss fetch, candidate-rule
//! fetch, predicate execution, external-id resolution). On cancellation the
//! runner yields without emitting an audit entry — callers check
//! [`RequestDeadline::is_cancelled`] before enqueuing the audit record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PolicyError;

/// Per-request deadline controller. Cloning shares the same cancellation
/// flag, so every task spawned for a `req_access` item observes the same
/// cancellation.
#[derive(Clone)]
pub struct RequestDeadline {
    cancelled: Arc<AtomicBool>,
    start_time: Instant,
    deadline: Duration,
}

impl RequestDeadline {
    pub fn new(deadline: Duration) -> Self {
        RequestDeadline {
            cancelled: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
            deadline,
        }
    }

    /// Cooperative check: call before or between suspension points.
    pub fn check(&self) -> Result<(), PolicyError> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(self.timeout_error());
        }
        if self.start_time.elapsed() > self.deadline {
            self.cancelled.store(true, Ordering::Relaxed);
            return Err(self.timeout_error());
        }
        Ok(())
    }

    /// Runs `fut` with the remaining time on this deadline as a hard cap.
    /// Propagates cancellation to the outstanding future by simply
    /// dropping it at the `tokio::time::timeout` boundary, so cancellation
    /// reaches outstanding store queries too.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, PolicyError>
    where
        F: std::future::Future<Output = T>,
    {
        self.check()?;
        let remaining = self.remaining();
        match tokio::time::timeout(remaining, fut).await {
            Ok(value) => Ok(value),
            Err(_) => {
                self.cancelled.store(true, Ordering::Relaxed);
                Err(self.timeout_error())
            }
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.start_time.elapsed())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    fn timeout_error(&self) -> PolicyError {
        PolicyError::Timeout {
            deadline_ms: self.deadline.as_millis() as u64,
        }
    }
}

/// A handle that can cancel the associated request's deadline from
/// another task, e.g. when a caller aborts the surrounding HTTP request.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
