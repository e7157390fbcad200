use std::sync::atomic::{AtomicU32, Ordering};

/// Consecutive routed-dial failure counter.
///
/// Saturates at the threshold. Once it is reached the TCP path also races a
/// forced direct dial; the next routed success drops it back to zero.
#[derive(Debug)]
pub struct Breaker {
    failures: AtomicU32,
    threshold: u32,
}

impl Breaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn record_failure(&self) {
        let _ = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.threshold).then_some(n + 1)
            });
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// Direct probing is required.
    pub fn is_open(&self) -> bool {
        self.failures.load(Ordering::Acquire) >= self.threshold
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }
}
