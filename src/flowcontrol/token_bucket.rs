//! Token bucket limiter.

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{FlowControl, FlowControlSchemaType};

/// Refills `qps` tokens per second up to `burst` and admits one request per token.
///
/// The bucket starts full. Resizing keeps the tokens already accumulated.
#[derive(Debug)]
pub struct TokenBucketFlowControl {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    qps: u32,
    burst: u32,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn capacity(&self) -> f64 {
        capacity(self.qps, self.burst)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps as f64).min(self.capacity());
        self.last_refill = now;
    }
}

/// A zero burst falls back to one second worth of tokens.
fn capacity(qps: u32, burst: u32) -> f64 {
    if burst == 0 {
        qps as f64
    } else {
        burst as f64
    }
}

impl TokenBucketFlowControl {
    /// Create a full bucket.
    pub fn new(qps: u32, burst: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                qps,
                burst,
                tokens: capacity(qps, burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Tokens available right now.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill();
        state.tokens
    }

    /// Current `(qps, burst)`.
    pub fn limits(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.qps, state.burst)
    }
}

impl FlowControl for TokenBucketFlowControl {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        state.refill();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn release(&self) {}

    fn resize(&self, qps: u32, burst: u32) -> bool {
        let mut state = self.state.lock();
        if state.qps == qps && state.burst == burst {
            return false;
        }
        // Settle tokens earned at the old rate before switching.
        state.refill();
        state.qps = qps;
        state.burst = burst;
        state.tokens = state.tokens.min(state.capacity());
        true
    }

    fn flow_control_type(&self) -> FlowControlSchemaType {
        FlowControlSchemaType::TokenBucket
    }

    fn describe(&self) -> String {
        let (qps, burst) = self.limits();
        format!("type={} qps={} burst={}", self.flow_control_type(), qps, burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_reject() {
        let fc = TokenBucketFlowControl::new(5, 10);

        for i in 0..10 {
            assert!(fc.try_acquire(), "Request {} should be admitted", i);
        }
        assert!(!fc.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time() {
        let fc = TokenBucketFlowControl::new(5, 10);
        for _ in 0..10 {
            fc.try_acquire();
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(fc.try_acquire());
        assert!(fc.try_acquire());
        assert!(!fc.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_preserves_tokens() {
        let fc = TokenBucketFlowControl::new(10, 10);
        for _ in 0..4 {
            assert!(fc.try_acquire());
        }

        assert!(fc.resize(20, 10));
        assert!((fc.available_tokens() - 6.0).abs() < 1e-9);
        assert_eq!(fc.limits(), (20, 10));

        // The new rate applies from the resize onwards
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!((fc.available_tokens() - 8.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_clamps_to_smaller_burst() {
        let fc = TokenBucketFlowControl::new(10, 10);
        assert!(fc.resize(10, 3));
        assert!((fc.available_tokens() - 3.0).abs() < 1e-9);
        assert!(!fc.resize(10, 3));
    }

    #[test]
    fn test_zero_burst_uses_qps() {
        let fc = TokenBucketFlowControl::new(4, 0);
        assert_eq!(fc.available_tokens().floor(), 4.0);
    }
}
