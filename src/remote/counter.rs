//! Contracts with the global counter provider and the counter-aware limiter.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::flowcontrol::{
    non_negative, FlowControl, FlowControlSchemaType, LimitItemDetail, LimitStrategy,
    RateLimitItemConfiguration,
};

/// Limit computed by the coordination service and pushed to one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireResult {
    /// Registration name the result is for
    pub name: String,
    /// Granted limit: max in-flight or QPS depending on the limiter type
    pub limit: i32,
    /// Set when the coordination service could not compute a limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A limiter the coordination layer can query and steer.
pub trait GlobalCounterFlowControl: FlowControl {
    /// Tokens this instance asked for since the last pushed limit, or `-1`
    /// when no global accounting is active.
    fn expect_token(&self) -> i32;

    /// Limit currently applied, or `-1` when no global accounting is active.
    fn current_token(&self) -> i32;

    /// Apply a pushed limit. Returns `false` when it was not applied.
    fn set_limit(&self, result: &AcquireResult) -> bool;
}

/// Per-target counter handed out by the provider.
pub trait GlobalCounter: Send + Sync {
    /// Report admissions upward.
    fn count(&self, hits: i32);
}

/// Aggregates per-target counts across gateway instances.
///
/// Registration and removal of different names may happen concurrently;
/// calls for the same name come from a single writer.
pub trait GlobalCounterProvider: Send + Sync {
    /// Register `owner` under `name` and return the counter it reports to.
    fn add(
        &self,
        name: &str,
        schema_type: FlowControlSchemaType,
        owner: Weak<dyn GlobalCounterFlowControl>,
    ) -> Arc<dyn GlobalCounter>;

    /// Withdraw the registration for `name`, if any.
    fn stop(&self, name: &str);
}

/// The counter-aware limiter held by the remote wrapper.
pub struct FlowControlCounter {
    name: String,
    strategy: LimitStrategy,
    /// Burst applied whenever a pushed QPS limit resizes a token bucket
    burst: u32,
    flow_control: Arc<dyn FlowControl>,
    counter: Option<Arc<dyn GlobalCounter>>,
    expected: AtomicI32,
    current: AtomicI32,
}

impl FlowControlCounter {
    /// Wrap `flow_control`, which must already be metered, for `item`.
    ///
    /// `counter` is present only when the item is counted cluster-wide.
    pub fn new(
        item: &RateLimitItemConfiguration,
        flow_control: Arc<dyn FlowControl>,
        counter: Option<Arc<dyn GlobalCounter>>,
    ) -> Self {
        let (current, burst) = match item.detail {
            Some(LimitItemDetail::MaxRequestsInflight { max }) => (max, 0),
            Some(LimitItemDetail::TokenBucket { qps, burst }) => (qps, non_negative(burst)),
            None => (-1, 0),
        };

        Self {
            name: item.name.clone(),
            strategy: item.strategy,
            burst,
            flow_control,
            counter,
            expected: AtomicI32::new(0),
            current: AtomicI32::new(current),
        }
    }

    /// Whether admissions are reported to a global counter.
    pub fn is_counted(&self) -> bool {
        self.counter.is_some()
    }
}

impl FlowControl for FlowControlCounter {
    fn try_acquire(&self) -> bool {
        self.expected.fetch_add(1, Ordering::Relaxed);
        let admitted = self.flow_control.try_acquire();
        if admitted {
            if let Some(counter) = &self.counter {
                counter.count(1);
            }
        }
        admitted
    }

    fn release(&self) {
        self.flow_control.release();
    }

    fn resize(&self, primary: u32, secondary: u32) -> bool {
        // Both limiter types take their headline limit as `primary`.
        self.current
            .store(i32::try_from(primary).unwrap_or(i32::MAX), Ordering::Release);
        self.flow_control.resize(primary, secondary)
    }

    fn flow_control_type(&self) -> FlowControlSchemaType {
        self.flow_control.flow_control_type()
    }

    fn describe(&self) -> String {
        format!(
            "name={} strategy={} counted={} {}",
            self.name,
            self.strategy,
            self.is_counted(),
            self.flow_control.describe()
        )
    }
}

impl GlobalCounterFlowControl for FlowControlCounter {
    fn expect_token(&self) -> i32 {
        self.expected.load(Ordering::Acquire)
    }

    fn current_token(&self) -> i32 {
        self.current.load(Ordering::Acquire)
    }

    fn set_limit(&self, result: &AcquireResult) -> bool {
        if let Some(error) = &result.error {
            debug!(name = %self.name, error = %error, "Ignoring failed limit result");
            return false;
        }
        if result.limit < 0 {
            return false;
        }

        let limit = non_negative(result.limit);
        match self.flow_control_type() {
            FlowControlSchemaType::MaxRequestsInflight => {
                self.flow_control.resize(limit, 0);
            }
            FlowControlSchemaType::TokenBucket => {
                self.flow_control.resize(limit, self.burst);
            }
            FlowControlSchemaType::Unknown
            | FlowControlSchemaType::GlobalMaxRequestsInflight
            | FlowControlSchemaType::GlobalTokenBucket => return false,
        }

        self.current.store(result.limit, Ordering::Release);
        self.expected.store(0, Ordering::Release);
        debug!(name = %self.name, limit = result.limit, "Applied pushed limit");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowcontrol::{MaxInflightFlowControl, TokenBucketFlowControl};
    use std::sync::atomic::AtomicI64;

    #[derive(Default)]
    struct SumCounter(AtomicI64);

    impl GlobalCounter for SumCounter {
        fn count(&self, hits: i32) {
            self.0.fetch_add(hits as i64, Ordering::Relaxed);
        }
    }

    fn inflight_item(max: i32) -> RateLimitItemConfiguration {
        RateLimitItemConfiguration::max_requests_inflight("item", LimitStrategy::GlobalCountLimit, max)
    }

    #[test]
    fn test_counts_admissions_upward() {
        let sum = Arc::new(SumCounter::default());
        let fc = FlowControlCounter::new(
            &inflight_item(2),
            Arc::new(MaxInflightFlowControl::new(2)),
            Some(sum.clone() as Arc<dyn GlobalCounter>),
        );

        assert!(fc.try_acquire());
        assert!(fc.try_acquire());
        assert!(!fc.try_acquire());

        assert_eq!(sum.0.load(Ordering::Relaxed), 2);
        assert_eq!(fc.expect_token(), 3);
        assert_eq!(fc.current_token(), 2);
        assert!(fc.is_counted());
    }

    #[test]
    fn test_set_limit_resizes_and_resets_expectation() {
        let fc = FlowControlCounter::new(
            &inflight_item(1),
            Arc::new(MaxInflightFlowControl::new(1)),
            None,
        );
        assert!(fc.try_acquire());
        assert!(!fc.try_acquire());

        let result = AcquireResult {
            name: "item".to_string(),
            limit: 3,
            error: None,
        };
        assert!(fc.set_limit(&result));
        assert_eq!(fc.current_token(), 3);
        assert_eq!(fc.expect_token(), 0);
        assert!(fc.try_acquire());
    }

    #[test]
    fn test_set_limit_rejects_failed_results() {
        let fc = FlowControlCounter::new(
            &inflight_item(1),
            Arc::new(MaxInflightFlowControl::new(1)),
            None,
        );

        let failed = AcquireResult {
            name: "item".to_string(),
            limit: 10,
            error: Some("no quota".to_string()),
        };
        assert!(!fc.set_limit(&failed));

        let negative = AcquireResult {
            name: "item".to_string(),
            limit: -1,
            error: None,
        };
        assert!(!fc.set_limit(&negative));
        assert_eq!(fc.current_token(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_limit_keeps_configured_burst() {
        let item = RateLimitItemConfiguration::token_bucket("item", LimitStrategy::GlobalAllocateLimit, 10, 4);
        let bucket = Arc::new(TokenBucketFlowControl::new(10, 4));
        let fc = FlowControlCounter::new(&item, bucket.clone(), None);

        let result = AcquireResult {
            name: "item".to_string(),
            limit: 30,
            error: None,
        };
        assert!(fc.set_limit(&result));
        assert_eq!(bucket.limits(), (30, 4));
        assert_eq!(fc.current_token(), 30);
    }
}
