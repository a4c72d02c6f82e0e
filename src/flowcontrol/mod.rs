//! Primitive admission limiters and their configuration objects.

mod inflight;
mod schema;
mod token_bucket;

use std::sync::Arc;

pub use inflight::MaxInflightFlowControl;
pub use schema::{
    FlowControlDetail, FlowControlSchema, FlowControlSchemaType, LimitItemDetail, LimitStrategy,
    RateLimitItemConfiguration,
};
pub(crate) use schema::non_negative;
pub use token_bucket::TokenBucketFlowControl;

/// Trait for admission limiter implementations.
///
/// Implementations must be safe to call concurrently from the request path
/// and must keep their accumulated state (tokens, live permits) when resized.
pub trait FlowControl: Send + Sync {
    /// Try to admit one request without blocking.
    fn try_acquire(&self) -> bool;

    /// Release a request previously admitted by `try_acquire`.
    fn release(&self);

    /// Change the limits in place. The meaning of `primary` and `secondary`
    /// depends on the type: `(max, _)` for concurrency limiters, `(qps, burst)`
    /// for token buckets. Returns whether anything changed.
    fn resize(&self, primary: u32, secondary: u32) -> bool;

    /// The limiter type.
    fn flow_control_type(&self) -> FlowControlSchemaType;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// Builds primitive limiters from schemas.
pub trait FlowControlFactory: Send + Sync {
    /// Build a fresh limiter for the schema's populated detail.
    fn build(&self, schema: &FlowControlSchema) -> Arc<dyn FlowControl>;
}

/// The factory used unless another one is injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFlowControlFactory;

impl FlowControlFactory for DefaultFlowControlFactory {
    fn build(&self, schema: &FlowControlSchema) -> Arc<dyn FlowControl> {
        match schema.detail {
            Some(FlowControlDetail::MaxRequestsInflight { max }) => {
                Arc::new(MaxInflightFlowControl::new(non_negative(max)))
            }
            Some(FlowControlDetail::TokenBucket { qps, burst }) => {
                Arc::new(TokenBucketFlowControl::new(non_negative(qps), non_negative(burst)))
            }
            // Global ceilings are enforced by the remote limiter; locally they pass through.
            Some(FlowControlDetail::GlobalMaxRequestsInflight { .. })
            | Some(FlowControlDetail::GlobalTokenBucket { .. })
            | None => Arc::new(UnlimitedFlowControl::new(schema.schema_type())),
        }
    }
}

/// A limiter that admits every request.
///
/// It remembers the type it was built for so that a schema whose local
/// enforcement is pass-through keeps comparing equal across syncs.
#[derive(Debug, Clone, Copy)]
pub struct UnlimitedFlowControl {
    schema_type: FlowControlSchemaType,
}

impl UnlimitedFlowControl {
    /// Create a pass-through limiter reporting the given type.
    pub fn new(schema_type: FlowControlSchemaType) -> Self {
        Self { schema_type }
    }
}

impl FlowControl for UnlimitedFlowControl {
    fn try_acquire(&self) -> bool {
        true
    }

    fn release(&self) {}

    fn resize(&self, _primary: u32, _secondary: u32) -> bool {
        false
    }

    fn flow_control_type(&self) -> FlowControlSchemaType {
        self.schema_type
    }

    fn describe(&self) -> String {
        format!("type={} unlimited", self.schema_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_builds_by_detail() {
        let factory = DefaultFlowControlFactory;

        let fc = factory.build(&FlowControlSchema::max_requests_inflight("a", 2));
        assert_eq!(fc.flow_control_type(), FlowControlSchemaType::MaxRequestsInflight);

        let fc = factory.build(&FlowControlSchema::token_bucket("a", 5, 10));
        assert_eq!(fc.flow_control_type(), FlowControlSchemaType::TokenBucket);

        let fc = factory.build(&FlowControlSchema::unlimited("a"));
        assert_eq!(fc.flow_control_type(), FlowControlSchemaType::Unknown);
        assert!(fc.try_acquire());
    }

    #[test]
    fn test_global_detail_builds_pass_through() {
        let factory = DefaultFlowControlFactory;
        let schema = FlowControlSchema::global_token_bucket("a", LimitStrategy::GlobalCountLimit, 1);
        let fc = factory.build(&schema);

        assert_eq!(fc.flow_control_type(), FlowControlSchemaType::GlobalTokenBucket);
        for _ in 0..100 {
            assert!(fc.try_acquire());
        }
        assert!(!fc.resize(10, 10));
    }
}
