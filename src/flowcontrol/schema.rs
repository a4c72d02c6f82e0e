//! Flow control configuration objects pushed by the control plane.
//!
//! A [`FlowControlSchema`] configures the limiter a single gateway instance
//! enforces for a target. A [`RateLimitItemConfiguration`] carries the budget
//! a coordination service has assigned to this instance for the cluster-wide
//! limiter of the same target.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a target is limited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitStrategy {
    /// No limit applies.
    #[default]
    Unlimited,
    /// Bound the number of concurrent requests.
    MaxRequestsInflight,
    /// Refilling token bucket.
    TokenBucket,
    /// A cluster-wide budget is split between instances by the coordination service.
    GlobalAllocateLimit,
    /// Admissions are counted cluster-wide through the global counter provider.
    GlobalCountLimit,
}

impl LimitStrategy {
    /// Whether this strategy is coordinated across gateway instances.
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            LimitStrategy::GlobalAllocateLimit | LimitStrategy::GlobalCountLimit
        )
    }
}

impl fmt::Display for LimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The limiter type implied by the populated detail of a configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowControlSchemaType {
    /// No detail was populated.
    #[default]
    Unknown,
    MaxRequestsInflight,
    TokenBucket,
    GlobalMaxRequestsInflight,
    GlobalTokenBucket,
}

impl fmt::Display for FlowControlSchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Limiter parameters of a local schema. Exactly one variant is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowControlDetail {
    /// Per-instance concurrency ceiling.
    MaxRequestsInflight { max: i32 },
    /// Per-instance token bucket.
    TokenBucket { qps: i32, burst: i32 },
    /// Cluster-wide concurrency ceiling.
    GlobalMaxRequestsInflight { max: i32 },
    /// Cluster-wide request rate.
    GlobalTokenBucket { qps: i32 },
}

impl FlowControlDetail {
    /// The limiter type this detail describes.
    pub fn schema_type(&self) -> FlowControlSchemaType {
        match self {
            FlowControlDetail::MaxRequestsInflight { .. } => FlowControlSchemaType::MaxRequestsInflight,
            FlowControlDetail::TokenBucket { .. } => FlowControlSchemaType::TokenBucket,
            FlowControlDetail::GlobalMaxRequestsInflight { .. } => {
                FlowControlSchemaType::GlobalMaxRequestsInflight
            }
            FlowControlDetail::GlobalTokenBucket { .. } => FlowControlSchemaType::GlobalTokenBucket,
        }
    }
}

/// Local flow control configuration for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowControlSchema {
    /// Name of the schema
    #[serde(default)]
    pub name: String,
    /// Declared strategy
    #[serde(default)]
    pub strategy: LimitStrategy,
    /// Limiter parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<FlowControlDetail>,
}

impl FlowControlSchema {
    /// A schema that admits everything.
    pub fn unlimited(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: LimitStrategy::Unlimited,
            detail: None,
        }
    }

    /// A per-instance concurrency ceiling.
    pub fn max_requests_inflight(name: impl Into<String>, max: i32) -> Self {
        Self {
            name: name.into(),
            strategy: LimitStrategy::MaxRequestsInflight,
            detail: Some(FlowControlDetail::MaxRequestsInflight { max }),
        }
    }

    /// A per-instance token bucket.
    pub fn token_bucket(name: impl Into<String>, qps: i32, burst: i32) -> Self {
        Self {
            name: name.into(),
            strategy: LimitStrategy::TokenBucket,
            detail: Some(FlowControlDetail::TokenBucket { qps, burst }),
        }
    }

    /// A cluster-wide concurrency ceiling under the given global strategy.
    pub fn global_max_requests_inflight(
        name: impl Into<String>,
        strategy: LimitStrategy,
        max: i32,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            detail: Some(FlowControlDetail::GlobalMaxRequestsInflight { max }),
        }
    }

    /// A cluster-wide request rate under the given global strategy.
    pub fn global_token_bucket(name: impl Into<String>, strategy: LimitStrategy, qps: i32) -> Self {
        Self {
            name: name.into(),
            strategy,
            detail: Some(FlowControlDetail::GlobalTokenBucket { qps }),
        }
    }

    /// The limiter type implied by the populated detail.
    pub fn schema_type(&self) -> FlowControlSchemaType {
        self.detail
            .as_ref()
            .map_or(FlowControlSchemaType::Unknown, FlowControlDetail::schema_type)
    }

    /// Whether this schema requires a cluster-wide limiter.
    pub fn enables_global_flow_control(&self) -> bool {
        self.strategy.is_global()
            && matches!(
                self.detail,
                Some(FlowControlDetail::GlobalTokenBucket { .. })
                    | Some(FlowControlDetail::GlobalMaxRequestsInflight { .. })
            )
    }

    /// The configured cluster-wide concurrency ceiling, if any.
    pub fn global_max_requests_inflight_limit(&self) -> Option<i32> {
        match self.detail {
            Some(FlowControlDetail::GlobalMaxRequestsInflight { max }) => Some(max),
            _ => None,
        }
    }

    /// The configured cluster-wide QPS ceiling, if any.
    pub fn global_token_bucket_qps(&self) -> Option<i32> {
        match self.detail {
            Some(FlowControlDetail::GlobalTokenBucket { qps }) => Some(qps),
            _ => None,
        }
    }
}

impl fmt::Display for FlowControlSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name={} strategy={}", self.name, self.strategy)?;
        match self.detail {
            Some(FlowControlDetail::MaxRequestsInflight { max }) => write!(f, " max={}", max),
            Some(FlowControlDetail::TokenBucket { qps, burst }) => {
                write!(f, " qps={} burst={}", qps, burst)
            }
            Some(FlowControlDetail::GlobalMaxRequestsInflight { max }) => {
                write!(f, " global_max={}", max)
            }
            Some(FlowControlDetail::GlobalTokenBucket { qps }) => write!(f, " global_qps={}", qps),
            None => Ok(()),
        }
    }
}

/// Limiter parameters of a remote item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LimitItemDetail {
    MaxRequestsInflight { max: i32 },
    TokenBucket { qps: i32, burst: i32 },
}

impl LimitItemDetail {
    /// The limiter type this detail describes.
    pub fn schema_type(&self) -> FlowControlSchemaType {
        match self {
            LimitItemDetail::MaxRequestsInflight { .. } => FlowControlSchemaType::MaxRequestsInflight,
            LimitItemDetail::TokenBucket { .. } => FlowControlSchemaType::TokenBucket,
        }
    }
}

/// Globally coordinated budget for one target, as pushed to this instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitItemConfiguration {
    /// Registration name with the global counter provider
    #[serde(default)]
    pub name: String,
    /// Declared strategy
    #[serde(default)]
    pub strategy: LimitStrategy,
    /// Limiter parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<LimitItemDetail>,
}

impl RateLimitItemConfiguration {
    /// A concurrency budget.
    pub fn max_requests_inflight(name: impl Into<String>, strategy: LimitStrategy, max: i32) -> Self {
        Self {
            name: name.into(),
            strategy,
            detail: Some(LimitItemDetail::MaxRequestsInflight { max }),
        }
    }

    /// A rate budget.
    pub fn token_bucket(
        name: impl Into<String>,
        strategy: LimitStrategy,
        qps: i32,
        burst: i32,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            detail: Some(LimitItemDetail::TokenBucket { qps, burst }),
        }
    }

    /// The limiter type implied by the populated detail.
    pub fn schema_type(&self) -> FlowControlSchemaType {
        self.detail
            .as_ref()
            .map_or(FlowControlSchemaType::Unknown, LimitItemDetail::schema_type)
    }

    /// The local-style schema used to build the primitive for this item.
    pub fn to_flow_control_schema(&self) -> FlowControlSchema {
        let detail = self.detail.map(|detail| match detail {
            LimitItemDetail::MaxRequestsInflight { max } => {
                FlowControlDetail::MaxRequestsInflight { max }
            }
            LimitItemDetail::TokenBucket { qps, burst } => FlowControlDetail::TokenBucket { qps, burst },
        });
        FlowControlSchema {
            name: self.name.clone(),
            strategy: self.strategy,
            detail,
        }
    }
}

/// Convert a configured limit to the unsigned form primitives take.
pub(crate) fn non_negative(value: i32) -> u32 {
    value.max(0) as u32
}
