//! Flowgate - per-target admission control for API gateways
//!
//! Every upstream target served by a gateway instance gets a flow control
//! cache holding a traffic meter, a locally configured limiter and, when the
//! target's budget is shared across the fleet, a limiter whose ceiling is
//! computed by a global counter provider from the traffic of all instances.

pub mod config;
pub mod error;
pub mod flowcontrol;
pub mod remote;

pub use error::{FlowGateError, Result};
pub use flowcontrol::{FlowControl, FlowControlSchema, LimitStrategy, RateLimitItemConfiguration};
pub use remote::{FlowControlCache, GlobalCounterProvider, LocalGlobalCounterProvider};
