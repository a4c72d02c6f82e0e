//! Per-target admission control with optional cluster-wide coordination.
//!
//! A [`FlowControlCache`] is created for each (cluster, resource) target the
//! gateway serves. It owns a [`Meter`] that every admitted request passes
//! through, a [`LocalFlowControlWrapper`] enforcing the limiter configured for
//! this instance and, while the local schema asks for global coordination, a
//! [`RemoteFlowControlWrapper`] whose limit is steered through a
//! [`GlobalCounterProvider`].

mod cache;
mod counter;
mod global;
mod local;
mod meter;
mod metered;
mod provider;

#[cfg(test)]
pub(crate) mod test_util;

pub use cache::FlowControlCache;
pub use counter::{
    AcquireResult, FlowControlCounter, GlobalCounter, GlobalCounterFlowControl,
    GlobalCounterProvider,
};
pub use global::RemoteFlowControlWrapper;
pub use local::LocalFlowControlWrapper;
pub use meter::Meter;
pub use metered::MeteredFlowControl;
pub use provider::{AtomicGlobalCounter, LocalGlobalCounterProvider};
