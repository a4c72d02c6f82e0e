//! Concurrency ceiling limiter.

use std::sync::atomic::{AtomicU32, Ordering};

use super::{FlowControl, FlowControlSchemaType};

/// Admits a request while fewer than `max` requests are in flight.
///
/// Lock-free: admission is a compare-and-swap on the live permit count.
#[derive(Debug)]
pub struct MaxInflightFlowControl {
    /// Requests currently holding a permit
    inflight: AtomicU32,
    /// The ceiling
    max: AtomicU32,
}

impl MaxInflightFlowControl {
    /// Create a limiter with the given ceiling.
    pub fn new(max: u32) -> Self {
        Self {
            inflight: AtomicU32::new(0),
            max: AtomicU32::new(max),
        }
    }

    /// Requests currently holding a permit.
    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Acquire)
    }

    /// The current ceiling.
    pub fn max(&self) -> u32 {
        self.max.load(Ordering::Acquire)
    }
}

impl FlowControl for MaxInflightFlowControl {
    fn try_acquire(&self) -> bool {
        let max = self.max.load(Ordering::Acquire);
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    fn resize(&self, max: u32, _secondary: u32) -> bool {
        self.max.swap(max, Ordering::AcqRel) != max
    }

    fn flow_control_type(&self) -> FlowControlSchemaType {
        FlowControlSchemaType::MaxRequestsInflight
    }

    fn describe(&self) -> String {
        format!(
            "type={} max={} inflight={}",
            self.flow_control_type(),
            self.max(),
            self.inflight()
        )
    }
}
