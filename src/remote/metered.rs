//! Limiter decorator feeding the traffic meter.

use std::sync::Arc;

use crate::flowcontrol::{FlowControl, FlowControlSchemaType};

use super::meter::Meter;

/// Wraps a primitive limiter so admissions and releases update the [`Meter`].
///
/// Built fresh every time the primitive is rebuilt; the meter outlives it.
pub struct MeteredFlowControl {
    inner: Arc<dyn FlowControl>,
    meter: Arc<Meter>,
}

impl MeteredFlowControl {
    /// Decorate `inner` with metering into `meter`.
    pub fn new(inner: Arc<dyn FlowControl>, meter: Arc<Meter>) -> Self {
        Self { inner, meter }
    }
}

impl FlowControl for MeteredFlowControl {
    fn try_acquire(&self) -> bool {
        let admitted = self.inner.try_acquire();
        if admitted {
            self.meter.record_inflight_delta(1);
            self.meter.record_admission();
        }
        admitted
    }

    fn release(&self) {
        self.meter.record_inflight_delta(-1);
        self.inner.release();
    }

    fn resize(&self, primary: u32, secondary: u32) -> bool {
        self.inner.resize(primary, secondary)
    }

    fn flow_control_type(&self) -> FlowControlSchemaType {
        self.inner.flow_control_type()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}
