//! Instrumented factory and provider for wrapper tests.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::config::MeterConfig;
use crate::flowcontrol::{
    DefaultFlowControlFactory, FlowControl, FlowControlFactory, FlowControlSchema,
    FlowControlSchemaType,
};

use super::cache::FlowControlCache;
use super::counter::{GlobalCounter, GlobalCounterFlowControl, GlobalCounterProvider};
use super::provider::LocalGlobalCounterProvider;

/// Counts limiter constructions and in-place resizes.
#[derive(Default)]
pub(crate) struct CountingFactory {
    builds: AtomicUsize,
    resizes: Arc<AtomicUsize>,
}

impl CountingFactory {
    pub(crate) fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub(crate) fn resizes(&self) -> usize {
        self.resizes.load(Ordering::SeqCst)
    }
}

impl FlowControlFactory for CountingFactory {
    fn build(&self, schema: &FlowControlSchema) -> Arc<dyn FlowControl> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Arc::new(CountingFlowControl {
            inner: DefaultFlowControlFactory.build(schema),
            resizes: Arc::clone(&self.resizes),
        })
    }
}

struct CountingFlowControl {
    inner: Arc<dyn FlowControl>,
    resizes: Arc<AtomicUsize>,
}

impl FlowControl for CountingFlowControl {
    fn try_acquire(&self) -> bool {
        self.inner.try_acquire()
    }

    fn release(&self) {
        self.inner.release()
    }

    fn resize(&self, primary: u32, secondary: u32) -> bool {
        self.resizes.fetch_add(1, Ordering::SeqCst);
        self.inner.resize(primary, secondary)
    }

    fn flow_control_type(&self) -> FlowControlSchemaType {
        self.inner.flow_control_type()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// Counts registrations on top of the in-process provider.
#[derive(Default)]
pub(crate) struct RecordingProvider {
    inner: LocalGlobalCounterProvider,
    adds: AtomicUsize,
}

impl RecordingProvider {
    pub(crate) fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }
}

impl Deref for RecordingProvider {
    type Target = LocalGlobalCounterProvider;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl GlobalCounterProvider for RecordingProvider {
    fn add(
        &self,
        name: &str,
        schema_type: FlowControlSchemaType,
        owner: Weak<dyn GlobalCounterFlowControl>,
    ) -> Arc<dyn GlobalCounter> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.inner.add(name, schema_type, owner)
    }

    fn stop(&self, name: &str) {
        self.inner.stop(name)
    }
}

/// A cache wired to a counting factory and a recording provider.
///
/// Must be called inside a tokio runtime.
pub(crate) fn counting_cache() -> (FlowControlCache, Arc<CountingFactory>, Arc<RecordingProvider>) {
    let factory = Arc::new(CountingFactory::default());
    let provider = Arc::new(RecordingProvider::default());
    let cache = FlowControlCache::with_config(
        "cluster-a",
        "list-pods",
        "gateway-7f9c-x2k4",
        provider.clone(),
        MeterConfig::default(),
        factory.clone(),
    )
    .unwrap();
    (cache, factory, provider)
}
