//! Per-target flow control cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::MeterConfig;
use crate::error::Result;
use crate::flowcontrol::{
    DefaultFlowControlFactory, FlowControl, FlowControlFactory, FlowControlSchema, LimitStrategy,
};

use super::counter::GlobalCounterProvider;
use super::global::RemoteFlowControlWrapper;
use super::local::LocalFlowControlWrapper;
use super::meter::Meter;
use super::metered::MeteredFlowControl;

/// State shared by the cache and both of its wrappers.
#[derive(Clone)]
pub(crate) struct CacheContext {
    pub(crate) cluster: Arc<str>,
    pub(crate) name: Arc<str>,
    pub(crate) client_id: Arc<str>,
    pub(crate) meter: Arc<Meter>,
    pub(crate) global_counter: Arc<dyn GlobalCounterProvider>,
    pub(crate) factory: Arc<dyn FlowControlFactory>,
    /// Last schema synced into the local wrapper
    pub(crate) local_config: Arc<RwLock<FlowControlSchema>>,
}

impl CacheContext {
    /// Build a primitive for `schema` and route its traffic through the shared meter.
    pub(crate) fn new_meter_flow_control(&self, schema: &FlowControlSchema) -> Arc<dyn FlowControl> {
        let inner = self.factory.build(schema);
        Arc::new(MeteredFlowControl::new(inner, Arc::clone(&self.meter)))
    }

    pub(crate) fn local_config(&self) -> FlowControlSchema {
        self.local_config.read().clone()
    }
}

/// Holder of the lazily created remote wrapper.
///
/// `enable` and `disable` are the only ways to change what it holds, and
/// `disable` signals the wrapper it removes, so a wrapper is signalled at
/// most once.
#[derive(Clone, Default)]
pub(crate) struct RemoteSlot {
    inner: Arc<RwLock<Option<Arc<RemoteFlowControlWrapper>>>>,
}

impl RemoteSlot {
    pub(crate) fn get(&self) -> Option<Arc<RemoteFlowControlWrapper>> {
        self.inner.read().clone()
    }

    pub(crate) fn enable(&self, ctx: &CacheContext) {
        let mut slot = self.inner.write();
        if slot.is_none() {
            *slot = Some(Arc::new(RemoteFlowControlWrapper::new(ctx.clone())));
            info!(
                cluster = %ctx.cluster,
                name = %ctx.name,
                client_id = %ctx.client_id,
                "Enabled remote flow control"
            );
        }
    }

    pub(crate) fn disable(&self) {
        let removed = self.inner.write().take();
        if let Some(remote) = removed {
            remote.stop();
            debug!(config = ?remote.config(), "Disabled remote flow control");
        }
    }
}

/// Admission control state of one (cluster, resource) target.
///
/// Owns the traffic meter, the local limiter and, while global coordination is
/// configured, the remote limiter. Must be created inside a tokio runtime: the
/// meter runs two background tasks until [`FlowControlCache::stop`] is called
/// or the cache is dropped.
pub struct FlowControlCache {
    ctx: CacheContext,
    local: LocalFlowControlWrapper,
    remote: RemoteSlot,
    stopped: AtomicBool,
}

impl FlowControlCache {
    /// Create a cache with the default meter windows and limiter factory.
    ///
    /// Only the part of `client_id` after its last `-` is kept.
    pub fn new(
        cluster: &str,
        name: &str,
        client_id: &str,
        global_counter: Arc<dyn GlobalCounterProvider>,
    ) -> Result<Self> {
        Self::with_config(
            cluster,
            name,
            client_id,
            global_counter,
            MeterConfig::default(),
            Arc::new(DefaultFlowControlFactory),
        )
    }

    /// Create a cache with explicit meter windows and limiter factory.
    pub fn with_config(
        cluster: &str,
        name: &str,
        client_id: &str,
        global_counter: Arc<dyn GlobalCounterProvider>,
        meter_config: MeterConfig,
        factory: Arc<dyn FlowControlFactory>,
    ) -> Result<Self> {
        meter_config.validate()?;

        let meter = Arc::new(Meter::new(cluster, name, meter_config));
        meter.start()?;

        let ctx = CacheContext {
            cluster: Arc::from(cluster),
            name: Arc::from(name),
            client_id: Arc::from(client_id_suffix(client_id)),
            meter,
            global_counter,
            factory,
            local_config: Arc::new(RwLock::new(FlowControlSchema::default())),
        };
        let remote = RemoteSlot::default();
        let local = LocalFlowControlWrapper::new(ctx.clone(), remote.clone());

        Ok(Self {
            ctx,
            local,
            remote,
            stopped: AtomicBool::new(false),
        })
    }

    /// The remote wrapper, if global flow control is enabled.
    pub fn flow_control(&self) -> Option<Arc<RemoteFlowControlWrapper>> {
        self.remote.get()
    }

    /// Create the remote wrapper if it does not exist yet.
    pub fn enable_remote_flow_control(&self) {
        self.remote.enable(&self.ctx);
    }

    /// The local wrapper.
    pub fn local_flow_control(&self) -> &LocalFlowControlWrapper {
        &self.local
    }

    /// Strategy of the current local schema.
    pub fn strategy(&self) -> LimitStrategy {
        self.ctx.local_config.read().strategy
    }

    /// Smoothed request rate in requests per second.
    pub fn rate(&self) -> f64 {
        self.ctx.meter.rate()
    }

    /// In-flight request-seconds over the completed buckets of the meter window.
    pub fn inflight(&self) -> f64 {
        self.ctx.meter.avg_inflight()
    }

    /// Peak in-flight requests over the meter window.
    pub fn max_inflight(&self) -> i32 {
        self.ctx.meter.max_inflight()
    }

    pub fn cluster(&self) -> &str {
        &self.ctx.cluster
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn client_id(&self) -> &str {
        &self.ctx.client_id
    }

    /// Stop the meter and signal the remote wrapper. Later calls do nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.meter.stop();
        self.remote.disable();
        debug!(cluster = %self.ctx.cluster, name = %self.ctx.name, "Stopped flow control cache");
    }
}

impl Drop for FlowControlCache {
    fn drop(&mut self) {
        self.stop();
    }
}

fn client_id_suffix(client_id: &str) -> &str {
    client_id.rsplit('-').next().unwrap_or(client_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowcontrol::FlowControlSchemaType;
    use crate::remote::LocalGlobalCounterProvider;
    use crate::remote::counter::GlobalCounterFlowControl;
    use std::time::Duration;

    fn new_cache() -> FlowControlCache {
        FlowControlCache::new(
            "cluster-a",
            "list-pods",
            "gateway-7f9c-x2k4",
            Arc::new(LocalGlobalCounterProvider::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_client_id_suffix() {
        assert_eq!(client_id_suffix("gateway-7f9c-x2k4"), "x2k4");
        assert_eq!(client_id_suffix("plain"), "plain");
        assert_eq!(client_id_suffix("trailing-"), "");
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = FlowControlCache::new(
            "c",
            "n",
            "id",
            Arc::new(LocalGlobalCounterProvider::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cache_identity_and_defaults() {
        let cache = new_cache();

        assert_eq!(cache.cluster(), "cluster-a");
        assert_eq!(cache.name(), "list-pods");
        assert_eq!(cache.client_id(), "x2k4");
        assert_eq!(cache.strategy(), LimitStrategy::Unlimited);
        assert_eq!(cache.rate(), 0.0);
        assert_eq!(cache.max_inflight(), 0);
        assert!(cache.flow_control().is_none());
    }

    #[tokio::test]
    async fn test_enable_remote_is_idempotent() {
        let cache = new_cache();

        cache.enable_remote_flow_control();
        let first = cache.flow_control().unwrap();
        cache.enable_remote_flow_control();
        let second = cache.flow_control().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.expect_token(), -1);
        assert_eq!(first.current_token(), -1);
    }

    #[tokio::test]
    async fn test_stop_signals_remote() {
        let cache = new_cache();
        cache.enable_remote_flow_control();
        let remote = cache.flow_control().unwrap();
        let mut done = tokio_test::task::spawn(remote.stopped());

        tokio_test::assert_pending!(done.poll());
        cache.stop();
        tokio_test::assert_ready!(done.poll());

        assert!(cache.flow_control().is_none());
        // A second stop finds nothing left to signal
        cache.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_scenario() {
        let cache = new_cache();
        let local = cache.local_flow_control();
        local.sync(FlowControlSchema::token_bucket("list-pods", 5, 10));
        assert_eq!(local.flow_control_type(), FlowControlSchemaType::TokenBucket);
        assert_eq!(cache.strategy(), LimitStrategy::TokenBucket);

        // Five admissions a second, sustained over the three rate buckets
        for _ in 0..3 {
            for _ in 0..5 {
                assert!(local.try_acquire());
                local.release();
            }
            tokio::time::sleep(Duration::from_millis(1001)).await;
        }
        assert!((cache.rate() - 5.0).abs() < 0.1, "rate was {}", cache.rate());

        // One second refilled what was used, so the full burst is available again
        let mut admitted = 0;
        while local.try_acquire() {
            admitted += 1;
            assert!(admitted <= 10, "burst should be exhausted");
        }
        assert_eq!(admitted, 10);
        assert!(!local.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_span_local_and_remote() {
        let cache = new_cache();
        cache
            .local_flow_control()
            .sync(FlowControlSchema::global_max_requests_inflight(
                "list-pods",
                LimitStrategy::GlobalAllocateLimit,
                10,
            ));
        cache.enable_remote_flow_control();
        let remote = cache.flow_control().unwrap();
        remote.sync(crate::flowcontrol::RateLimitItemConfiguration::max_requests_inflight(
            "list-pods",
            LimitStrategy::GlobalAllocateLimit,
            4,
        ));

        assert!(cache.local_flow_control().try_acquire());
        assert!(remote.try_acquire());
        assert!(remote.try_acquire());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.max_inflight(), 3);

        // First of three rate buckets
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!((cache.rate() - 1.0).abs() < 0.1, "rate was {}", cache.rate());
    }
}
