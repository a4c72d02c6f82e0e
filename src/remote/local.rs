//! Local flow control wrapper.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::flowcontrol::{
    non_negative, FlowControl, FlowControlDetail, FlowControlSchema, FlowControlSchemaType,
};

use super::cache::{CacheContext, RemoteSlot};

/// Owns the limiter this gateway instance enforces for a target.
///
/// `sync` is expected from a single writer; admissions may run concurrently
/// with it and always see either the old or the new limiter, never a partial one.
pub struct LocalFlowControlWrapper {
    ctx: CacheContext,
    remote: RemoteSlot,
    flow_control: RwLock<Option<Arc<dyn FlowControl>>>,
}

impl LocalFlowControlWrapper {
    pub(crate) fn new(ctx: CacheContext, remote: RemoteSlot) -> Self {
        Self {
            ctx,
            remote,
            flow_control: RwLock::new(None),
        }
    }

    /// The last synced schema.
    pub fn config(&self) -> FlowControlSchema {
        self.ctx.local_config()
    }

    /// Reconcile the local limiter with `schema`.
    pub fn sync(&self, schema: FlowControlSchema) {
        if *self.ctx.local_config.read() == schema {
            return;
        }
        *self.ctx.local_config.write() = schema.clone();

        let new_type = schema.schema_type();
        let current = self.current();
        match current {
            Some(fc) if fc.flow_control_type() == new_type => {
                if resize_to_schema(fc.as_ref(), &schema) {
                    debug!(
                        cluster = %self.ctx.cluster,
                        schema = %fc.describe(),
                        "Resized local flow control"
                    );
                }
            }
            _ => {
                let fc = self.ctx.new_meter_flow_control(&schema);
                info!(
                    cluster = %self.ctx.cluster,
                    schema = %fc.describe(),
                    client_id = %self.ctx.client_id,
                    "Built local flow control"
                );
                *self.flow_control.write() = Some(fc);
            }
        }

        if !schema.enables_global_flow_control() {
            self.remote.disable();
        }
    }

    fn current(&self) -> Option<Arc<dyn FlowControl>> {
        self.flow_control.read().clone()
    }
}

/// Apply the schema's limits to a limiter of the same type.
fn resize_to_schema(fc: &dyn FlowControl, schema: &FlowControlSchema) -> bool {
    match schema.detail {
        Some(FlowControlDetail::MaxRequestsInflight { max }) => fc.resize(non_negative(max), 0),
        Some(FlowControlDetail::TokenBucket { qps, burst }) => {
            fc.resize(non_negative(qps), non_negative(burst))
        }
        // Global ceilings are read from the schema by the remote wrapper.
        Some(FlowControlDetail::GlobalMaxRequestsInflight { .. })
        | Some(FlowControlDetail::GlobalTokenBucket { .. })
        | None => false,
    }
}

/// Requests pass through unlimited until a schema has been synced.
impl FlowControl for LocalFlowControlWrapper {
    fn try_acquire(&self) -> bool {
        self.current().map_or(true, |fc| fc.try_acquire())
    }

    fn release(&self) {
        if let Some(fc) = self.current() {
            fc.release();
        }
    }

    fn resize(&self, primary: u32, secondary: u32) -> bool {
        self.current()
            .map_or(false, |fc| fc.resize(primary, secondary))
    }

    fn flow_control_type(&self) -> FlowControlSchemaType {
        self.current()
            .map_or(FlowControlSchemaType::Unknown, |fc| fc.flow_control_type())
    }

    fn describe(&self) -> String {
        self.current()
            .map_or_else(|| "unconfigured".to_string(), |fc| fc.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowcontrol::LimitStrategy;
    use crate::remote::test_util::{counting_cache, CountingFactory};
    use crate::remote::GlobalCounterFlowControl;

    #[tokio::test]
    async fn test_unconfigured_admits() {
        let (cache, _factory, _provider) = counting_cache();
        let local = cache.local_flow_control();

        assert!(local.try_acquire());
        local.release();
        assert_eq!(local.flow_control_type(), FlowControlSchemaType::Unknown);
        assert_eq!(local.describe(), "unconfigured");
    }

    #[tokio::test]
    async fn test_identical_sync_is_noop() {
        let (cache, factory, _provider) = counting_cache();
        let local = cache.local_flow_control();
        let schema = FlowControlSchema::token_bucket("list-pods", 10, 20);

        local.sync(schema.clone());
        local.sync(schema.clone());
        local.sync(schema);

        assert_eq!(factory.builds(), 1);
        assert_eq!(factory.resizes(), 0);
    }

    #[tokio::test]
    async fn test_same_type_resizes_in_place() {
        let (cache, factory, _provider) = counting_cache();
        let local = cache.local_flow_control();

        local.sync(FlowControlSchema::max_requests_inflight("list-pods", 1));
        assert!(local.try_acquire());
        assert!(!local.try_acquire());

        local.sync(FlowControlSchema::max_requests_inflight("list-pods", 2));
        assert_eq!(factory.builds(), 1);
        assert_eq!(factory.resizes(), 1);

        // The permit taken before the resize is still held
        assert!(local.try_acquire());
        assert!(!local.try_acquire());
    }

    #[tokio::test]
    async fn test_type_change_rebuilds() {
        let (cache, factory, _provider) = counting_cache();
        let local = cache.local_flow_control();

        local.sync(FlowControlSchema::max_requests_inflight("list-pods", 1));
        assert!(local.try_acquire());
        assert!(!local.try_acquire());

        local.sync(FlowControlSchema::token_bucket("list-pods", 100, 100));
        assert_eq!(factory.builds(), 2);
        assert_eq!(local.flow_control_type(), FlowControlSchemaType::TokenBucket);
        // The fresh bucket knows nothing about the old ceiling
        for _ in 0..5 {
            assert!(local.try_acquire());
        }
        assert_eq!(local.config(), FlowControlSchema::token_bucket("list-pods", 100, 100));
    }

    #[tokio::test]
    async fn test_name_change_with_same_type_resizes() {
        let (cache, factory, _provider) = counting_cache();
        let local = cache.local_flow_control();

        local.sync(FlowControlSchema::token_bucket("a", 10, 10));
        local.sync(FlowControlSchema::token_bucket("b", 10, 10));

        assert_eq!(factory.builds(), 1);
        assert_eq!(local.config().name, "b");
    }

    #[tokio::test]
    async fn test_global_schema_keeps_remote() {
        let (cache, _factory, _provider) = counting_cache();
        let local = cache.local_flow_control();

        local.sync(FlowControlSchema::global_token_bucket(
            "list-pods",
            LimitStrategy::GlobalCountLimit,
            100,
        ));
        cache.enable_remote_flow_control();

        local.sync(FlowControlSchema::global_token_bucket(
            "list-pods",
            LimitStrategy::GlobalCountLimit,
            200,
        ));
        assert!(cache.flow_control().is_some());
        assert_eq!(local.flow_control_type(), FlowControlSchemaType::GlobalTokenBucket);
    }

    #[tokio::test]
    async fn test_global_teardown() {
        let (cache, _factory, provider) = counting_cache();
        let local = cache.local_flow_control();

        local.sync(FlowControlSchema::global_token_bucket(
            "list-pods",
            LimitStrategy::GlobalCountLimit,
            100,
        ));
        cache.enable_remote_flow_control();
        let remote = cache.flow_control().unwrap();
        remote.sync(crate::flowcontrol::RateLimitItemConfiguration::token_bucket(
            "list-pods",
            LimitStrategy::GlobalCountLimit,
            50,
            50,
        ));
        assert!(provider.is_registered("list-pods"));
        assert_eq!(remote.current_token(), 50);

        local.sync(FlowControlSchema::token_bucket("list-pods", 10, 10));
        assert!(cache.flow_control().is_none());
        assert!(remote.is_done());
        assert!(!provider.is_registered("list-pods"));
        assert!(provider.registered_names().is_empty());

        cache.enable_remote_flow_control();
        let fresh = cache.flow_control().unwrap();
        assert!(!Arc::ptr_eq(&remote, &fresh));
        assert_eq!(fresh.expect_token(), -1);
        assert_eq!(fresh.current_token(), -1);
        assert!(!fresh.set_limit(&crate::remote::AcquireResult::default()));
    }

    #[test]
    fn test_counting_factory_starts_empty() {
        let factory = CountingFactory::default();
        assert_eq!(factory.builds(), 0);
        assert_eq!(factory.resizes(), 0);
    }
}
