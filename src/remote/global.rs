//! Remote (cluster-wide) flow control wrapper.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::flowcontrol::{
    non_negative, FlowControl, FlowControlSchemaType, LimitItemDetail, LimitStrategy,
    RateLimitItemConfiguration,
};

use super::cache::CacheContext;
use super::counter::{AcquireResult, FlowControlCounter, GlobalCounterFlowControl};

/// Owns the limiter enforcing this instance's share of a cluster-wide budget.
///
/// Created by [`FlowControlCache::enable_remote_flow_control`] and discarded
/// once the local schema no longer asks for global coordination; [`done`]
/// fires at that point so registration loops can unwind.
///
/// [`FlowControlCache::enable_remote_flow_control`]: super::FlowControlCache::enable_remote_flow_control
/// [`done`]: RemoteFlowControlWrapper::done
pub struct RemoteFlowControlWrapper {
    ctx: CacheContext,
    flow_control: RwLock<Option<Arc<FlowControlCounter>>>,
    config: RwLock<RateLimitItemConfiguration>,
    done_tx: watch::Sender<bool>,
}

impl RemoteFlowControlWrapper {
    pub(crate) fn new(ctx: CacheContext) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            ctx,
            flow_control: RwLock::new(None),
            config: RwLock::new(RateLimitItemConfiguration::default()),
            done_tx,
        }
    }

    /// The last synced item.
    pub fn config(&self) -> RateLimitItemConfiguration {
        self.config.read().clone()
    }

    /// Lifecycle signal; the value turns `true` once the wrapper is torn down.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Resolves once the wrapper is torn down.
    pub async fn stopped(&self) {
        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Whether the wrapper has been torn down.
    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Withdraw the provider registration, if any, and fire the done signal.
    pub(crate) fn stop(&self) {
        let config = self.config();
        if config.strategy == LimitStrategy::GlobalCountLimit && !config.name.is_empty() {
            self.ctx.global_counter.stop(&config.name);
        }
        self.done_tx.send_replace(true);
    }

    /// Reconcile the cluster-wide limiter with `item`.
    ///
    /// Limits resized in place never exceed the global ceiling of the local
    /// schema. The stored item is replaced on every path.
    pub fn sync(self: &Arc<Self>, item: RateLimitItemConfiguration) {
        if *self.config.read() == item {
            return;
        }

        let new_type = item.schema_type();
        let previous = self.config();
        trace!(cluster = %self.ctx.cluster, name = %item.name, "Syncing remote flow control");

        let current = self.current();
        match current {
            Some(fc) if fc.flow_control_type() == new_type && previous.strategy == item.strategy => {
                if !self.resize_clamped(&fc, &item) {
                    self.rebuild(&previous, &item, new_type);
                }
            }
            _ => self.rebuild(&previous, &item, new_type),
        }

        *self.config.write() = item;
    }

    /// Resize `fc` for `item`, clamped to the local ceiling. Returns `false`
    /// when the item's detail does not match the limiter type.
    fn resize_clamped(&self, fc: &FlowControlCounter, item: &RateLimitItemConfiguration) -> bool {
        let local = self.ctx.local_config();
        match (item.detail, fc.flow_control_type()) {
            (
                Some(LimitItemDetail::MaxRequestsInflight { max }),
                FlowControlSchemaType::MaxRequestsInflight,
            ) => {
                let max = clamp(max, local.global_max_requests_inflight_limit());
                fc.resize(non_negative(max), 0);
                debug!(
                    cluster = %self.ctx.cluster,
                    schema = %fc.describe(),
                    inflight = self.ctx.meter.avg_inflight(),
                    client_id = %self.ctx.client_id,
                    "Resized remote flow control"
                );
                true
            }
            (Some(LimitItemDetail::TokenBucket { qps, burst }), FlowControlSchemaType::TokenBucket) => {
                let qps = clamp(qps, local.global_token_bucket_qps());
                fc.resize(non_negative(qps), non_negative(burst));
                debug!(
                    cluster = %self.ctx.cluster,
                    schema = %fc.describe(),
                    rate = self.ctx.meter.rate(),
                    client_id = %self.ctx.client_id,
                    "Resized remote flow control"
                );
                true
            }
            _ => false,
        }
    }

    fn rebuild(
        self: &Arc<Self>,
        previous: &RateLimitItemConfiguration,
        item: &RateLimitItemConfiguration,
        new_type: FlowControlSchemaType,
    ) {
        if !previous.name.is_empty() && previous.name != item.name {
            self.ctx.global_counter.stop(&previous.name);
        }
        self.ctx.global_counter.stop(&item.name);

        let fc = self.ctx.new_meter_flow_control(&item.to_flow_control_schema());

        let counter = match item.strategy {
            LimitStrategy::GlobalCountLimit => {
                let weak: Weak<Self> = Arc::downgrade(self);
                let owner: Weak<dyn GlobalCounterFlowControl> = weak;
                Some(self.ctx.global_counter.add(&item.name, new_type, owner))
            }
            LimitStrategy::Unlimited
            | LimitStrategy::MaxRequestsInflight
            | LimitStrategy::TokenBucket
            | LimitStrategy::GlobalAllocateLimit => None,
        };

        let fc = Arc::new(FlowControlCounter::new(item, fc, counter));
        info!(
            cluster = %self.ctx.cluster,
            schema = %fc.describe(),
            "Built remote flow control"
        );
        *self.flow_control.write() = Some(fc);
    }

    fn current(&self) -> Option<Arc<FlowControlCounter>> {
        self.flow_control.read().clone()
    }
}

/// The lower of the requested value and the locally configured ceiling.
fn clamp(requested: i32, ceiling: Option<i32>) -> i32 {
    ceiling.map_or(requested, |ceiling| requested.min(ceiling))
}

/// Requests pass through unlimited until an item has been synced.
impl FlowControl for RemoteFlowControlWrapper {
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

impl GlobalCounterFlowControl for RemoteFlowControlWrapper {
    fn expect_token(&self) -> i32 {
        self.current().map_or(-1, |fc| fc.expect_token())
    }

    fn current_token(&self) -> i32 {
        self.current().map_or(-1, |fc| fc.current_token())
    }

    fn set_limit(&self, result: &AcquireResult) -> bool {
        self.current().map_or(false, |fc| fc.set_limit(result))
    }
}
