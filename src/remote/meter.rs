//! Sliding-window traffic meter.
//!
//! The request path only touches two atomics: the count of admissions not yet
//! folded into the rate estimate, and the live in-flight count. Two background
//! tasks fold them into bucketed windows:
//!
//! - the rate ticker divides the admissions seen since the previous tick by the
//!   measured elapsed time and keeps a running average over the last
//!   `rate_bucket_len` ticks;
//! - the in-flight worker receives the latest in-flight value through a
//!   single-slot mailbox and keeps a max-hold per time bucket, a running maximum
//!   over the window and an in-flight-seconds integral over the completed
//!   buckets.
//!
//! Published statistics live in atomics so readers never wait on the bucket lock.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

use crate::config::MeterConfig;
use crate::error::Result;

/// Running average over the last N instantaneous rates.
///
/// Buckets start at zero, so the average climbs to a constant rate over the
/// first N pushes.
#[derive(Debug)]
pub(crate) struct RateWindow {
    buckets: Vec<f64>,
    index: usize,
    avg: f64,
}

impl RateWindow {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            buckets: vec![0.0; len.max(1)],
            index: 0,
            avg: 0.0,
        }
    }

    /// Fold one instantaneous rate into the window and return the new average.
    pub(crate) fn push(&mut self, rate: f64) -> f64 {
        let len = self.buckets.len();
        self.avg += (rate - self.buckets[self.index]) / len as f64;
        self.buckets[self.index] = rate;
        self.index = (self.index + 1) % len;
        self.avg
    }

    #[cfg(test)]
    pub(crate) fn avg(&self) -> f64 {
        self.avg
    }
}

/// Max-hold buckets of in-flight readings over a rolling window.
#[derive(Debug)]
pub(crate) struct InflightWindow {
    buckets: Vec<i32>,
    bucket_millis: u64,
    /// Absolute bucket number of the last reading, `now_millis / bucket_millis`
    last_slot: u64,
    /// In-flight seconds accumulated over the completed buckets in the window
    avg: f64,
    max: i32,
}

impl InflightWindow {
    pub(crate) fn new(len: usize, bucket_millis: u64) -> Self {
        Self {
            buckets: vec![0; len.max(1)],
            bucket_millis: bucket_millis.max(1),
            last_slot: 0,
            avg: 0.0,
            max: 0,
        }
    }

    fn index(&self, slot: u64) -> usize {
        (slot % self.buckets.len() as u64) as usize
    }

    /// Fold an in-flight reading taken at `now_millis` into the window.
    pub(crate) fn observe(&mut self, inflight: i32, now_millis: u64) {
        let slot = now_millis / self.bucket_millis;
        let current = self.index(slot);
        let last = self.index(self.last_slot);

        if slot <= self.last_slot {
            if inflight > self.buckets[last] {
                self.buckets[last] = inflight;
            }
            if inflight > self.max {
                self.max = inflight;
            }
            return;
        }

        let len = self.buckets.len() as u64;
        let gap = slot - self.last_slot;
        let bucket_secs = self.bucket_millis as f64 / 1000.0;

        if gap >= len {
            // The whole window went by without a reading.
            self.buckets.iter_mut().for_each(|b| *b = 0);
            self.avg = 0.0;
        } else {
            // The bucket we are leaving is now complete.
            let mut delta = self.buckets[last] as i64;
            for step in 1..gap {
                let expired = self.index(self.last_slot + step);
                delta -= self.buckets[expired] as i64;
                self.buckets[expired] = 0;
            }
            delta -= self.buckets[current] as i64;
            self.avg += delta as f64 * bucket_secs;
        }

        self.buckets[current] = inflight;
        self.last_slot = slot;
        self.max = self.buckets.iter().copied().max().unwrap_or(0);

        trace!(
            buckets = ?self.buckets,
            index = current,
            max = self.max,
            avg = self.avg,
            "In-flight bucket rolled"
        );
    }

    pub(crate) fn avg(&self) -> f64 {
        self.avg
    }

    pub(crate) fn max(&self) -> i32 {
        self.max
    }
}

#[derive(Debug)]
struct MeterState {
    last_tick: Instant,
    rate: RateWindow,
    inflight: InflightWindow,
}

/// Rate and concurrency estimator shared by every limiter of a target.
#[derive(Debug)]
pub struct Meter {
    cluster: String,
    name: String,
    config: MeterConfig,
    origin: Instant,

    uncounted: AtomicI64,
    inflight: AtomicI32,
    inflight_tx: watch::Sender<i32>,

    state: Mutex<MeterState>,

    rate_avg: AtomicU64,
    inflight_avg: AtomicU64,
    inflight_max: AtomicI32,

    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl Meter {
    /// Create a meter. Background work begins with [`Meter::start`].
    pub fn new(cluster: &str, name: &str, config: MeterConfig) -> Self {
        let now = Instant::now();
        let (inflight_tx, _) = watch::channel(0);
        let (stop_tx, _) = watch::channel(false);
        let state = MeterState {
            last_tick: now,
            rate: RateWindow::new(config.rate_bucket_len),
            inflight: InflightWindow::new(config.inflight_bucket_len, config.inflight_bucket_ms),
        };

        Self {
            cluster: cluster.to_string(),
            name: name.to_string(),
            config,
            origin: now,
            uncounted: AtomicI64::new(0),
            inflight: AtomicI32::new(0),
            inflight_tx,
            state: Mutex::new(state),
            rate_avg: AtomicU64::new(0f64.to_bits()),
            inflight_avg: AtomicU64::new(0f64.to_bits()),
            inflight_max: AtomicI32::new(0),
            stop_tx,
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the rate ticker and the in-flight worker on the current tokio runtime.
    ///
    /// Starting twice is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let meter = Arc::clone(self);
        let stop_rx = self.stop_tx.subscribe();
        handle.spawn(async move { meter.rate_tick(stop_rx).await });

        let meter = Arc::clone(self);
        let stop_rx = self.stop_tx.subscribe();
        let inflight_rx = self.inflight_tx.subscribe();
        handle.spawn(async move { meter.inflight_worker(inflight_rx, stop_rx).await });

        Ok(())
    }

    /// Stop both background tasks.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Count one admitted request.
    pub fn record_admission(&self) {
        self.uncounted.fetch_add(1, Ordering::Relaxed);
    }

    /// Adjust the in-flight count and publish the new value to the worker.
    ///
    /// The mailbox holds one value; a value not yet consumed is overwritten.
    pub fn record_inflight_delta(&self, delta: i32) {
        let inflight = self.inflight.fetch_add(delta, Ordering::AcqRel) + delta;
        self.inflight_tx.send_replace(inflight);
    }

    /// Smoothed request rate in requests per second.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_avg.load(Ordering::Acquire))
    }

    /// In-flight request-seconds accumulated over the completed buckets of the
    /// window: each bucket contributes its peak reading times the bucket length.
    pub fn avg_inflight(&self) -> f64 {
        f64::from_bits(self.inflight_avg.load(Ordering::Acquire))
    }

    /// Highest in-flight reading held in the window.
    pub fn max_inflight(&self) -> i32 {
        self.inflight_max.load(Ordering::Acquire)
    }

    /// Live in-flight count.
    pub fn current_inflight(&self) -> i32 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Admissions not yet folded into the rate.
    #[cfg(test)]
    pub(crate) fn uncounted(&self) -> i64 {
        self.uncounted.load(Ordering::Acquire)
    }

    async fn rate_tick(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let period = self.config.rate_tick();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.calculate_avg_rate(),
                _ = stop_rx.wait_for(|stopped| *stopped) => return,
            }
        }
    }

    fn calculate_avg_rate(&self) {
        let count = self.uncounted.swap(0, Ordering::AcqRel);

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_tick).as_secs_f64();
        state.last_tick = now;
        let instant_rate = if elapsed > 0.0 { count as f64 / elapsed } else { 0.0 };
        let avg = state.rate.push(instant_rate);
        drop(state);

        self.rate_avg.store(avg.to_bits(), Ordering::Release);

        trace!(
            cluster = %self.cluster,
            name = %self.name,
            count = count,
            elapsed = elapsed,
            rate = instant_rate,
            avg = avg,
            "Rate tick"
        );
    }

    async fn inflight_worker(
        self: Arc<Self>,
        mut inflight_rx: watch::Receiver<i32>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let recheck = self.config.inflight_recheck_period();

        loop {
            tokio::select! {
                changed = inflight_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let inflight = *inflight_rx.borrow_and_update();
                    self.observe_inflight(inflight);
                }
                _ = time::sleep(recheck) => self.observe_inflight(self.current_inflight()),
                _ = stop_rx.wait_for(|stopped| *stopped) => return,
            }
        }
    }

    fn observe_inflight(&self, inflight: i32) {
        let now_millis = self.origin.elapsed().as_millis() as u64;

        let mut state = self.state.lock();
        state.inflight.observe(inflight, now_millis);
        let avg = state.inflight.avg();
        let max = state.inflight.max();
        drop(state);

        self.inflight_avg.store(avg.to_bits(), Ordering::Release);
        self.inflight_max.store(max, Ordering::Release);
    }
}
