use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgate::config::FlowGateConfig;
use flowgate::flowcontrol::{
    DefaultFlowControlFactory, FlowControl, FlowControlDetail, FlowControlSchema,
    RateLimitItemConfiguration,
};
use flowgate::remote::{FlowControlCache, LocalGlobalCounterProvider};

/// Drive synthetic traffic through a flow control cache and report its statistics.
#[derive(Parser, Debug)]
#[command(name = "flowgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Offered requests per second, overriding the configuration
    #[arg(long)]
    rps: Option<u32>,

    /// Run time in seconds, overriding the configuration
    #[arg(long)]
    duration: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Serialize)]
struct Summary {
    cluster: String,
    name: String,
    client_id: String,
    schema: String,
    admitted: u64,
    rejected: u64,
    rate: f64,
    inflight_seconds: f64,
    max_inflight: i32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Flowgate simulator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FlowGateConfig::load(args.config.as_deref())?;
    if let Some(rps) = args.rps {
        config.simulator.requests_per_second = rps;
    }
    if let Some(duration) = args.duration {
        config.simulator.duration_secs = duration;
    }
    let sim = config.simulator.clone();
    info!(
        cluster = %sim.cluster,
        name = %sim.name,
        schema = %sim.schema,
        rps = sim.requests_per_second,
        duration_secs = sim.duration_secs,
        "Configuration loaded"
    );

    let provider = Arc::new(LocalGlobalCounterProvider::new());
    let cache = Arc::new(FlowControlCache::with_config(
        &sim.cluster,
        &sim.name,
        &sim.client_id,
        provider.clone(),
        config.meter.clone(),
        Arc::new(DefaultFlowControlFactory),
    )?);

    cache.local_flow_control().sync(sim.schema.clone());
    if let Some(item) = initial_share(&sim.schema) {
        cache.enable_remote_flow_control();
        if let Some(remote) = cache.flow_control() {
            remote.sync(item);
        }
        info!(registered = ?provider.registered_names(), "Global flow control enabled");
    }

    let counters = Arc::new(Counters::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let reporter = tokio::spawn(report(Arc::clone(&cache), Arc::clone(&counters), stop_rx));

    let run = drive_load(
        Arc::clone(&cache),
        Arc::clone(&counters),
        sim.request_interval(),
        sim.hold_ms,
        Duration::from_secs(sim.duration_secs),
    );

    let outstanding = tokio::select! {
        outstanding = run => outstanding,
        _ = shutdown_signal() => Vec::new(),
    };
    futures::future::join_all(outstanding).await;

    let _ = stop_tx.send(true);
    if let Err(e) = reporter.await {
        warn!(error = %e, "Reporter task failed");
    }

    let summary = Summary {
        cluster: cache.cluster().to_string(),
        name: cache.name().to_string(),
        client_id: cache.client_id().to_string(),
        schema: cache.local_flow_control().describe(),
        admitted: counters.admitted.load(Ordering::Relaxed),
        rejected: counters.rejected.load(Ordering::Relaxed),
        rate: cache.rate(),
        inflight_seconds: cache.inflight(),
        max_inflight: cache.max_inflight(),
    };
    cache.stop();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!("Flowgate simulator stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

/// The whole global ceiling, as the first share of a single-instance fleet.
fn initial_share(schema: &FlowControlSchema) -> Option<RateLimitItemConfiguration> {
    match schema.detail {
        Some(FlowControlDetail::GlobalMaxRequestsInflight { max }) => Some(
            RateLimitItemConfiguration::max_requests_inflight(&schema.name, schema.strategy, max),
        ),
        Some(FlowControlDetail::GlobalTokenBucket { qps }) => Some(
            RateLimitItemConfiguration::token_bucket(&schema.name, schema.strategy, qps, qps),
        ),
        Some(FlowControlDetail::MaxRequestsInflight { .. })
        | Some(FlowControlDetail::TokenBucket { .. })
        | None => None,
    }
}

/// Offer one request per `interval` until `duration` elapses. Returns the
/// handles of requests still holding their admission.
async fn drive_load(
    cache: Arc<FlowControlCache>,
    counters: Arc<Counters>,
    interval: Option<Duration>,
    hold_ms: u64,
    duration: Duration,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    let Some(interval) = interval else {
        tokio::time::sleep(duration).await;
        return handles;
    };

    let deadline = tokio::time::Instant::now() + duration;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        handles.retain(|h: &tokio::task::JoinHandle<()>| !h.is_finished());

        let remote = cache.flow_control();
        let admitted = match &remote {
            Some(remote) => remote.try_acquire(),
            None => cache.local_flow_control().try_acquire(),
        };
        if !admitted {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        counters.admitted.fetch_add(1, Ordering::Relaxed);

        let hold = Duration::from_millis(rand::thread_rng().gen_range(0..=hold_ms));
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            match remote {
                Some(remote) => remote.release(),
                None => cache.local_flow_control().release(),
            }
        }));
    }

    handles
}

async fn report(cache: Arc<FlowControlCache>, counters: Arc<Counters>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!(
                    rate = cache.rate(),
                    inflight_seconds = cache.inflight(),
                    max_inflight = cache.max_inflight(),
                    admitted = counters.admitted.load(Ordering::Relaxed),
                    rejected = counters.rejected.load(Ordering::Relaxed),
                    "Traffic statistics"
                );
            }
            _ = stop.wait_for(|stopped| *stopped) => break,
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
