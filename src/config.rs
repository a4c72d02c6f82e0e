//! Configuration management for Flowgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FlowGateError, Result};
use crate::flowcontrol::FlowControlSchema;

/// Environment variable prefix for layered settings.
const ENV_PREFIX: &str = "FLOWGATE";

/// Main configuration for Flowgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGateConfig {
    /// Meter window configuration
    #[serde(default)]
    pub meter: MeterConfig,

    /// Load simulator configuration
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Window sizes of the traffic meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Period of the rate ticker in milliseconds
    #[serde(default = "default_rate_tick_ms")]
    pub rate_tick_ms: u64,

    /// Number of rate samples averaged
    #[serde(default = "default_rate_bucket_len")]
    pub rate_bucket_len: usize,

    /// Width of one in-flight bucket in milliseconds
    #[serde(default = "default_inflight_bucket_ms")]
    pub inflight_bucket_ms: u64,

    /// Number of in-flight buckets in the rolling window
    #[serde(default = "default_inflight_bucket_len")]
    pub inflight_bucket_len: usize,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            rate_tick_ms: default_rate_tick_ms(),
            rate_bucket_len: default_rate_bucket_len(),
            inflight_bucket_ms: default_inflight_bucket_ms(),
            inflight_bucket_len: default_inflight_bucket_len(),
        }
    }
}

fn default_rate_tick_ms() -> u64 {
    1000
}

fn default_rate_bucket_len() -> usize {
    3
}

fn default_inflight_bucket_ms() -> u64 {
    200
}

fn default_inflight_bucket_len() -> usize {
    6
}

impl MeterConfig {
    /// Period of the rate ticker.
    pub fn rate_tick(&self) -> Duration {
        Duration::from_millis(self.rate_tick_ms)
    }

    /// Width of one in-flight bucket.
    pub fn inflight_bucket_duration(&self) -> Duration {
        Duration::from_millis(self.inflight_bucket_ms)
    }

    /// How long the in-flight worker waits for a change before re-reading the counter.
    pub fn inflight_recheck_period(&self) -> Duration {
        self.inflight_bucket_duration() * 2
    }

    /// Reject windows that cannot be measured.
    pub fn validate(&self) -> Result<()> {
        if self.rate_tick_ms == 0 || self.inflight_bucket_ms == 0 {
            return Err(FlowGateError::Config(
                "meter durations must be greater than zero".to_string(),
            ));
        }
        if self.rate_bucket_len == 0 || self.inflight_bucket_len == 0 {
            return Err(FlowGateError::Config(
                "meter bucket counts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Synthetic load driven by the `flowgate` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Cluster of the simulated target
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Resource name of the simulated target
    #[serde(default = "default_name")]
    pub name: String,

    /// Gateway client id; only the suffix after the last `-` is kept
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Schema synced into the local limiter
    #[serde(default = "default_schema")]
    pub schema: FlowControlSchema,

    /// Offered load
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Upper bound of the random time a request holds its admission
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,

    /// How long to run
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            cluster: default_cluster(),
            name: default_name(),
            client_id: default_client_id(),
            schema: default_schema(),
            requests_per_second: default_requests_per_second(),
            hold_ms: default_hold_ms(),
            duration_secs: default_duration_secs(),
        }
    }
}

/// Fastest request pacing the simulator will attempt.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_micros(1);

impl SimulatorConfig {
    /// Time between offered requests, or `None` when no load is offered.
    ///
    /// Never shorter than one microsecond.
    pub fn request_interval(&self) -> Option<Duration> {
        if self.requests_per_second == 0 {
            return None;
        }
        Some((Duration::from_secs(1) / self.requests_per_second).max(MIN_REQUEST_INTERVAL))
    }
}

fn default_cluster() -> String {
    "default".to_string()
}

fn default_name() -> String {
    "simulated".to_string()
}

fn default_client_id() -> String {
    format!("flowgate-{}", uuid::Uuid::new_v4())
}

fn default_schema() -> FlowControlSchema {
    FlowControlSchema::token_bucket(default_name(), 50, 100)
}

fn default_requests_per_second() -> u32 {
    80
}

fn default_hold_ms() -> u64 {
    50
}

fn default_duration_secs() -> u64 {
    10
}

impl FlowGateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FlowGateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FlowGateError::Config(e.to_string()))?;
        config.meter.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file overlaid with
    /// `FLOWGATE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: FlowGateConfig = settings.try_deserialize()?;
        config.meter.validate()?;
        Ok(config)
    }
}
