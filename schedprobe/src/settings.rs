use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment};
use log::debug;
use serde::Deserialize;

use crate::probes::Sample;

const DEFAULT_OVERSLEEP_THRESHOLD_US: u64 = 10;
const DEFAULT_BUFFERED_SEND_THRESHOLD_US: u64 = 10;
const DEFAULT_PING_PONG_THRESHOLD_US: u64 = 10;
const DEFAULT_CHAIN_THRESHOLD_US: u64 = 100;

const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SLEEP_MS: u64 = 50;
const DEFAULT_CHAIN_LENGTH: usize = 20;
const DEFAULT_HISTORY_SIZE: usize = 100;
const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;

/// Per-dimension threshold configuration, in microseconds.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ThresholdSettings {
    pub oversleep_us: Option<u64>,
    pub buffered_send_us: Option<u64>,
    pub ping_pong_us: Option<u64>,
    pub chain_us: Option<u64>,
}

/// Sampling loop configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SamplingSettings {
    pub interval_ms: Option<u64>,
    pub sleep_ms: Option<u64>,
    pub chain_length: Option<usize>,
    pub history_size: Option<usize>,
    /// Only used by the daemon binary.
    pub check_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub thresholds: ThresholdSettings,
    #[serde(default)]
    pub sampling: SamplingSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn thresholds(&self) -> Thresholds {
        let t = &self.thresholds;
        Thresholds {
            oversleep: micros_or(t.oversleep_us, DEFAULT_OVERSLEEP_THRESHOLD_US),
            buffered_send: micros_or(t.buffered_send_us, DEFAULT_BUFFERED_SEND_THRESHOLD_US),
            ping_pong: micros_or(t.ping_pong_us, DEFAULT_PING_PONG_THRESHOLD_US),
            chain: micros_or(t.chain_us, DEFAULT_CHAIN_THRESHOLD_US),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(
            self.sampling
                .check_interval_secs
                .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS),
        )
    }

    /// Builds a validated [`MonitorConfig`], filling unset values with defaults.
    pub fn to_monitor_config(&self) -> Result<MonitorConfig> {
        let s = &self.sampling;
        let config = MonitorConfig {
            thresholds: self.thresholds(),
            sample_interval: Duration::from_millis(
                s.interval_ms.unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
            ),
            sleep: Duration::from_millis(s.sleep_ms.unwrap_or(DEFAULT_SLEEP_MS)),
            chain_length: s.chain_length.unwrap_or(DEFAULT_CHAIN_LENGTH),
            history_size: s.history_size.unwrap_or(DEFAULT_HISTORY_SIZE),
        };
        config.validate()?;
        Ok(config)
    }
}

fn micros_or(value: Option<u64>, default: u64) -> Duration {
    Duration::from_micros(value.unwrap_or(default))
}

/// Limits a sample is compared against. A sample is over threshold when any
/// of its durations is strictly greater than the matching limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub oversleep: Duration,
    pub buffered_send: Duration,
    pub ping_pong: Duration,
    pub chain: Duration,
}

impl Thresholds {
    /// Same limit for every dimension.
    pub fn uniform(limit: Duration) -> Self {
        Self {
            oversleep: limit,
            buffered_send: limit,
            ping_pong: limit,
            chain: limit,
        }
    }

    pub fn exceeded_by(&self, sample: &Sample) -> bool {
        sample.oversleep > self.oversleep
            || sample.buffered_send > self.buffered_send
            || sample.ping_pong > self.ping_pong
            || sample.chain > self.chain
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            oversleep: Duration::from_micros(DEFAULT_OVERSLEEP_THRESHOLD_US),
            buffered_send: Duration::from_micros(DEFAULT_BUFFERED_SEND_THRESHOLD_US),
            ping_pong: Duration::from_micros(DEFAULT_PING_PONG_THRESHOLD_US),
            chain: Duration::from_micros(DEFAULT_CHAIN_THRESHOLD_US),
        }
    }
}

/// Everything the sampling loop needs, fixed before the loop starts.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub thresholds: Thresholds,
    /// Spacing between the starts of consecutive probe passes.
    pub sample_interval: Duration,
    /// Requested sleep of the oversleep probe.
    pub sleep: Duration,
    /// Number of relay tasks in the chain probe.
    pub chain_length: usize,
    pub history_size: usize,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.sample_interval > self.sleep,
            "sample interval ({:?}) must be longer than the probe sleep ({:?})",
            self.sample_interval,
            self.sleep
        );
        ensure!(self.chain_length >= 1, "chain length must be at least 1");
        ensure!(self.history_size >= 1, "history size must be at least 1");
        Ok(())
    }

    /// Ticker period: the interval minus the sleep every pass starts with.
    pub(crate) fn tick_period(&self) -> Duration {
        self.sample_interval.saturating_sub(self.sleep)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
            sleep: Duration::from_millis(DEFAULT_SLEEP_MS),
            chain_length: DEFAULT_CHAIN_LENGTH,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}
