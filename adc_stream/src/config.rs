use std::{fs, path::{Path, PathBuf}, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::common::*;
use crate::error::{Error, Result};

const RESOLUTIONS: [u8; 4] = [6, 8, 10, 12];

/// Acquisition parameters. Fixed at build/config time, never renegotiated while streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
  /// Target rate of the hardware trigger chain.
  pub sample_rate_hz: u32,
  pub resolution_bits: u8,
  /// Length of each of the two physical buffers, in samples. A block covers half of it.
  pub buffer_samples: usize,
  /// Blocks the handoff queue can hold before new ones are dropped.
  pub queue_capacity: usize,
  /// Input clock of the sampling timer.
  pub timer_clock_hz: u32,
  pub polling: PollingConfig,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      sample_rate_hz: 500_000,
      resolution_bits: 12,
      buffer_samples: 512,
      queue_capacity: 256,
      timer_clock_hz: 84_000_000,
      polling: PollingConfig::default(),
    }
  }
}

/// Parameters of the software polling sampler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
  /// Nominal rate; pacing is coarse and best-effort.
  pub sample_rate_hz: u32,
  /// Samples taken between two pacing calls. `None` paces once per half buffer.
  pub pace_every_samples: Option<usize>,
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self { sample_rate_hz: 20_000, pace_every_samples: None }
  }
}

impl StreamConfig {
  pub fn half_samples(&self) -> usize {
    self.buffer_samples / 2
  }

  /// Mask keeping the configured number of low bits of a conversion result.
  pub fn sample_mask(&self) -> Sample {
    ((1u32 << self.resolution_bits) - 1) as Sample
  }

  pub fn validate(&self) -> Result<()> {
    if !RESOLUTIONS.contains(&self.resolution_bits) {
      return Err(Error::config(format!("unsupported resolution {} bits, expected one of {RESOLUTIONS:?}", self.resolution_bits)));
    }
    if self.buffer_samples == 0 || self.buffer_samples % 2 != 0 {
      return Err(Error::config(format!("buffer_samples must be even and non-zero, got {}", self.buffer_samples)));
    }
    if self.queue_capacity == 0 {
      return Err(Error::config("queue_capacity must be non-zero"));
    }
    if self.sample_rate_hz == 0 || self.polling.sample_rate_hz == 0 {
      return Err(Error::config("sample rates must be non-zero"));
    }
    if self.polling.pace_every_samples == Some(0) {
      return Err(Error::config("polling.pace_every_samples must be non-zero"));
    }
    Ok(())
  }

  /// Timer auto-reload value producing the target rate: `timer_clock / rate - 1`.
  pub fn auto_reload(&self) -> Result<u32> {
    if self.sample_rate_hz == 0 {
      return Err(Error::config("sample rate must be non-zero"));
    }
    let divider = self.timer_clock_hz / self.sample_rate_hz;
    if divider == 0 {
      return Err(Error::config(format!(
        "sample rate {} Hz is above the timer clock {} Hz", self.sample_rate_hz, self.timer_clock_hz
      )));
    }
    Ok(divider - 1)
  }

  /// Rate the timer really produces after integer division of its clock.
  pub fn effective_sample_rate_hz(&self) -> Result<f64> {
    Ok(self.timer_clock_hz as f64 / (self.auto_reload()? as f64 + 1.0))
  }

  /// Samples the polling sampler takes before yielding to its pacer.
  pub fn pace_every_samples(&self) -> usize {
    self.polling.pace_every_samples.unwrap_or(self.half_samples())
  }

  /// Delay inserted by the polling sampler after every `pace_every_samples()` samples.
  pub fn pace_interval(&self) -> Duration {
    let samples = self.pace_every_samples() as u64;
    Duration::from_nanos(samples * 1_000_000_000 / self.polling.sample_rate_hz.max(1) as u64)
  }
}

/// What the persistence consumer does when storage fails mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
  /// Stop acquisition, close the sink and report the error.
  Abort,
  /// Log, discard the failing chunk and keep streaming.
  #[default]
  BestEffort,
}

impl FromStr for FailurePolicy {
  type Err = Error;
  fn from_str(s: &str) -> Result<Self> {
    match s {
      "abort" => Ok(Self::Abort),
      "best-effort" => Ok(Self::BestEffort),
      other => Err(Error::config(format!("unknown failure policy {other:?}, expected abort or best-effort"))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
  /// Target file, relative to the storage root.
  pub path: PathBuf,
  /// Capacity of the write-staging buffer.
  pub staging_bytes: usize,
  /// Bytes written between two durability syncs; 0 disables periodic syncing.
  pub sync_every_bytes: usize,
  pub failure_policy: FailurePolicy,
  /// How long one pull waits before re-checking the stop signal.
  pub poll_interval_ms: u64,
}

impl Default for WriterConfig {
  fn default() -> Self {
    Self {
      path: PathBuf::from("adc_500ksps.bin"),
      staging_bytes: 64 * 1024,
      sync_every_bytes: 256 * 1024,
      failure_policy: FailurePolicy::default(),
      poll_interval_ms: 100,
    }
  }
}

impl WriterConfig {
  pub fn validate(&self) -> Result<()> {
    if self.staging_bytes < SAMPLE_BYTES || self.staging_bytes % SAMPLE_BYTES != 0 {
      return Err(Error::config(format!(
        "staging_bytes must be a non-zero multiple of {SAMPLE_BYTES}, got {}", self.staging_bytes
      )));
    }
    // one flush may cross at most one sync threshold
    if self.sync_every_bytes != 0 && self.staging_bytes > self.sync_every_bytes {
      return Err(Error::config(format!(
        "staging_bytes ({}) must not exceed sync_every_bytes ({})", self.staging_bytes, self.sync_every_bytes
      )));
    }
    if self.poll_interval_ms == 0 {
      return Err(Error::config("poll_interval_ms must be non-zero"));
    }
    Ok(())
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }
}

/// Contents of a TOML configuration file: `[stream]`, `[stream.polling]` and `[writer]` tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  pub stream: StreamConfig,
  pub writer: WriterConfig,
}

impl AppConfig {
  pub fn from_toml_str(content: &str) -> Result<Self> {
    toml::from_str(content).map_err(|e| Error::config(format!("invalid configuration: {e}")))
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
      .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
    let config = Self::from_toml_str(&content)?;
    info!("loaded configuration from {}", path.display());
    Ok(config)
  }
}
