//! # Configuration
//!
//! Explicit, read-only configuration handed to [`crate::Pipeline::new`]. Every knob has a
//! default; partial JSON documents are accepted and missing fields fall back to defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

/// Data acquisition knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
  /// Assets requested per batch call.
  pub chunk_size: usize,
  /// Deadline for one batch call.
  pub chunk_timeout_ms: u64,
  /// Deadline for one per-asset fallback call.
  pub single_timeout_ms: u64,
  /// Upper bound on concurrent per-asset fallback calls.
  pub max_fallback_workers: usize,
  /// Prices above this are treated as corrupt.
  pub price_ceiling: f64,
}

impl Default for AcquisitionConfig {
  fn default() -> Self {
    Self {
      chunk_size: 50,
      chunk_timeout_ms: 20_000,
      single_timeout_ms: 5_000,
      max_fallback_workers: 32,
      price_ceiling: 1e8,
    }
  }
}

impl AcquisitionConfig {
  pub fn chunk_timeout(&self) -> Duration {
    Duration::from_millis(self.chunk_timeout_ms)
  }

  pub fn single_timeout(&self) -> Duration {
    Duration::from_millis(self.single_timeout_ms)
  }
}

/// Autoregressive rung of the ensemble.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoregressiveConfig {
  pub min_history: usize,
  pub max_order: usize,
  pub min_volatility: f64,
  pub default_return: f64,
  pub default_volatility: f64,
}

impl Default for AutoregressiveConfig {
  fn default() -> Self {
    Self {
      min_history: 30,
      max_order: 3,
      min_volatility: 0.01,
      default_return: 0.05,
      default_volatility: 0.15,
    }
  }
}

/// Recurrent (LSTM) rung of the ensemble.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrentConfig {
  pub enabled: bool,
  pub layers: usize,
  pub units: usize,
  pub dropout: f32,
  pub epochs: usize,
  pub batch_size: usize,
  pub learning_rate: f64,
  /// Upper bound on the sliding window; the effective window is `min(max_window, n/3)`.
  pub max_window: usize,
  pub min_history: usize,
  pub min_sequences: usize,
  pub seed: u64,
  /// Symmetric clip on the annualized log-return vote.
  pub clip: f64,
}

impl Default for RecurrentConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      layers: 2,
      units: 32,
      dropout: 0.2,
      epochs: 20,
      batch_size: 32,
      learning_rate: 1e-3,
      max_window: 60,
      min_history: 100,
      min_sequences: 20,
      seed: 42,
      clip: 0.69,
    }
  }
}

/// Gradient-boosted tree rung of the ensemble.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostedConfig {
  pub enabled: bool,
  pub n_estimators: usize,
  pub max_depth: usize,
  pub learning_rate: f64,
  pub min_history: usize,
  pub min_valid_rows: usize,
  pub min_samples_leaf: usize,
  pub clip: f64,
}

impl Default for BoostedConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      n_estimators: 100,
      max_depth: 5,
      learning_rate: 0.1,
      min_history: 100,
      min_valid_rows: 50,
      min_samples_leaf: 1,
      clip: 0.69,
    }
  }
}

/// Lightweight fallback estimator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LightweightConfig {
  /// Exponential smoothing factor.
  pub alpha: f64,
  pub smoothing_window: usize,
  pub trend_window: usize,
  pub min_history: usize,
  /// Daily volatility above which the historical-mean leg is penalized.
  pub vol_threshold: f64,
  pub vol_penalty: f64,
  /// Weights of (smoothing, trend, historical mean).
  pub weights: (f64, f64, f64),
  pub clip: (f64, f64),
  pub neutral: f64,
  pub uncertainty: f64,
}

impl Default for LightweightConfig {
  fn default() -> Self {
    Self {
      alpha: 0.3,
      smoothing_window: 30,
      trend_window: 90,
      min_history: 10,
      vol_threshold: 0.05,
      vol_penalty: 0.8,
      weights: (0.4, 0.3, 0.3),
      clip: (-0.5, 1.0),
      neutral: 0.05,
      uncertainty: 0.05,
    }
  }
}

/// Forecasting stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
  /// Forecast horizon in trading periods.
  pub horizon: usize,
  pub ensemble_enabled: bool,
  /// Below this many valid prices the lightweight estimator is used instead of the ensemble.
  pub ensemble_min_history: usize,
  pub neutral_return: f64,
  pub neutral_uncertainty: f64,
  /// Uncertainty reported when fewer than two models voted.
  pub single_vote_uncertainty: f64,
  pub uncertainty_floor: f64,
  pub return_band: (f64, f64),
  pub autoregressive: AutoregressiveConfig,
  pub recurrent: RecurrentConfig,
  pub boosted: BoostedConfig,
  pub lightweight: LightweightConfig,
}

impl Default for ForecastConfig {
  fn default() -> Self {
    Self {
      horizon: 252,
      ensemble_enabled: true,
      ensemble_min_history: 100,
      neutral_return: 0.08,
      neutral_uncertainty: 0.05,
      single_vote_uncertainty: 0.05,
      uncertainty_floor: 1e-4,
      return_band: (-0.99, 3.0),
      autoregressive: AutoregressiveConfig::default(),
      recurrent: RecurrentConfig::default(),
      boosted: BoostedConfig::default(),
      lightweight: LightweightConfig::default(),
    }
  }
}

/// Batch scheduler and memory governor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  pub batch_size: usize,
  /// Hard ceiling on worker threads.
  pub max_workers: usize,
  /// Cores left free for the rest of the process.
  pub reserved_cores: usize,
  /// Per-task limit, measured from when a worker picks the task up; late tasks get the
  /// neutral forecast.
  pub task_timeout_ms: u64,
  /// Memory utilization fraction above which an extra reclamation pass runs.
  pub high_water: f64,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      batch_size: 20,
      max_workers: 16,
      reserved_cores: 1,
      task_timeout_ms: 300_000,
      high_water: 0.85,
    }
  }
}

impl SchedulerConfig {
  pub fn task_timeout(&self) -> Duration {
    Duration::from_millis(self.task_timeout_ms)
  }

  /// Worker count for this machine: `cpus - reserved`, at least one, at most `max_workers`.
  pub fn worker_count(&self, jobs: usize) -> usize {
    let cpus = std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(4);
    cpus
      .saturating_sub(self.reserved_cores)
      .max(1)
      .min(self.max_workers.max(1))
      .min(jobs.max(1))
  }
}

/// Prior construction and solver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
  /// Broad market index used to derive the risk-aversion scalar.
  pub market_index: String,
  pub default_risk_aversion: f64,
  pub tau: f64,
  /// Weights at or below this are dropped from the result.
  pub weight_epsilon: f64,
  /// End dates older than this many days force historical analysis.
  pub ex_post_days: i64,
  pub trading_days: f64,
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    Self {
      market_index: "^GSPC".to_string(),
      default_risk_aversion: 2.5,
      tau: 0.05,
      weight_epsilon: 1e-4,
      ex_post_days: 90,
      trading_days: 252.0,
    }
  }
}

/// Time-to-live per memoized stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub prices_ttl_secs: u64,
  pub forecast_ttl_secs: u64,
  pub pipeline_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prices_ttl_secs: 4 * 3600,
      forecast_ttl_secs: 4 * 3600,
      pipeline_ttl_secs: 3600,
    }
  }
}

/// Top-level pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub acquisition: AcquisitionConfig,
  pub forecast: ForecastConfig,
  pub scheduler: SchedulerConfig,
  pub optimizer: OptimizerConfig,
  pub cache: CacheConfig,
  /// Root directory of the JSON portfolio store.
  pub results_dir: PathBuf,
  /// Named asset universes.
  pub ticker_groups: BTreeMap<String, Vec<String>>,
  /// Date treated as "today" by the ex-post guard; `None` uses the local date.
  pub as_of: Option<NaiveDate>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      acquisition: AcquisitionConfig::default(),
      forecast: ForecastConfig::default(),
      scheduler: SchedulerConfig::default(),
      optimizer: OptimizerConfig::default(),
      cache: CacheConfig::default(),
      results_dir: PathBuf::from("logs/portfolio_results"),
      ticker_groups: BTreeMap::new(),
      as_of: None,
    }
  }
}

impl PipelineConfig {
  /// Parse a (possibly partial) JSON document.
  pub fn from_json_str(s: &str) -> Result<Self> {
    serde_json::from_str(s).context("failed to parse pipeline configuration")
  }

  /// Read and parse a JSON configuration file.
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
      .with_context(|| format!("failed to read configuration from {path:?}"))?;
    Self::from_json_str(&raw)
  }

  /// Effective "today" for the ex-post guard.
  pub fn today(&self) -> NaiveDate {
    self
      .as_of
      .unwrap_or_else(|| chrono::Local::now().date_naive())
  }
}
