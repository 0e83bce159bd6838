//! # Lightweight Forecast
//!
//! $$
//! \hat\mu = \operatorname{clip}\big(0.4\,\hat\mu_{\text{ses}} + 0.3\,\hat\mu_{\text{trend}} + 0.3\,\hat\mu_{\text{hist}},\,-0.5,\,1\big)
//! $$
//!
//! Cheap estimator for short histories or when the ensemble is switched off. Each leg
//! returns a horizon return; a failing leg is replaced by the neutral constant alone.

use anyhow::Result;
use anyhow::bail;
use tracing::debug;
use tracing::warn;

use super::ForecastResult;
use super::ForecastSource;
use crate::config::ForecastConfig;
use crate::config::LightweightConfig;
use crate::stats::linear_trend;
use crate::stats::mean;
use crate::stats::simple_returns;
use crate::stats::std_pop;
use crate::stats::valid_prices;

fn projected_return(slope: f64, intercept: f64, len: usize, horizon: usize, current: f64) -> Result<f64> {
  if current <= 0.0 {
    bail!("non-positive current price");
  }
  let future = slope * (len + horizon) as f64 + intercept;
  let ret = future / current - 1.0;
  if !ret.is_finite() {
    bail!("non-finite projected return");
  }
  Ok(ret)
}

/// Exponential smoothing followed by a linear trend over the last smoothed points.
pub fn smoothing_leg(prices: &[f64], cfg: &LightweightConfig, horizon: usize) -> Result<f64> {
  if prices.len() < 2 {
    bail!("smoothing needs at least two prices");
  }

  let mut smoothed = Vec::with_capacity(prices.len());
  smoothed.push(prices[0]);
  for &p in &prices[1..] {
    let prev = smoothed[smoothed.len() - 1];
    smoothed.push(cfg.alpha * p + (1.0 - cfg.alpha) * prev);
  }

  let recent = &smoothed[smoothed.len().saturating_sub(cfg.smoothing_window)..];
  let (slope, intercept) = linear_trend(recent)?;
  projected_return(slope, intercept, recent.len(), horizon, recent[recent.len() - 1])
}

/// OLS price trend over the most recent window.
pub fn trend_leg(prices: &[f64], cfg: &LightweightConfig, horizon: usize) -> Result<f64> {
  if prices.len() < cfg.min_history {
    bail!("trend needs at least {} prices", cfg.min_history);
  }

  let recent = &prices[prices.len().saturating_sub(cfg.trend_window)..];
  let (slope, intercept) = linear_trend(recent)?;
  projected_return(slope, intercept, recent.len(), horizon, recent[recent.len() - 1])
}

/// Mean simple return scaled to the horizon, penalized for high daily volatility.
pub fn historical_leg(prices: &[f64], cfg: &LightweightConfig, horizon: usize) -> Result<f64> {
  if prices.len() < 30 {
    bail!("historical leg needs at least 30 prices");
  }

  let returns: Vec<f64> = simple_returns(prices)
    .into_iter()
    .filter(|r| r.is_finite())
    .collect();
  if returns.len() < 10 {
    bail!("historical leg needs at least 10 returns");
  }

  let mut period_return = mean(&returns) * horizon as f64;
  if std_pop(&returns) > cfg.vol_threshold {
    period_return *= cfg.vol_penalty;
  }
  Ok(period_return)
}

/// Blended horizon return, before any result-level sanitization.
pub fn blend(prices: &[f64], cfg: &LightweightConfig, horizon: usize) -> f64 {
  if prices.len() < cfg.min_history {
    warn!(points = prices.len(), "insufficient data for lightweight forecast");
    return cfg.neutral;
  }

  let leg = |name: &str, r: Result<f64>| match r {
    Ok(v) if v.is_finite() => v,
    Ok(_) => cfg.neutral,
    Err(err) => {
      debug!(leg = name, error = %err, "lightweight leg fell back to neutral");
      cfg.neutral
    }
  };

  let ses = leg("smoothing", smoothing_leg(prices, cfg, horizon));
  let trend = leg("trend", trend_leg(prices, cfg, horizon));
  let hist = leg("historical", historical_leg(prices, cfg, horizon));

  let (w_ses, w_trend, w_hist) = cfg.weights;
  let combined = w_ses * ses + w_trend * trend + w_hist * hist;
  combined.clamp(cfg.clip.0, cfg.clip.1)
}

pub fn forecast(prices: &[f64], cfg: &ForecastConfig) -> ForecastResult {
  let valid = valid_prices(prices);
  let value = blend(&valid, &cfg.lightweight, cfg.horizon);
  ForecastResult::sanitized(
    value,
    cfg.lightweight.uncertainty,
    ForecastSource::Lightweight,
    cfg,
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn too_short_series_is_neutral() {
    let cfg = LightweightConfig::default();
    assert_eq!(blend(&[100.0, 101.0, 102.0], &cfg, 252), cfg.neutral);
  }

  #[test]
  fn constant_prices_blend_to_weighted_zero() {
    let cfg = LightweightConfig::default();
    let prices = vec![50.0; 120];
    assert_relative_eq!(blend(&prices, &cfg, 252), 0.0, epsilon = 1e-12);
  }

  #[test]
  fn volatile_series_is_penalized() {
    let cfg = LightweightConfig::default();
    let prices: Vec<f64> = (0..60)
      .map(|i| if i % 2 == 0 { 100.0 } else { 115.0 })
      .collect();
    let raw_mean = mean(&simple_returns(&prices)) * 252.0;
    let leg = historical_leg(&prices, &cfg, 252).unwrap();
    assert_relative_eq!(leg, raw_mean * 0.8, epsilon = 1e-12);
  }

  #[test]
  fn rising_series_is_clipped_to_upper_band() {
    let cfg = ForecastConfig::default();
    let prices: Vec<f64> = (0..200).map(|i| 100.0 * 1.01_f64.powi(i)).collect();
    let r = forecast(&prices, &cfg);
    assert_eq!(r.source, ForecastSource::Lightweight);
    assert_eq!(r.expected_return, 1.0);
    assert_eq!(r.uncertainty, 0.05);
  }
}
