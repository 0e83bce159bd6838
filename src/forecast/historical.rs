//! # Historical CAGR
//!
//! $$
//! \text{CAGR} = \left(\frac{P_T}{P_0}\right)^{1/Y} - 1,\qquad Y = \frac{n}{252}
//! $$

use tracing::debug;

use super::ForecastResult;
use super::ForecastSource;
use super::TRADING_DAYS;
use crate::config::ForecastConfig;
use crate::stats::valid_prices;

/// Compound annual growth rate from the first and last valid price.
pub fn cagr(prices: &[f64], periods_per_year: f64) -> f64 {
  let valid: Vec<f64> = prices.iter().copied().filter(|p| p.is_finite()).collect();
  if valid.len() < 2 {
    return 0.0;
  }

  let start = valid[0];
  let end = valid[valid.len() - 1];
  if start <= 0.0 {
    return 0.0;
  }

  let total = end / start;
  if total <= 0.0 {
    return -0.99;
  }

  let years = valid.len() as f64 / periods_per_year;
  if years <= 0.0 {
    return 0.0;
  }
  total.powf(1.0 / years) - 1.0
}

pub fn forecast(prices: &[f64], cfg: &ForecastConfig) -> ForecastResult {
  let valid = valid_prices(prices);
  let growth = cagr(&valid, TRADING_DAYS);
  debug!(points = valid.len(), cagr = growth, "historical forecast");
  ForecastResult::sanitized(
    growth,
    cfg.lightweight.uncertainty,
    ForecastSource::Historical,
    cfg,
  )
}
