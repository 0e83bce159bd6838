//! # Forecasting
//!
//! $$
//! \hat\mu = \frac{1}{|V|}\sum_{m\in V}\hat\mu_m,\qquad
//! \hat u = \sqrt{\frac{1}{|V|}\sum_{m\in V}(\hat\mu_m-\hat\mu)^2}
//! $$
//!
//! Per-asset annualized expected-return estimates. Three routes exist:
//!
//! - [`ForecastMethod::Historical`]: geometric-mean CAGR ([`historical`]).
//! - [`ForecastMethod::Lightweight`]: cheap three-leg blend ([`lightweight`]).
//! - [`ForecastMethod::Ensemble`]: model ladder ([`ensemble`]) built from
//!   [`autoregressive`], [`boosted`] and (feature `ai`) [`recurrent`] members.
//!
//! Nothing in this module returns an error to its caller: every route resolves to a
//! [`ForecastResult`] that is finite, inside the configured band and carries a strictly
//! positive uncertainty.

pub mod autoregressive;
pub mod boosted;
pub mod ensemble;
pub mod features;
pub mod historical;
pub mod lightweight;
#[cfg(feature = "ai")]
pub mod recurrent;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::config::ForecastConfig;

pub use ensemble::EnsembleMember;
pub use ensemble::ForecastEngine;

/// Trading periods per year used for annualization.
pub const TRADING_DAYS: f64 = 252.0;

/// Which route produced a [`ForecastResult`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForecastSource {
  Ensemble,
  Lightweight,
  Historical,
  /// Neutral constant used when nothing else produced a value.
  Default,
}

/// Forecast-method axis of an optimization request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForecastMethod {
  Historical,
  Lightweight,
  Ensemble,
}

impl ForecastMethod {
  /// Parse a method name. Unknown values map to [`ForecastMethod::Lightweight`].
  pub fn parse(s: &str) -> Self {
    match s.trim().to_lowercase().as_str() {
      "historical" | "cagr" => Self::Historical,
      "ensemble" | "ml" | "ml_ensemble" => Self::Ensemble,
      _ => Self::Lightweight,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Historical => "HISTORICAL",
      Self::Lightweight => "LIGHTWEIGHT",
      Self::Ensemble => "ENSEMBLE",
    }
  }
}

impl Default for ForecastMethod {
  fn default() -> Self {
    Self::Lightweight
  }
}

impl fmt::Display for ForecastMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Per-asset forecast handed to the optimizer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
  /// Annualized expected return.
  pub expected_return: f64,
  /// Standard-deviation-like uncertainty, strictly positive.
  pub uncertainty: f64,
  pub source: ForecastSource,
}

impl ForecastResult {
  /// Build a result, enforcing finiteness, the return band and the uncertainty floor.
  pub fn sanitized(
    expected_return: f64,
    uncertainty: f64,
    source: ForecastSource,
    cfg: &ForecastConfig,
  ) -> Self {
    if !expected_return.is_finite() {
      return Self::neutral(cfg);
    }

    let (lo, hi) = cfg.return_band;
    let uncertainty = if uncertainty.is_finite() {
      uncertainty.abs()
    } else {
      cfg.neutral_uncertainty
    };

    Self {
      expected_return: expected_return.clamp(lo, hi),
      uncertainty: uncertainty.max(cfg.uncertainty_floor),
      source,
    }
  }

  /// Fixed neutral forecast `(0.08, 0.05)` by default.
  pub fn neutral(cfg: &ForecastConfig) -> Self {
    Self {
      expected_return: cfg.neutral_return,
      uncertainty: cfg.neutral_uncertainty.max(cfg.uncertainty_floor),
      source: ForecastSource::Default,
    }
  }
}

/// Outcome of one model on one series.
///
/// The ensemble matches on these tags instead of relying on error propagation: fitted and
/// degraded outcomes vote, opted-out ones do not.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelOutcome {
  /// The model fitted normally.
  Fitted { value: f64 },
  /// The model's primary fit failed; `value` comes from one of its own fallbacks.
  Degraded { value: f64, reason: String },
  /// The model declined to vote (insufficient data, training failure, disabled).
  OptedOut { reason: String },
}

impl ModelOutcome {
  /// The vote carried by this outcome, if it is finite.
  pub fn vote(&self) -> Option<f64> {
    match self {
      Self::Fitted { value } | Self::Degraded { value, .. } if value.is_finite() => Some(*value),
      _ => None,
    }
  }
}

/// Common capability of every forecasting model.
pub trait Forecaster {
  fn name(&self) -> &'static str;

  /// Annualized expected log-return vote for a cleaned price series.
  fn forecast(&self, prices: &[f64]) -> ModelOutcome;
}

/// Forecast one asset with the requested method.
pub fn forecast_asset(prices: &[f64], method: ForecastMethod, cfg: &ForecastConfig) -> ForecastResult {
  match method {
    ForecastMethod::Historical => historical::forecast(prices, cfg),
    ForecastMethod::Lightweight => lightweight::forecast(prices, cfg),
    ForecastMethod::Ensemble => ForecastEngine::new(cfg.clone()).forecast(prices),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_method_defaults_to_lightweight() {
    assert_eq!(ForecastMethod::parse("prophet"), ForecastMethod::Lightweight);
    assert_eq!(ForecastMethod::parse(" Ensemble "), ForecastMethod::Ensemble);
    assert_eq!(ForecastMethod::parse("HISTORICAL"), ForecastMethod::Historical);
  }

  #[test]
  fn sanitized_result_is_banded_and_floored() {
    let cfg = ForecastConfig::default();
    let r = ForecastResult::sanitized(12.0, 0.0, ForecastSource::Ensemble, &cfg);
    assert_eq!(r.expected_return, cfg.return_band.1);
    assert_eq!(r.uncertainty, cfg.uncertainty_floor);

    let r = ForecastResult::sanitized(f64::NAN, 0.2, ForecastSource::Ensemble, &cfg);
    assert_eq!(r, ForecastResult::neutral(&cfg));
  }

  #[test]
  fn opted_out_and_nan_outcomes_carry_no_vote() {
    assert_eq!(ModelOutcome::Fitted { value: 0.1 }.vote(), Some(0.1));
    assert_eq!(
      ModelOutcome::Degraded {
        value: f64::NAN,
        reason: "x".into()
      }
      .vote(),
      None
    );
    assert_eq!(ModelOutcome::OptedOut { reason: "short".into() }.vote(), None);
  }
}
