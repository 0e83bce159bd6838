//! # Forecast Ensemble
//!
//! $$
//! \hat\mu = \frac{1}{|V|}\sum_{m\in V}\hat\mu_m,\qquad
//! \hat u = \begin{cases}\operatorname{sd}_{m\in V}(\hat\mu_m) & |V|\ge 2\\ u_0 & |V| = 1\end{cases}
//! $$
//!
//! Fixed ladder of forecasting models. Each member runs in isolation (a panic inside one is
//! contained and treated as an opt-out) and only finite votes are averaged.

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;

use tracing::debug;
use tracing::warn;

use super::Forecaster;
use super::ForecastResult;
use super::ForecastSource;
use super::ModelOutcome;
use super::autoregressive::AutoregressiveForecaster;
use super::boosted::BoostedForecaster;
use super::lightweight;
#[cfg(feature = "ai")]
use super::recurrent::RecurrentForecaster;
use crate::config::ForecastConfig;
use crate::stats::std_pop;
use crate::stats::valid_prices;

/// Closed set of ensemble members.
#[derive(Clone, Debug)]
pub enum EnsembleMember {
  Autoregressive(AutoregressiveForecaster),
  #[cfg(feature = "ai")]
  Recurrent(RecurrentForecaster),
  Boosted(BoostedForecaster),
}

impl Forecaster for EnsembleMember {
  fn name(&self) -> &'static str {
    match self {
      Self::Autoregressive(m) => m.name(),
      #[cfg(feature = "ai")]
      Self::Recurrent(m) => m.name(),
      Self::Boosted(m) => m.name(),
    }
  }

  fn forecast(&self, prices: &[f64]) -> ModelOutcome {
    match self {
      Self::Autoregressive(m) => m.forecast(prices),
      #[cfg(feature = "ai")]
      Self::Recurrent(m) => m.forecast(prices),
      Self::Boosted(m) => m.forecast(prices),
    }
  }
}

/// Combine member votes into a single result.
pub fn aggregate(votes: &[f64], cfg: &ForecastConfig) -> ForecastResult {
  let votes: Vec<f64> = votes.iter().copied().filter(|v| v.is_finite()).collect();
  match votes.len() {
    0 => {
      warn!("no ensemble member produced a vote, using neutral forecast");
      ForecastResult::neutral(cfg)
    }
    1 => ForecastResult::sanitized(
      votes[0],
      cfg.single_vote_uncertainty,
      ForecastSource::Ensemble,
      cfg,
    ),
    n => {
      let mean = votes.iter().sum::<f64>() / n as f64;
      ForecastResult::sanitized(mean, std_pop(&votes), ForecastSource::Ensemble, cfg)
    }
  }
}

/// Per-asset forecasting engine: routes short histories to the lightweight estimator and
/// everything else through the model ladder.
#[derive(Clone, Debug)]
pub struct ForecastEngine {
  cfg: ForecastConfig,
  members: Vec<EnsembleMember>,
}

impl ForecastEngine {
  pub fn new(cfg: ForecastConfig) -> Self {
    let mut members = vec![EnsembleMember::Autoregressive(AutoregressiveForecaster::new(
      cfg.autoregressive.clone(),
      cfg.horizon,
    ))];
    #[cfg(feature = "ai")]
    members.push(EnsembleMember::Recurrent(RecurrentForecaster::new(
      cfg.recurrent.clone(),
    )));
    members.push(EnsembleMember::Boosted(BoostedForecaster::new(
      cfg.boosted.clone(),
    )));

    Self { cfg, members }
  }

  /// Engine with an explicit member list.
  pub fn with_members(cfg: ForecastConfig, members: Vec<EnsembleMember>) -> Self {
    Self { cfg, members }
  }

  pub fn config(&self) -> &ForecastConfig {
    &self.cfg
  }

  pub fn members(&self) -> &[EnsembleMember] {
    &self.members
  }

  /// `true` when `prices` is long enough for the model ladder.
  pub fn uses_ensemble(&self, prices: &[f64]) -> bool {
    self.cfg.ensemble_enabled && valid_prices(prices).len() >= self.cfg.ensemble_min_history
  }

  /// Run every member on `prices` and return the tagged outcomes.
  pub fn outcomes(&self, prices: &[f64]) -> Vec<(&'static str, ModelOutcome)> {
    self
      .members
      .iter()
      .map(|member| {
        let outcome = catch_unwind(AssertUnwindSafe(|| member.forecast(prices))).unwrap_or_else(
          |_| ModelOutcome::OptedOut {
            reason: "model panicked".into(),
          },
        );
        match &outcome {
          ModelOutcome::Fitted { value } => debug!(model = member.name(), value, "vote"),
          ModelOutcome::Degraded { value, reason } => {
            debug!(model = member.name(), value, reason = %reason, "degraded vote")
          }
          ModelOutcome::OptedOut { reason } => {
            debug!(model = member.name(), reason = %reason, "opted out")
          }
        }
        (member.name(), outcome)
      })
      .collect()
  }

  pub fn forecast(&self, prices: &[f64]) -> ForecastResult {
    if !self.uses_ensemble(prices) {
      debug!(
        points = prices.len(),
        min = self.cfg.ensemble_min_history,
        "routing to lightweight forecast"
      );
      return lightweight::forecast(prices, &self.cfg);
    }

    let prices = valid_prices(prices);
    let votes: Vec<f64> = self
      .outcomes(&prices)
      .iter()
      .filter_map(|(_, o)| o.vote())
      .collect();
    aggregate(&votes, &self.cfg)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::BoostedConfig;
  use crate::config::RecurrentConfig;
  use approx::assert_relative_eq;

  fn fast_cfg() -> ForecastConfig {
    ForecastConfig {
      recurrent: RecurrentConfig {
        units: 4,
        epochs: 1,
        ..RecurrentConfig::default()
      },
      boosted: BoostedConfig {
        n_estimators: 10,
        ..BoostedConfig::default()
      },
      ..ForecastConfig::default()
    }
  }

  #[test]
  fn single_vote_uses_fixed_uncertainty() {
    let cfg = ForecastConfig::default();
    let r = aggregate(&[0.12, f64::NAN], &cfg);
    assert_eq!(r.expected_return, 0.12);
    assert_eq!(r.uncertainty, 0.05);
    assert_eq!(r.source, ForecastSource::Ensemble);
  }

  #[test]
  fn no_votes_is_neutral_default() {
    let cfg = ForecastConfig::default();
    let r = aggregate(&[], &cfg);
    assert_eq!(r.source, ForecastSource::Default);
    assert_eq!((r.expected_return, r.uncertainty), (0.08, 0.05));
  }

  #[test]
  fn votes_are_averaged_with_population_spread() {
    let cfg = ForecastConfig::default();
    let r = aggregate(&[0.1, 0.3], &cfg);
    assert_relative_eq!(r.expected_return, 0.2, epsilon = 1e-12);
    assert_relative_eq!(r.uncertainty, 0.1, epsilon = 1e-12);
  }

  #[test]
  fn short_series_matches_lightweight_exactly() {
    let cfg = fast_cfg();
    let engine = ForecastEngine::new(cfg.clone());
    let prices: Vec<f64> = (0..99).map(|i| 50.0 + (i as f64 * 0.3).sin()).collect();
    assert!(!engine.uses_ensemble(&prices));
    assert_eq!(engine.forecast(&prices), lightweight::forecast(&prices, &cfg));
  }

  #[test]
  fn constant_prices_give_finite_nonnegative_floored_estimate() {
    let engine = ForecastEngine::new(fast_cfg());
    let r = engine.forecast(&vec![42.0; 160]);
    assert_eq!(r.source, ForecastSource::Ensemble);
    assert!(r.expected_return.is_finite());
    assert!(r.expected_return.abs() < 1e-3);
    assert!(r.uncertainty > 0.0);
  }

  #[test]
  fn only_autoregressive_member_gives_single_vote() {
    let cfg = fast_cfg();
    let engine = ForecastEngine::with_members(
      cfg.clone(),
      vec![EnsembleMember::Autoregressive(AutoregressiveForecaster::new(
        cfg.autoregressive.clone(),
        cfg.horizon,
      ))],
    );
    let prices: Vec<f64> = (0..150).map(|i| 100.0 + i as f64 * 0.2).collect();
    let r = engine.forecast(&prices);
    assert_eq!(r.uncertainty, 0.05);
  }
}
