//! # Portfolio Engine
//!
//! $$
//! \mathbf{w}^\* = \operatorname{Optimize}(\mu, \Sigma, \mathcal C, \text{objective})
//! $$
//!
//! Single entry point over the frontier solver: pick the objective, solve, account for
//! performance and drop immaterial weights.

use tracing::debug;

use super::frontier::EfficientFrontier;
use super::types::Constraints;
use super::types::Objective;
use super::types::PortfolioResult;
use super::types::SolverError;

/// Runtime configuration for [`PortfolioEngine`].
#[derive(Clone, Debug)]
pub struct PortfolioEngineConfig {
  /// Frontier point to solve for.
  pub objective: Objective,
  /// Risk-free rate used in Sharpe computations.
  pub risk_free: f64,
  pub constraints: Constraints,
  /// Weights at or below this are zeroed after the solve.
  pub weight_epsilon: f64,
}

impl Default for PortfolioEngineConfig {
  fn default() -> Self {
    Self {
      objective: Objective::MaxSharpe,
      risk_free: 0.02,
      constraints: Constraints::default(),
      weight_epsilon: 1e-4,
    }
  }
}

#[derive(Clone, Debug)]
pub struct PortfolioEngine {
  config: PortfolioEngineConfig,
}

impl PortfolioEngine {
  pub fn new(config: PortfolioEngineConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PortfolioEngineConfig {
    &self.config
  }

  /// Optimize weights for expected returns `mu` and covariance `cov`.
  ///
  /// Performance is taken from the solver weights; immaterial weights are then zeroed and
  /// the remainder is reported as-is, without renormalization.
  pub fn optimize(&self, mu: &[f64], cov: &[Vec<f64>]) -> Result<PortfolioResult, SolverError> {
    let cfg = &self.config;
    let frontier = EfficientFrontier::new(mu, cov, cfg.constraints)?;
    debug!(
      objective = cfg.objective.name(),
      assets = mu.len(),
      cap = cfg.constraints.max_weight,
      gamma = cfg.constraints.l2_gamma,
      "solving frontier"
    );

    let w = frontier.solve(cfg.objective, cfg.risk_free)?;
    if w.iter().any(|x| !x.is_finite()) {
      return Err(SolverError::Numerical("solver produced non-finite weights".into()));
    }

    let mut result = frontier.performance(&w, cfg.risk_free);
    for x in result.weights.iter_mut() {
      if *x <= cfg.weight_epsilon {
        *x = 0.0;
      }
    }
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn small_weights_are_dropped_without_renormalizing() {
    let mu = vec![0.30, 0.01, 0.02];
    let cov = vec![
      vec![0.04, 0.0, 0.0],
      vec![0.0, 0.04, 0.0],
      vec![0.0, 0.0, 0.04],
    ];
    let engine = PortfolioEngine::new(PortfolioEngineConfig {
      constraints: Constraints {
        max_weight: 1.0,
        l2_gamma: 0.0,
      },
      risk_free: 0.0,
      ..PortfolioEngineConfig::default()
    });

    let res = engine.optimize(&mu, &cov).unwrap();
    assert!(res.weights.iter().all(|w| *w == 0.0 || *w > 1e-4));
    assert!(res.weights.iter().sum::<f64>() <= 1.0 + 1e-9);
    assert!(res.weights[0] > 0.5);
    assert!(res.sharpe > 0.0);
    assert!(res.volatility > 0.0);
  }

  #[test]
  fn infeasible_target_propagates() {
    let engine = PortfolioEngine::new(PortfolioEngineConfig {
      objective: Objective::TargetReturn(1.0),
      constraints: Constraints {
        max_weight: 0.6,
        l2_gamma: 0.05,
      },
      ..PortfolioEngineConfig::default()
    });
    let cov = vec![vec![0.04, 0.0], vec![0.0, 0.09]];
    assert!(matches!(
      engine.optimize(&[0.05, 0.10], &cov),
      Err(SolverError::Infeasible(_))
    ));
  }
}
