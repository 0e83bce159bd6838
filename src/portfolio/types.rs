//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}} \frac{\mathbb E[R_p]-r_f}{\sigma_p}
//! $$
//!
//! Shared enums, constraint sets and result containers for portfolio optimization.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Prior-construction axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorMethod {
  /// Blend forecasts with a market-capitalization prior (Black-Litterman).
  Bayesian,
  /// Use the forecast vector directly.
  HistoricalMpt,
}

impl PriorMethod {
  /// Parse a prior name; anything unrecognized is treated as [`PriorMethod::Bayesian`].
  pub fn parse(s: &str) -> Self {
    match s.trim().to_lowercase().as_str() {
      "historical_mpt" | "historical-mpt" | "mpt" | "historical" => Self::HistoricalMpt,
      _ => Self::Bayesian,
    }
  }
}

impl Default for PriorMethod {
  fn default() -> Self {
    Self::Bayesian
  }
}

/// Frontier point to solve for. Resolved in the order target return, target risk, max Sharpe.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Objective {
  /// Minimum variance with expected return at least the target.
  TargetReturn(f64),
  /// Maximum return with volatility at most the target.
  TargetRisk(f64),
  MaxSharpe,
}

impl Objective {
  pub fn select(target_return: Option<f64>, target_risk: Option<f64>) -> Self {
    match (target_return, target_risk) {
      (Some(r), _) => Self::TargetReturn(r),
      (None, Some(s)) => Self::TargetRisk(s),
      (None, None) => Self::MaxSharpe,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Self::TargetReturn(_) => "efficient_return",
      Self::TargetRisk(_) => "efficient_risk",
      Self::MaxSharpe => "max_sharpe",
    }
  }
}

/// Long-only box constraints and diversification penalty.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Constraints {
  /// Per-asset upper bound.
  pub max_weight: f64,
  /// Coefficient of the `||w||^2` penalty.
  pub l2_gamma: f64,
}

impl Default for Constraints {
  fn default() -> Self {
    Self {
      max_weight: 0.2,
      l2_gamma: 0.05,
    }
  }
}

/// Solver failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
  /// The constraint set cannot be satisfied.
  #[error("infeasible: {0}")]
  Infeasible(String),
  /// Bad inputs or a numerical breakdown.
  #[error("numerical failure: {0}")]
  Numerical(String),
}

/// Output of a portfolio optimization run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PortfolioResult {
  /// Final portfolio weights.
  pub weights: Vec<f64>,
  /// Model expected portfolio return (annualized if inputs are annualized).
  pub expected_return: f64,
  /// Model portfolio volatility.
  pub volatility: f64,
  /// Sharpe ratio computed as `(expected_return - risk_free) / volatility`.
  pub sharpe: f64,
}
