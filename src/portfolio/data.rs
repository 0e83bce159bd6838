//! # Portfolio Data Utilities
//!
//! $$
//! \hat\Sigma_{\text{LW}} = (1-\delta)\,S + \delta\,\bar\mu I,\qquad \bar\mu = \tfrac{1}{p}\operatorname{tr}S
//! $$
//!
//! Return preprocessing and Ledoit-Wolf shrinkage covariance.

use ndarray::Array2;
use ndarray::Axis;

use crate::market::PriceMatrix;

/// Simple period returns, one column per asset. Rows with a non-finite entry are skipped.
pub fn simple_returns_matrix(prices: &PriceMatrix) -> Array2<f64> {
  let values = prices.values();
  let (t, n) = values.dim();
  if t < 2 {
    return Array2::zeros((0, n));
  }

  let mut flat = Vec::with_capacity((t - 1) * n);
  let mut rows = 0;
  for i in 1..t {
    let row: Vec<f64> = (0..n)
      .map(|j| values[[i, j]] / values[[i - 1, j]] - 1.0)
      .collect();
    if row.iter().all(|r| r.is_finite()) {
      flat.extend(row);
      rows += 1;
    }
  }

  Array2::from_shape_vec((rows, n), flat).unwrap_or_else(|_| Array2::zeros((0, n)))
}

/// Ledoit-Wolf shrinkage toward a scaled identity. Returns the shrunk covariance (per period)
/// and the shrinkage intensity.
pub fn ledoit_wolf(returns: &Array2<f64>) -> (Array2<f64>, f64) {
  let (n, p) = returns.dim();
  if n == 0 || p == 0 {
    return (Array2::zeros((p, p)), 0.0);
  }

  let means = returns.mean_axis(Axis(0)).unwrap_or_else(|| ndarray::Array1::zeros(p));
  let x = returns - &means;
  let nf = n as f64;
  let pf = p as f64;

  let emp_cov = x.t().dot(&x) / nf;
  let x2 = x.mapv(|v| v * v);
  let emp_cov_trace: f64 = x2.sum() / nf;
  let mu = emp_cov_trace / pf;

  let beta_sum = x2.t().dot(&x2).sum();
  let delta_sum = x.t().dot(&x).mapv(|v| v * v).sum() / (nf * nf);

  let beta = (beta_sum / nf - delta_sum) / (pf * nf);
  let delta = (delta_sum - 2.0 * mu * emp_cov_trace + pf * mu * mu) / pf;
  let beta = beta.min(delta);
  let shrinkage = if beta == 0.0 || delta == 0.0 {
    0.0
  } else {
    (beta / delta).clamp(0.0, 1.0)
  };

  let mut shrunk = emp_cov * (1.0 - shrinkage);
  for i in 0..p {
    shrunk[[i, i]] += shrinkage * mu;
  }
  (shrunk, shrinkage)
}

/// Symmetric positive semi-definite covariance aligned with `assets`.
#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceEstimate {
  pub assets: Vec<String>,
  pub matrix: Vec<Vec<f64>>,
  pub shrinkage: f64,
}

impl CovarianceEstimate {
  /// Annualized Ledoit-Wolf covariance of simple returns.
  pub fn from_prices(prices: &PriceMatrix, periods_per_year: f64) -> Self {
    let returns = simple_returns_matrix(prices);
    let (cov, shrinkage) = ledoit_wolf(&returns);
    let matrix = cov
      .axis_iter(Axis(0))
      .map(|row| row.iter().map(|v| v * periods_per_year).collect())
      .collect();

    Self {
      assets: prices.assets().to_vec(),
      matrix,
      shrinkage,
    }
  }

  pub fn dim(&self) -> usize {
    self.assets.len()
  }
}
