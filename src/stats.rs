//! # Numeric Helpers
//!
//! $$
//! \hat\beta = (X^\top X)^{-1} X^\top y,\qquad r_t = \ln\frac{P_t}{P_{t-1}}
//! $$
//!
//! Small numeric kernels shared by the forecasting models and the portfolio layer.

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use nalgebra::DMatrix;
use nalgebra::DVector;

pub fn mean(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    0.0
  } else {
    xs.iter().sum::<f64>() / xs.len() as f64
  }
}

/// Variance with `ddof` degrees of freedom removed; `0.0` when undefined.
pub fn variance(xs: &[f64], ddof: usize) -> f64 {
  if xs.len() <= ddof {
    return 0.0;
  }

  let m = mean(xs);
  let mut acc = 0.0;
  for &x in xs {
    let d = x - m;
    acc += d * d;
  }
  acc / (xs.len() - ddof) as f64
}

/// Population standard deviation.
pub fn std_pop(xs: &[f64]) -> f64 {
  variance(xs, 0).sqrt()
}

/// Sample standard deviation.
pub fn std_sample(xs: &[f64]) -> f64 {
  variance(xs, 1).sqrt()
}

/// Log returns of a price series. Pairs with a non-positive price are skipped.
pub fn log_returns(prices: &[f64]) -> Vec<f64> {
  prices
    .windows(2)
    .filter(|w| w[0] > 0.0 && w[1] > 0.0)
    .map(|w| (w[1] / w[0]).ln())
    .collect()
}

/// Simple returns `P_t / P_{t-1} - 1`. Pairs with a non-positive base are skipped.
pub fn simple_returns(prices: &[f64]) -> Vec<f64> {
  prices
    .windows(2)
    .filter(|w| w[0] > 0.0 && w[1].is_finite())
    .map(|w| w[1] / w[0] - 1.0)
    .collect()
}

/// Keep only finite, strictly positive prices.
pub fn valid_prices(prices: &[f64]) -> Vec<f64> {
  prices
    .iter()
    .copied()
    .filter(|p| p.is_finite() && *p > 0.0)
    .collect()
}

/// Least-squares line through `(i, ys[i])`, returned as `(slope, intercept)`.
pub fn linear_trend(ys: &[f64]) -> Result<(f64, f64)> {
  if ys.len() < 2 {
    bail!("linear trend requires at least two points");
  }
  let xs: Vec<f64> = (0..ys.len()).map(|i| i as f64).collect();
  let (slope, intercept): (f64, f64) =
    linreg::linear_regression(&xs, ys).map_err(|e| anyhow!("linear regression failed: {e:?}"))?;

  if !slope.is_finite() || !intercept.is_finite() {
    bail!("linear regression produced non-finite coefficients");
  }
  Ok((slope, intercept))
}

#[derive(Debug, Clone)]
pub struct OlsFit {
  pub beta: Vec<f64>,
  pub residuals: Vec<f64>,
  pub sse: f64,
  pub nobs: usize,
  pub k: usize,
}

impl OlsFit {
  /// Gaussian AIC up to an additive constant.
  pub fn aic(&self) -> f64 {
    let n = self.nobs as f64;
    let sigma2 = (self.sse / n).max(1e-300);
    n * sigma2.ln() + 2.0 * self.k as f64
  }
}

/// Ordinary least squares on a row-major design matrix.
pub fn ols(y: &[f64], x: &[Vec<f64>]) -> Result<OlsFit> {
  if y.is_empty() || y.len() != x.len() {
    bail!("OLS requires a non-empty response matching the design rows");
  }
  let n = y.len();
  let k = x[0].len();
  if k == 0 || x.iter().any(|row| row.len() != k) {
    bail!("OLS design matrix must be rectangular with at least one regressor");
  }
  if n <= k {
    bail!("OLS requires nobs > number of regressors ({n} <= {k})");
  }

  let flat_x: Vec<f64> = x.iter().flat_map(|row| row.iter().copied()).collect();
  let x_mat = DMatrix::from_row_slice(n, k, &flat_x);
  let y_vec = DVector::from_row_slice(y);

  let xtx = x_mat.transpose() * &x_mat;
  let xtx_inv = xtx
    .try_inverse()
    .ok_or_else(|| anyhow!("OLS failed: singular design matrix"))?;

  let beta = &xtx_inv * x_mat.transpose() * &y_vec;
  let residuals_vec = y_vec - &x_mat * &beta;
  let residuals: Vec<f64> = residuals_vec.iter().copied().collect();
  let sse = residuals.iter().map(|u| u * u).sum::<f64>();

  if !sse.is_finite() || beta.iter().any(|b| !b.is_finite()) {
    bail!("OLS produced non-finite estimates");
  }

  Ok(OlsFit {
    beta: beta.iter().copied().collect(),
    residuals,
    sse,
    nobs: n,
    k,
  })
}
