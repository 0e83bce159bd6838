//! # Black-Litterman Blending
//!
//! $$
//! \mu_{BL} = \pi + \tau\Sigma(\tau\Sigma+\Omega)^{-1}(Q-\pi),\qquad
//! \Sigma_{BL} = \Sigma + \tau\Sigma - \tau\Sigma(\tau\Sigma+\Omega)^{-1}\tau\Sigma
//! $$
//!
//! Market-implied prior from capitalizations combined with absolute views on every asset
//! (identity pick matrix). View confidence comes from the forecast uncertainty.

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use nalgebra::DMatrix;
use nalgebra::DVector;

use crate::stats::mean;
use crate::stats::simple_returns;
use crate::stats::variance;

/// Market-implied risk aversion `(E[r_m] - r_f) / Var(r_m)` from index prices, annualized.
///
/// Returns `None` when the index history is too short, flat or non-finite.
pub fn market_risk_aversion(index_prices: &[f64], risk_free: f64, periods: f64) -> Option<f64> {
  let rets = simple_returns(index_prices);
  if rets.len() < 2 {
    return None;
  }
  let var = variance(&rets, 1) * periods;
  if !var.is_finite() || var <= 0.0 {
    return None;
  }
  let delta = (mean(&rets) * periods - risk_free) / var;
  delta.is_finite().then_some(delta)
}

fn to_matrix(cov: &[Vec<f64>]) -> Result<DMatrix<f64>> {
  let n = cov.len();
  if cov.iter().any(|row| row.len() != n) {
    bail!("covariance must be square");
  }
  Ok(DMatrix::from_fn(n, n, |i, j| cov[i][j]))
}

/// Equilibrium returns `pi = delta * Sigma * w_mkt + r_f` with cap weights `w_mkt`.
pub fn market_prior(caps: &[f64], cov: &[Vec<f64>], delta: f64, risk_free: f64) -> Result<Vec<f64>> {
  let sigma = to_matrix(cov)?;
  if caps.len() != sigma.nrows() {
    bail!("{} caps for {} assets", caps.len(), sigma.nrows());
  }
  if caps.iter().any(|c| !c.is_finite() || *c < 0.0) {
    bail!("market caps must be finite and non-negative");
  }
  let total: f64 = caps.iter().sum();
  if total <= 0.0 {
    bail!("market caps sum to zero");
  }

  let w_mkt = DVector::from_iterator(caps.len(), caps.iter().map(|c| c / total));
  let pi = (&sigma * w_mkt) * delta;
  Ok(pi.iter().map(|p| p + risk_free).collect())
}

/// Posterior moments.
#[derive(Clone, Debug)]
pub struct Posterior {
  pub mu: Vec<f64>,
  pub cov: Vec<Vec<f64>>,
}

/// Blend prior `pi` with views `q`; `omega = diag(max(u, floor)^2)`.
pub fn posterior(
  pi: &[f64],
  cov: &[Vec<f64>],
  views: &[f64],
  uncertainties: &[f64],
  tau: f64,
  floor: f64,
) -> Result<Posterior> {
  let sigma = to_matrix(cov)?;
  let n = sigma.nrows();
  if pi.len() != n || views.len() != n || uncertainties.len() != n {
    bail!("dimension mismatch between prior, views and covariance");
  }

  let tau_sigma = &sigma * tau;
  let omega = DMatrix::from_diagonal(&DVector::from_iterator(
    n,
    uncertainties.iter().map(|u| {
      let u = if u.is_finite() { u.max(floor) } else { floor };
      u * u
    }),
  ));
  let inner = (&tau_sigma + omega)
    .try_inverse()
    .ok_or_else(|| anyhow!("tau*Sigma + Omega is singular"))?;
  let gain = &tau_sigma * inner;

  let pi_v = DVector::from_column_slice(pi);
  let q = DVector::from_column_slice(views);
  let mu = &pi_v + &gain * (q - &pi_v);
  let post = &sigma + &tau_sigma - &gain * &tau_sigma;

  if mu.iter().chain(post.iter()).any(|v| !v.is_finite()) {
    bail!("non-finite posterior");
  }

  // Symmetrize round-off.
  let cov = (0..n)
    .map(|i| (0..n).map(|j| 0.5 * (post[(i, j)] + post[(j, i)])).collect())
    .collect();
  Ok(Posterior {
    mu: mu.iter().copied().collect(),
    cov,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn prior_is_proportional_to_cap_weighted_covariance() {
    let cov = vec![vec![0.04, 0.01], vec![0.01, 0.09]];
    let pi = market_prior(&[3.0, 1.0], &cov, 2.0, 0.01).unwrap();
    assert_relative_eq!(pi[0], 2.0 * (0.04 * 0.75 + 0.01 * 0.25) + 0.01, epsilon = 1e-12);
    assert_relative_eq!(pi[1], 2.0 * (0.01 * 0.75 + 0.09 * 0.25) + 0.01, epsilon = 1e-12);
    assert!(market_prior(&[0.0, 0.0], &cov, 2.0, 0.0).is_err());
    assert!(market_prior(&[1.0], &cov, 2.0, 0.0).is_err());
  }

  #[test]
  fn confident_views_dominate_and_vague_views_keep_prior() {
    let cov = vec![vec![0.04, 0.0], vec![0.0, 0.04]];
    let pi = vec![0.05, 0.05];
    let q = vec![0.20, -0.10];

    let sharp = posterior(&pi, &cov, &q, &[1e-6, 1e-6], 0.05, 1e-6).unwrap();
    assert_relative_eq!(sharp.mu[0], 0.20, epsilon = 1e-6);
    assert_relative_eq!(sharp.mu[1], -0.10, epsilon = 1e-6);

    let vague = posterior(&pi, &cov, &q, &[100.0, 100.0], 0.05, 1e-6).unwrap();
    assert_relative_eq!(vague.mu[0], 0.05, epsilon = 1e-5);
    assert_relative_eq!(vague.cov[0][0], 0.04 * 1.05, epsilon = 1e-6);
    assert_relative_eq!(vague.cov[0][1], vague.cov[1][0], epsilon = 1e-15);
  }

  #[test]
  fn zero_uncertainty_is_floored() {
    let cov = vec![vec![0.04]];
    let post = posterior(&[0.05], &cov, &[0.10], &[0.0], 0.05, 1e-4).unwrap();
    assert!(post.mu[0].is_finite());
    assert!(post.mu[0] > 0.05 && post.mu[0] <= 0.10);
  }

  #[test]
  fn risk_aversion_from_index() {
    assert!(market_risk_aversion(&[100.0, 100.0, 100.0], 0.0, 252.0).is_none());
    assert!(market_risk_aversion(&[100.0], 0.0, 252.0).is_none());
    let idx = [100.0, 101.0, 100.5, 102.0, 103.0, 102.5];
    let delta = market_risk_aversion(&idx, 0.0, 252.0).unwrap();
    assert!(delta > 0.0);
  }
}
