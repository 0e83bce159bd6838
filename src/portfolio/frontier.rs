//! # Efficient Frontier
//!
//! $$
//! \mathbf w(t) = \arg\min_{\mathbf w\in\mathcal W}\ \mathbf w^\top(\Sigma+\gamma I)\mathbf w - t\,\mu^\top\mathbf w,
//! \qquad \mathcal W = \{\mathbf w : \textstyle\sum_i w_i = 1,\ 0\le w_i\le c\}
//! $$
//!
//! Long-only capped frontier traced by the trade-off parameter `t >= 0`. Each point is an
//! accelerated projected-gradient solve; the objectives pick `t` with a one-dimensional
//! Brent search (root for target return/risk, minimum for negative Sharpe).

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::solver::brent::BrentOpt;
use argmin::solver::brent::BrentRoot;
use tracing::debug;

use super::types::Constraints;
use super::types::Objective;
use super::types::PortfolioResult;
use super::types::SolverError;

const QP_MAX_ITERS: usize = 5000;
const QP_TOL: f64 = 1e-12;
const PROJECTION_ITERS: usize = 100;
const T_MAX_CEILING: f64 = 1e8;
const SEARCH_ITERS: u64 = 200;

fn dot(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn mat_vec_mul(mat: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
  mat.iter().map(|row| dot(row, v)).collect()
}

/// Euclidean projection onto `{w : sum w = 1, 0 <= w <= cap}`. Requires `n * cap >= 1`.
pub fn project_capped_simplex(v: &[f64], cap: f64) -> Vec<f64> {
  let clipped_sum = |tau: f64| -> f64 { v.iter().map(|x| (x - tau).clamp(0.0, cap)).sum() };

  let lo_v = v.iter().copied().fold(f64::INFINITY, f64::min);
  let hi_v = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  let mut lo = lo_v - cap;
  let mut hi = hi_v;
  for _ in 0..PROJECTION_ITERS {
    let mid = 0.5 * (lo + hi);
    if clipped_sum(mid) > 1.0 {
      lo = mid;
    } else {
      hi = mid;
    }
  }
  let tau = 0.5 * (lo + hi);
  v.iter().map(|x| (x - tau).clamp(0.0, cap)).collect()
}

/// Frontier over fixed `mu` and `cov`.
#[derive(Clone, Debug)]
pub struct EfficientFrontier {
  mu: Vec<f64>,
  cov: Vec<Vec<f64>>,
  constraints: Constraints,
  lipschitz: f64,
}

impl EfficientFrontier {
  pub fn new(mu: &[f64], cov: &[Vec<f64>], constraints: Constraints) -> Result<Self, SolverError> {
    let n = mu.len();
    if n == 0 {
      return Err(SolverError::Numerical("empty universe".into()));
    }
    if cov.len() != n || cov.iter().any(|row| row.len() != n) {
      return Err(SolverError::Numerical(format!(
        "covariance shape does not match {n} expected returns"
      )));
    }
    if mu.iter().chain(cov.iter().flatten()).any(|v| !v.is_finite()) {
      return Err(SolverError::Numerical("non-finite optimizer input".into()));
    }
    if constraints.max_weight.is_nan() || constraints.max_weight <= 0.0 || constraints.l2_gamma < 0.0 {
      return Err(SolverError::Numerical("invalid constraint parameters".into()));
    }
    if (n as f64) * constraints.max_weight.min(1.0) < 1.0 - 1e-12 {
      return Err(SolverError::Infeasible(format!(
        "weight cap {} cannot fully invest {n} assets",
        constraints.max_weight
      )));
    }

    // Gershgorin bound on the largest eigenvalue of Sigma + gamma I.
    let gershgorin = cov
      .iter()
      .map(|row| row.iter().map(|v| v.abs()).sum::<f64>() + constraints.l2_gamma)
      .fold(0.0, f64::max);

    Ok(Self {
      mu: mu.to_vec(),
      cov: cov.to_vec(),
      constraints,
      lipschitz: (2.0 * gershgorin).max(1e-8),
    })
  }

  pub fn n_assets(&self) -> usize {
    self.mu.len()
  }

  fn cap(&self) -> f64 {
    self.constraints.max_weight.min(1.0)
  }

  pub fn portfolio_return(&self, w: &[f64]) -> f64 {
    dot(w, &self.mu)
  }

  /// Volatility under the unpenalized covariance.
  pub fn portfolio_volatility(&self, w: &[f64]) -> f64 {
    dot(w, &mat_vec_mul(&self.cov, w)).max(0.0).sqrt()
  }

  /// Frontier point for trade-off `t`, via FISTA on the capped simplex.
  pub fn solve_tradeoff(&self, t: f64) -> Vec<f64> {
    let n = self.n_assets();
    let cap = self.cap();
    let gamma = self.constraints.l2_gamma;
    let step = 1.0 / self.lipschitz;

    let mut w = project_capped_simplex(&vec![1.0 / n as f64; n], cap);
    let mut y = w.clone();
    let mut momentum = 1.0_f64;

    for _ in 0..QP_MAX_ITERS {
      let sigma_y = mat_vec_mul(&self.cov, &y);
      let shifted: Vec<f64> = (0..n)
        .map(|i| y[i] - step * (2.0 * (sigma_y[i] + gamma * y[i]) - t * self.mu[i]))
        .collect();
      let next = project_capped_simplex(&shifted, cap);

      let next_momentum = 0.5 * (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt());
      let beta = (momentum - 1.0) / next_momentum;
      let delta = next
        .iter()
        .zip(w.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max);

      y = next
        .iter()
        .zip(w.iter())
        .map(|(a, b)| a + beta * (a - b))
        .collect();
      w = next;
      momentum = next_momentum;

      if delta < QP_TOL {
        break;
      }
    }
    w
  }

  /// Highest attainable expected return: fill the cap in descending order of `mu`.
  pub fn max_return_weights(&self) -> Vec<f64> {
    let cap = self.cap();
    let mut order: Vec<usize> = (0..self.n_assets()).collect();
    order.sort_by(|&a, &b| self.mu[b].total_cmp(&self.mu[a]));

    let mut w = vec![0.0; self.n_assets()];
    let mut remaining = 1.0;
    for i in order {
      if remaining <= 0.0 {
        break;
      }
      let take = cap.min(remaining);
      w[i] = take;
      remaining -= take;
    }
    w
  }

  pub fn max_return(&self) -> f64 {
    self.portfolio_return(&self.max_return_weights())
  }

  /// Smallest `t` (by doubling) whose point reaches the maximum return.
  fn t_max(&self) -> f64 {
    let target = self.max_return() - 1e-10;
    let mut t = 1.0;
    while t < T_MAX_CEILING && self.portfolio_return(&self.solve_tradeoff(t)) < target {
      t *= 2.0;
    }
    t.min(T_MAX_CEILING)
  }

  fn root_on_path<F>(&self, f: F, hi: f64) -> Result<f64, SolverError>
  where
    F: Fn(&[f64]) -> f64,
  {
    let cost = PathResidual {
      frontier: self,
      residual: f,
    };
    let solver = BrentRoot::new(0.0, hi, 1e-10);
    let res = Executor::new(cost, solver)
      .configure(|state| state.max_iters(SEARCH_ITERS))
      .run()
      .map_err(|e| SolverError::Numerical(e.to_string()))?;
    res
      .state
      .param
      .ok_or_else(|| SolverError::Numerical("frontier search returned no point".into()))
  }

  /// Minimum variance subject to `return >= target`.
  pub fn efficient_return(&self, target: f64) -> Result<Vec<f64>, SolverError> {
    let max_ret = self.max_return();
    if target > max_ret + 1e-9 {
      return Err(SolverError::Infeasible(format!(
        "target return {target:.4} exceeds the maximum achievable {max_ret:.4}"
      )));
    }

    let w0 = self.solve_tradeoff(0.0);
    if self.portfolio_return(&w0) >= target {
      return Ok(w0);
    }
    let t_max = self.t_max();
    let w_hi = self.solve_tradeoff(t_max);
    if self.portfolio_return(&w_hi) <= target {
      return Ok(w_hi);
    }

    let t = self.root_on_path(|w| self.portfolio_return(w) - target, t_max)?;
    debug!(t, "efficient return trade-off");
    Ok(self.solve_tradeoff(t))
  }

  /// Maximum return subject to `volatility <= target`.
  pub fn efficient_risk(&self, target: f64) -> Result<Vec<f64>, SolverError> {
    let w0 = self.solve_tradeoff(0.0);
    let min_vol = self.portfolio_volatility(&w0);
    if min_vol > target + 1e-12 {
      return Err(SolverError::Infeasible(format!(
        "target volatility {target:.4} is below the minimum achievable {min_vol:.4}"
      )));
    }
    if min_vol >= target {
      return Ok(w0);
    }

    let t_max = self.t_max();
    let w_hi = self.solve_tradeoff(t_max);
    if self.portfolio_volatility(&w_hi) <= target {
      return Ok(w_hi);
    }

    let t = self.root_on_path(|w| self.portfolio_volatility(w) - target, t_max)?;
    debug!(t, "efficient risk trade-off");
    Ok(self.solve_tradeoff(t))
  }

  pub fn sharpe(&self, w: &[f64], risk_free: f64) -> f64 {
    let vol = self.portfolio_volatility(w);
    if vol > 1e-15 {
      (self.portfolio_return(w) - risk_free) / vol
    } else {
      0.0
    }
  }

  /// Tangency point along the frontier path.
  pub fn max_sharpe(&self, risk_free: f64) -> Result<Vec<f64>, SolverError> {
    if !self.mu.iter().any(|m| *m > risk_free) {
      return Err(SolverError::Infeasible(format!(
        "no asset has an expected return above the risk-free rate {risk_free:.4}"
      )));
    }

    let t_max = self.t_max();
    let cost = NegativeSharpe {
      frontier: self,
      risk_free,
    };
    let solver = BrentOpt::new(0.0, t_max.ln_1p());
    let best_u = Executor::new(cost, solver)
      .configure(|state| state.max_iters(SEARCH_ITERS))
      .run()
      .map_err(|e| SolverError::Numerical(e.to_string()))?
      .state
      .best_param;

    let mut candidates = vec![self.solve_tradeoff(0.0), self.solve_tradeoff(t_max)];
    if let Some(u) = best_u {
      candidates.push(self.solve_tradeoff(u.exp_m1()));
    }
    let best = candidates
      .into_iter()
      .map(|w| (self.sharpe(&w, risk_free), w))
      .max_by(|a, b| a.0.total_cmp(&b.0))
      .map(|(_, w)| w)
      .ok_or_else(|| SolverError::Numerical("no frontier candidate".into()))?;
    Ok(best)
  }

  pub fn solve(&self, objective: Objective, risk_free: f64) -> Result<Vec<f64>, SolverError> {
    match objective {
      Objective::TargetReturn(r) => self.efficient_return(r),
      Objective::TargetRisk(s) => self.efficient_risk(s),
      Objective::MaxSharpe => self.max_sharpe(risk_free),
    }
  }

  /// Expected return, volatility and Sharpe ratio of `w`.
  pub fn performance(&self, w: &[f64], risk_free: f64) -> PortfolioResult {
    PortfolioResult {
      weights: w.to_vec(),
      expected_return: self.portfolio_return(w),
      volatility: self.portfolio_volatility(w),
      sharpe: self.sharpe(w, risk_free),
    }
  }
}

struct PathResidual<'a, F> {
  frontier: &'a EfficientFrontier,
  residual: F,
}

impl<F> CostFunction for PathResidual<'_, F>
where
  F: Fn(&[f64]) -> f64,
{
  type Param = f64;
  type Output = f64;

  fn cost(&self, t: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    let w = self.frontier.solve_tradeoff(t.max(0.0));
    Ok((self.residual)(&w))
  }
}

struct NegativeSharpe<'a> {
  frontier: &'a EfficientFrontier,
  risk_free: f64,
}

impl CostFunction for NegativeSharpe<'_> {
  type Param = f64;
  type Output = f64;

  fn cost(&self, u: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    let w = self.frontier.solve_tradeoff(u.max(0.0).exp_m1());
    Ok(-self.frontier.sharpe(&w, self.risk_free))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  fn three_assets() -> (Vec<f64>, Vec<Vec<f64>>) {
    let mu = vec![0.08, 0.12, 0.20];
    let cov = vec![
      vec![0.04, 0.006, 0.002],
      vec![0.006, 0.09, 0.01],
      vec![0.002, 0.01, 0.16],
    ];
    (mu, cov)
  }

  fn unpenalized(cap: f64) -> Constraints {
    Constraints {
      max_weight: cap,
      l2_gamma: 0.0,
    }
  }

  fn assert_feasible(w: &[f64], cap: f64) {
    assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-8);
    assert!(w.iter().all(|x| *x >= -1e-12 && *x <= cap + 1e-12));
  }

  #[test]
  fn projection_respects_bounds() {
    let w = project_capped_simplex(&[3.0, -1.0, 0.2, 0.1], 0.5);
    assert_feasible(&w, 0.5);
    assert_relative_eq!(w[0], 0.5, epsilon = 1e-12);

    let already = project_capped_simplex(&[0.25, 0.25, 0.25, 0.25], 0.4);
    for x in already {
      assert_relative_eq!(x, 0.25, epsilon = 1e-12);
    }
  }

  #[test]
  fn greedy_max_return_fills_best_assets() {
    let (mu, cov) = three_assets();
    let ef = EfficientFrontier::new(&mu, &cov, unpenalized(0.4)).unwrap();
    let w = ef.max_return_weights();
    assert_relative_eq!(w[0], 0.2, epsilon = 1e-12);
    assert_relative_eq!(w[1], 0.4, epsilon = 1e-12);
    assert_relative_eq!(w[2], 0.4, epsilon = 1e-12);
    assert_relative_eq!(ef.max_return(), 0.2 * 0.08 + 0.4 * 0.12 + 0.4 * 0.20, epsilon = 1e-12);
  }

  #[test]
  fn two_asset_minimum_variance_matches_closed_form() {
    let mu = vec![0.05, 0.10];
    let cov = vec![vec![0.04, 0.0], vec![0.0, 0.09]];
    let ef = EfficientFrontier::new(&mu, &cov, unpenalized(1.0)).unwrap();
    let w = ef.solve_tradeoff(0.0);
    assert_relative_eq!(w[0], 0.09 / 0.13, epsilon = 1e-6);
    assert_relative_eq!(w[1], 0.04 / 0.13, epsilon = 1e-6);
  }

  #[test]
  fn target_return_is_met_and_unreachable_target_is_infeasible() {
    let (mu, cov) = three_assets();
    let ef = EfficientFrontier::new(&mu, &cov, unpenalized(0.6)).unwrap();

    let w = ef.efficient_return(0.14).unwrap();
    assert_feasible(&w, 0.6);
    assert!(ef.portfolio_return(&w) >= 0.14 - 1e-6);

    match ef.efficient_return(0.5) {
      Err(SolverError::Infeasible(_)) => {}
      other => panic!("expected infeasible, got {other:?}"),
    }
  }

  #[test]
  fn target_risk_at_the_minimum_volatility_returns_the_minimum_variance_point() {
    let (mu, cov) = three_assets();
    let ef = EfficientFrontier::new(&mu, &cov, unpenalized(1.0)).unwrap();
    let w0 = ef.solve_tradeoff(0.0);
    let min_vol = ef.portfolio_volatility(&w0);

    let w = ef.efficient_risk(min_vol - 5e-13).unwrap();
    assert_eq!(w, w0);
    let w = ef.efficient_risk(min_vol).unwrap();
    assert_eq!(w, w0);
  }

  #[test]
  fn target_risk_caps_volatility() {
    let (mu, cov) = three_assets();
    let ef = EfficientFrontier::new(&mu, &cov, unpenalized(1.0)).unwrap();

    let w = ef.efficient_risk(0.25).unwrap();
    assert_feasible(&w, 1.0);
    assert!(ef.portfolio_volatility(&w) <= 0.25 + 1e-6);
    assert!(ef.portfolio_return(&w) > ef.portfolio_return(&ef.solve_tradeoff(0.0)));

    assert!(matches!(ef.efficient_risk(0.01), Err(SolverError::Infeasible(_))));
  }

  #[test]
  fn max_sharpe_beats_minimum_variance_and_needs_excess_return() {
    let (mu, cov) = three_assets();
    let ef = EfficientFrontier::new(&mu, &cov, unpenalized(1.0)).unwrap();
    let w = ef.max_sharpe(0.02).unwrap();
    assert_feasible(&w, 1.0);
    let min_var = ef.solve_tradeoff(0.0);
    assert!(ef.sharpe(&w, 0.02) >= ef.sharpe(&min_var, 0.02) - 1e-9);

    assert!(matches!(ef.max_sharpe(0.5), Err(SolverError::Infeasible(_))));
  }

  #[test]
  fn l2_penalty_spreads_weights() {
    let (mu, cov) = three_assets();
    let plain = EfficientFrontier::new(&mu, &cov, unpenalized(1.0)).unwrap();
    let spread = EfficientFrontier::new(
      &mu,
      &cov,
      Constraints {
        max_weight: 1.0,
        l2_gamma: 1.0,
      },
    )
    .unwrap();
    let sq = |w: &[f64]| w.iter().map(|x| x * x).sum::<f64>();
    assert!(sq(&spread.solve_tradeoff(1.0)) < sq(&plain.solve_tradeoff(1.0)));
  }

  #[test]
  fn cap_too_small_is_infeasible() {
    let (mu, cov) = three_assets();
    assert!(matches!(
      EfficientFrontier::new(&mu, &cov, unpenalized(0.2)),
      Err(SolverError::Infeasible(_))
    ));
    assert!(matches!(
      EfficientFrontier::new(&mu[..2], &cov, unpenalized(1.0)),
      Err(SolverError::Numerical(_))
    ));
  }
}
