//! # Autoregressive Forecast
//!
//! $$
//! r_t = c + \phi_1 r_{t-1} + \dots + \phi_p r_{t-p} + \epsilon_t,\qquad
//! \hat\mu = \sum_{h=1}^{H} \hat r_{T+h},\qquad
//! \hat\sigma = \max\big(\operatorname{sd}(\hat r_{T+1:T+H})\sqrt{H},\ \sigma_{\min}\big)
//! $$
//!
//! AR(p) with intercept on log-returns, order chosen by AIC. Falls back to a linear trend on
//! log-prices, then to a fixed default pair.

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use ndarray::Array1;
use tracing::debug;
use tracing::warn;

use super::Forecaster;
use super::ModelOutcome;
use crate::config::AutoregressiveConfig;
use crate::stats::linear_trend;
use crate::stats::ols;
use crate::stats::std_pop;
use crate::stats::valid_prices;

/// Expected horizon log-return and annualized volatility.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReturnEstimate {
  pub expected_return: f64,
  pub volatility: f64,
}

/// Fitted AR(p) model with intercept.
#[derive(Clone, Debug)]
pub struct ArFit {
  pub intercept: f64,
  /// AR coefficients `phi_1..phi_p`.
  pub phi: Array1<f64>,
  pub aic: f64,
}

impl ArFit {
  pub fn order(&self) -> usize {
    self.phi.len()
  }

  /// Fit AR(p) by OLS on the last `len - max_lag` observations so that AIC is comparable
  /// across orders.
  pub fn fit(x: &[f64], p: usize, max_lag: usize) -> Result<Self> {
    if p > max_lag || x.len() <= max_lag + p + 1 {
      bail!("not enough observations for AR({p})");
    }

    let mut y = Vec::with_capacity(x.len() - max_lag);
    let mut design = Vec::with_capacity(x.len() - max_lag);
    for t in max_lag..x.len() {
      let mut row = Vec::with_capacity(p + 1);
      row.push(1.0);
      for k in 1..=p {
        row.push(x[t - k]);
      }
      design.push(row);
      y.push(x[t]);
    }

    let fit = ols(&y, &design)?;
    Ok(Self {
      intercept: fit.beta[0],
      phi: Array1::from(fit.beta[1..].to_vec()),
      aic: fit.aic(),
    })
  }

  /// Select the order in `0..=max_order` minimizing AIC.
  pub fn select(x: &[f64], max_order: usize) -> Result<Self> {
    let mut best: Option<Self> = None;
    for p in 0..=max_order {
      match Self::fit(x, p, max_order) {
        Ok(fit) if best.as_ref().map_or(true, |b| fit.aic < b.aic) => best = Some(fit),
        Ok(_) => {}
        Err(err) => debug!(order = p, error = %err, "AR order skipped"),
      }
    }
    best.ok_or_else(|| anyhow!("no AR order could be fitted"))
  }

  /// Recursive `horizon`-step point forecast.
  pub fn forecast_path(&self, history: &[f64], horizon: usize) -> Array1<f64> {
    let p = self.order();
    let mut series: Vec<f64> = history[history.len().saturating_sub(p)..].to_vec();
    let offset = series.len();
    series.reserve(horizon);

    for t in offset..offset + horizon {
      let mut val = self.intercept;
      for k in 1..=p {
        if t >= k {
          val += self.phi[k - 1] * series[t - k];
        }
      }
      series.push(val);
    }

    Array1::from(series[offset..].to_vec())
  }
}

/// Ensemble member producing AR forecasts with its own fallback chain.
#[derive(Clone, Debug)]
pub struct AutoregressiveForecaster {
  cfg: AutoregressiveConfig,
  horizon: usize,
}

impl AutoregressiveForecaster {
  pub fn new(cfg: AutoregressiveConfig, horizon: usize) -> Self {
    Self { cfg, horizon }
  }

  fn fit_ar(&self, log_prices: &[f64]) -> Result<ReturnEstimate> {
    if log_prices.len() < self.cfg.min_history {
      bail!("insufficient history ({} prices)", log_prices.len());
    }

    let returns: Vec<f64> = log_prices.windows(2).map(|w| w[1] - w[0]).collect();
    let model = ArFit::select(&returns, self.cfg.max_order)?;
    let path = model.forecast_path(&returns, self.horizon);
    let expected_return = path.sum();
    let volatility = std_pop(path.as_slice().unwrap_or(&[])) * (self.horizon as f64).sqrt();

    if !expected_return.is_finite() || !volatility.is_finite() {
      bail!("AR forecast produced non-finite values");
    }
    debug!(order = model.order(), expected_return, "AR fit");

    Ok(ReturnEstimate {
      expected_return,
      volatility: volatility.max(self.cfg.min_volatility),
    })
  }

  fn fit_trend(&self, log_prices: &[f64]) -> Result<ReturnEstimate> {
    let (slope, intercept) = linear_trend(log_prices)?;
    let n = log_prices.len();
    let future = slope * (n + self.horizon) as f64 + intercept;
    let expected_return = future - log_prices[n - 1];

    let returns: Vec<f64> = log_prices.windows(2).map(|w| w[1] - w[0]).collect();
    let volatility = std_pop(&returns) * (self.horizon as f64).sqrt();
    if !expected_return.is_finite() || !volatility.is_finite() {
      bail!("trend forecast produced non-finite values");
    }

    Ok(ReturnEstimate {
      expected_return,
      volatility,
    })
  }

  /// Full estimate: AR, then log-price trend, then the configured default pair.
  pub fn estimate(&self, prices: &[f64]) -> (ReturnEstimate, Option<String>) {
    let prices = valid_prices(prices);
    let log_prices: Vec<f64> = prices.iter().map(|p| p.ln()).collect();

    let ar_err = match self.fit_ar(&log_prices) {
      Ok(est) => return (est, None),
      Err(err) => err,
    };

    match self.fit_trend(&log_prices) {
      Ok(est) => (est, Some(format!("AR failed ({ar_err}); used log-price trend"))),
      Err(trend_err) => {
        warn!(error = %trend_err, "AR and trend fallback failed, using default");
        (
          ReturnEstimate {
            expected_return: self.cfg.default_return,
            volatility: self.cfg.default_volatility,
          },
          Some(format!("AR failed ({ar_err}); trend failed ({trend_err})")),
        )
      }
    }
  }
}

impl Forecaster for AutoregressiveForecaster {
  fn name(&self) -> &'static str {
    "autoregressive"
  }

  fn forecast(&self, prices: &[f64]) -> ModelOutcome {
    match self.estimate(prices) {
      (est, None) => ModelOutcome::Fitted {
        value: est.expected_return,
      },
      (est, Some(reason)) => ModelOutcome::Degraded {
        value: est.expected_return,
        reason,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use rand::Rng;
  use rand::SeedableRng;
  use rand::rngs::StdRng;

  #[test]
  fn recovers_ar1_coefficient() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut x = vec![0.0; 2000];
    for t in 1..x.len() {
      let noise: f64 = rng.gen_range(-0.01..0.01);
      x[t] = 0.001 + 0.6 * x[t - 1] + noise;
    }
    let fit = ArFit::fit(&x, 1, 1).unwrap();
    assert_relative_eq!(fit.phi[0], 0.6, epsilon = 0.05);
  }

  #[test]
  fn forecast_path_converges_to_unconditional_mean() {
    let fit = ArFit {
      intercept: 0.001,
      phi: Array1::from(vec![0.5]),
      aic: 0.0,
    };
    let path = fit.forecast_path(&[0.05], 200);
    assert_relative_eq!(path[199], 0.002, epsilon = 1e-10);
  }

  #[test]
  fn constant_prices_give_zero_return_and_floored_volatility() {
    let f = AutoregressiveForecaster::new(AutoregressiveConfig::default(), 252);
    let (est, reason) = f.estimate(&vec![10.0; 120]);
    assert!(reason.is_none());
    assert_relative_eq!(est.expected_return, 0.0, epsilon = 1e-12);
    assert_eq!(est.volatility, 0.01);
  }

  #[test]
  fn short_history_uses_trend_then_default() {
    let f = AutoregressiveForecaster::new(AutoregressiveConfig::default(), 252);
    let prices: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
    assert!(matches!(f.forecast(&prices), ModelOutcome::Degraded { .. }));

    let (est, reason) = f.estimate(&[100.0]);
    assert!(reason.is_some());
    assert_eq!(est.expected_return, 0.05);
    assert_eq!(est.volatility, 0.15);
  }
}
